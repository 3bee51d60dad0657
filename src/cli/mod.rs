pub mod actions;
pub mod config;

use clap::{Arg, ArgMatches, Command};

fn command() -> Command {
    Command::new("atmux")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drive an AT-command cellular modem: bring-up, MQTT and HTTP")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Gateway configuration file (.toml or .json)")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Modem serial port, overrides the configuration file")
                .value_name("PORT"),
        )
        .arg(
            Arg::new("baud-rate")
                .long("baud-rate")
                .help("Serial port baud rate, overrides the configuration file")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Output results in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("probe")
                .long("probe")
                .help("Bring the modem online and report its state")
                .action(clap::ArgAction::SetTrue)
                .conflicts_with_all(["publish", "listen", "http-get", "http-post"]),
        )
        .arg(
            Arg::new("publish")
                .long("publish")
                .help("Publish --data to a gateway topic (telemetry, attributes, status, ...)")
                .value_name("TOPIC")
                .requires("data")
                .conflicts_with_all(["listen", "http-get", "http-post"]),
        )
        .arg(
            Arg::new("qos")
                .long("qos")
                .help("QoS level for --publish")
                .value_name("QOS")
                .default_value("1")
                .value_parser(clap::value_parser!(u8).range(0..=2)),
        )
        .arg(
            Arg::new("retain")
                .long("retain")
                .help("Set the retain flag for --publish")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Print inbound MQTT messages until Ctrl-C (JSONL with --json)")
                .action(clap::ArgAction::SetTrue)
                .conflicts_with_all(["http-get", "http-post"]),
        )
        .arg(
            Arg::new("http-get")
                .long("http-get")
                .help("Send an HTTP GET through the modem and print the body")
                .value_name("URL")
                .conflicts_with("http-post"),
        )
        .arg(
            Arg::new("http-post")
                .long("http-post")
                .help("POST --data through the modem and print the response body")
                .value_name("URL")
                .requires("data"),
        )
        .arg(
            Arg::new("content-type")
                .long("content-type")
                .help("Content type of the --http-post body")
                .value_name("TYPE")
                .default_value("application/json"),
        )
        .arg(
            Arg::new("data")
                .long("data")
                .short('d')
                .help("Payload for --publish or body for --http-post")
                .value_name("PAYLOAD"),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_requires_data() {
        assert!(command()
            .try_get_matches_from(["atmux", "--publish", "telemetry"])
            .is_err());
        let matches = command()
            .try_get_matches_from(["atmux", "--publish", "telemetry", "-d", "{}", "--qos", "0"])
            .unwrap();
        assert_eq!(matches.get_one::<u8>("qos"), Some(&0));
    }

    #[test]
    fn test_actions_are_exclusive() {
        assert!(command()
            .try_get_matches_from(["atmux", "--probe", "--listen"])
            .is_err());
        assert!(command()
            .try_get_matches_from(["atmux", "--qos", "3", "--probe"])
            .is_err());
    }
}
