use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use serde::Serialize;

use super::config::GatewayConfig;
use crate::{
    core::{Gateway, MessagePump, PumpConfig},
    protocol::{
        http::{HttpClient, HttpResponse, Method, RequestHeader},
        mqtt::{InboundPublish, Message, MqttClient, QoS, Topic},
    },
    utils::{enumerate_ports, escape_bytes},
};

/// Interval between session health checks while listening.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct PortInfo<'a> {
    #[serde(rename = "path")]
    port_name: &'a str,
    kind: &'a str,
}

#[derive(Serialize)]
struct ProbeReport {
    state: String,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
}

#[derive(Serialize)]
struct HttpReport<'a> {
    #[serde(flatten)]
    response: HttpResponse,
    body: &'a str,
}

#[derive(Serialize)]
struct InboundReport<'a> {
    socket: u8,
    msg_id: u16,
    topic: &'a str,
    payload: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Handle commands that never touch the modem. Returns true when one ran.
pub fn run_one_shot_actions(matches: &ArgMatches) -> Result<bool> {
    if !matches.get_flag("list-ports") {
        return Ok(false);
    }
    let ports = enumerate_ports();
    if matches.get_flag("json") {
        let out: Vec<PortInfo> = ports
            .iter()
            .map(|(port_name, kind)| PortInfo { port_name, kind })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if ports.is_empty() {
        eprintln!("No serial ports found");
    } else {
        for (name, kind) in &ports {
            println!("{name}\t{kind}");
        }
    }
    Ok(true)
}

/// Load the configuration named on the command line, with flag overrides.
pub fn load_config(matches: &ArgMatches) -> Result<GatewayConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => GatewayConfig::from_file(path)?,
        None => {
            log::info!("No configuration file given, using defaults");
            GatewayConfig::default()
        }
    };
    config.apply_overrides(
        matches.get_one::<String>("port").map(String::as_str),
        matches.get_one::<u32>("baud-rate").copied(),
    );
    Ok(config)
}

/// Bring the gateway up and run the requested action.
pub fn run_gateway(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let gateway = Gateway::open(&config)?;
    let result = gateway
        .bring_up()
        .and_then(|()| dispatch(matches, &gateway));
    gateway.shutdown();
    result
}

fn dispatch(matches: &ArgMatches, gateway: &Gateway) -> Result<()> {
    let json = matches.get_flag("json");

    if let Some(topic) = matches.get_one::<String>("publish") {
        let mqtt = require_mqtt(gateway)?;
        return publish_once(mqtt, matches, topic);
    }
    if matches.get_flag("listen") {
        let mqtt = require_mqtt(gateway)?;
        return listen(gateway, Arc::clone(mqtt), json);
    }
    if let Some(url) = matches.get_one::<String>("http-get") {
        let http = require_http(gateway)?;
        let header = RequestHeader::from_url(Method::Get, url)?;
        let response = http
            .get(&header)
            .with_context(|| format!("GET {url} failed"))?;
        return print_http(http, response, json);
    }
    if let Some(url) = matches.get_one::<String>("http-post") {
        let http = require_http(gateway)?;
        let body = matches
            .get_one::<String>("data")
            .ok_or_else(|| anyhow!("--http-post needs --data"))?;
        let mut header = RequestHeader::from_url(Method::Post, url)?;
        if let Some(content_type) = matches.get_one::<String>("content-type") {
            header = header.with_content_type(content_type.clone());
        }
        let response = http
            .post(&header, body.as_bytes())
            .with_context(|| format!("POST {url} failed"))?;
        return print_http(http, response, json);
    }

    let device = gateway.device();
    let report = ProbeReport {
        state: device.state().to_string(),
        healthy: device.is_healthy(),
        ip: device.ip_address(),
    };
    if json {
        print_json(&report)
    } else {
        println!(
            "state: {}\nhealthy: {}\nip: {}",
            report.state,
            report.healthy,
            report.ip.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}

fn require_mqtt(gateway: &Gateway) -> Result<&Arc<MqttClient>> {
    gateway
        .mqtt()
        .ok_or_else(|| anyhow!("configuration has no [mqtt] section"))
}

fn require_http(gateway: &Gateway) -> Result<&Arc<HttpClient>> {
    gateway
        .http()
        .ok_or_else(|| anyhow!("configuration has no [http] section"))
}

fn publish_once(mqtt: &MqttClient, matches: &ArgMatches, topic: &str) -> Result<()> {
    let topic = Topic::from_str(topic).map_err(|_| anyhow!("unknown topic {topic:?}"))?;
    let qos = matches.get_one::<u8>("qos").copied().unwrap_or(1);
    let qos = QoS::try_from(qos).map_err(|_| anyhow!("invalid qos {qos}"))?;
    let payload = matches
        .get_one::<String>("data")
        .ok_or_else(|| anyhow!("--publish needs --data"))?;
    let msg_id = match qos {
        QoS::AtMostOnce => 0,
        _ => mqtt.next_msg_id(),
    };
    let message = Message::new()
        .with_socket(mqtt.socket())
        .with_msg_id(msg_id)
        .with_qos(qos)
        .with_retain(matches.get_flag("retain"))
        .with_topic(topic)
        .with_payload(payload.clone().into_bytes());
    mqtt.publish(&message)
        .with_context(|| format!("Publish to {topic} failed"))?;
    log::info!("Published message {msg_id} to {topic}");
    Ok(())
}

fn print_http(http: &HttpClient, response: HttpResponse, json: bool) -> Result<()> {
    let body = http.retrieve_string().context("Reading response body failed")?;
    if json {
        print_json(&HttpReport {
            response,
            body: &body,
        })
    } else {
        eprintln!("HTTP {}", response.status);
        println!("{body}");
        Ok(())
    }
}

fn print_inbound(publish: &InboundPublish, json: bool) -> Result<()> {
    let payload = String::from_utf8(publish.payload.to_vec())
        .unwrap_or_else(|_| escape_bytes(&publish.payload));
    if json {
        print_json(&InboundReport {
            socket: publish.socket,
            msg_id: publish.msg_id,
            topic: &publish.topic,
            payload,
        })
    } else {
        println!("{} {payload}", publish.topic);
        Ok(())
    }
}

fn listen(gateway: &Gateway, mqtt: Arc<MqttClient>, json: bool) -> Result<()> {
    let (stop_tx, stop_rx) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut pump = MessagePump::start(mqtt, PumpConfig::default())?;
    let mut last_check = Instant::now();
    log::info!("Listening for inbound messages, Ctrl-C to stop");
    let outcome = loop {
        if stop_rx.try_recv().is_ok() {
            break Ok(());
        }
        match pump.inbound().recv_timeout(Duration::from_millis(200)) {
            Ok(publish) => {
                if let Err(err) = print_inbound(&publish, json) {
                    break Err(err);
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => {
                break Err(anyhow!("message pump stopped unexpectedly"));
            }
        }
        if last_check.elapsed() >= HEALTH_CHECK_INTERVAL {
            last_check = Instant::now();
            if !gateway.is_healthy() {
                log::warn!("Gateway session unhealthy, recovering");
                if let Err(err) = gateway.recover() {
                    break Err(err);
                }
            }
        }
    };
    pump.stop();
    outcome
}

/// Entry point of the command line binary.
pub fn run(matches: &ArgMatches) -> Result<()> {
    if run_one_shot_actions(matches)? {
        return Ok(());
    }
    if matches.get_one::<String>("data").is_some()
        && matches.get_one::<String>("publish").is_none()
        && matches.get_one::<String>("http-post").is_none()
    {
        bail!("--data is only used with --publish or --http-post");
    }
    run_gateway(matches)
}
