use std::io::{self, Write};

use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;

/// Environment variable naming a file that receives the log instead of stderr.
pub const LOG_FILE_ENV: &str = "ATMUX_LOG_FILE";

/// Install the global logger. `RUST_LOG` filters as usual.
pub fn init_logging() {
    match std::env::var(LOG_FILE_ENV) {
        Ok(path) if !path.is_empty() => {
            if let Err(err) = init_file_logger(&path) {
                eprintln!("Failed to initialize file logger at '{path}': {err}");
                init_stderr_logger();
            }
        }
        _ => init_stderr_logger(),
    }
}

fn init_stderr_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn init_file_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    log::info!("File logger initialized at {path}");

    Ok(())
}
