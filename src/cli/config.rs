use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::{
    device::{AuthMode, ConnectParams, DeviceTiming},
    hal::SerialConfig,
    http::HttpSettings,
    mqtt::{BrokerSession, Message, QoS, Topic},
    transport::TransportConfig,
};

/// Serial link to the modem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSection {
    /// Port name, e.g. `/dev/ttyUSB2` or `COM5`
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Capacity of the receive ring buffer in bytes
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Sleep between drain cycles in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyUSB2".to_string()
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_buffer_capacity() -> usize {
    4096
}

fn default_poll_interval_ms() -> u64 {
    5
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            buffer_capacity: default_buffer_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Cellular data context and modem timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemSection {
    /// Access point name; empty lets the network pick one
    #[serde(default)]
    pub apn: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default = "default_context_id")]
    pub context_id: u8,
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,
    #[serde(default = "default_reach_retries")]
    pub reach_retries: u32,
    #[serde(default = "default_reach_backoff_ms")]
    pub reach_backoff_ms: u64,
    #[serde(default = "default_registration_retries")]
    pub registration_retries: u32,
    #[serde(default = "default_activation_timeout_ms")]
    pub activation_timeout_ms: u64,
    /// Bounded wait for the command channel
    #[serde(default = "default_mutex_timeout_ms")]
    pub mutex_timeout_ms: u64,
    /// Bounded wait for the serial link lock
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Status-line edges closer than this are merged
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_reset_pulse_ms")]
    pub reset_pulse_ms: u64,
}

fn default_context_id() -> u8 {
    1
}

fn default_boot_timeout_ms() -> u64 {
    15_000
}

fn default_reach_retries() -> u32 {
    3
}

fn default_reach_backoff_ms() -> u64 {
    1000
}

fn default_registration_retries() -> u32 {
    10
}

fn default_activation_timeout_ms() -> u64 {
    150_000
}

fn default_mutex_timeout_ms() -> u64 {
    5000
}

fn default_write_timeout_ms() -> u64 {
    100
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_reset_pulse_ms() -> u64 {
    500
}

impl Default for ModemSection {
    fn default() -> Self {
        Self {
            apn: String::new(),
            username: String::new(),
            password: String::new(),
            auth: AuthMode::default(),
            context_id: default_context_id(),
            boot_timeout_ms: default_boot_timeout_ms(),
            reach_retries: default_reach_retries(),
            reach_backoff_ms: default_reach_backoff_ms(),
            registration_retries: default_registration_retries(),
            activation_timeout_ms: default_activation_timeout_ms(),
            mutex_timeout_ms: default_mutex_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            reset_pulse_ms: default_reset_pulse_ms(),
        }
    }
}

/// Topic the gateway subscribes to after connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: Topic,
    #[serde(default)]
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSection {
    #[serde(flatten)]
    pub session: BrokerSession,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

/// Root configuration of a gateway
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub serial: SerialSection,
    #[serde(default)]
    pub modem: ModemSection,
    #[serde(default)]
    pub mqtt: Option<MqttSection>,
    #[serde(default)]
    pub http: Option<HttpSettings>,
}

impl GatewayConfig {
    /// Load from `path`; `.toml` files are parsed as TOML, anything else as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            Self::from_toml(&text)
        } else {
            Self::from_json(&text)
        };
        parsed.with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Command line values win over the file.
    pub fn apply_overrides(&mut self, port: Option<&str>, baud_rate: Option<u32>) {
        if let Some(port) = port {
            self.serial.port = port.to_string();
        }
        if let Some(baud_rate) = baud_rate {
            self.serial.baud_rate = baud_rate;
        }
    }

    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            baud: self.serial.baud_rate,
            ..SerialConfig::default()
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            buffer_capacity: self.serial.buffer_capacity,
            poll_interval: Duration::from_millis(self.serial.poll_interval_ms),
            lock_timeout: Duration::from_millis(self.modem.write_timeout_ms),
            ..TransportConfig::default()
        }
    }

    pub fn device_timing(&self) -> DeviceTiming {
        let m = &self.modem;
        DeviceTiming {
            mutex_wait: Duration::from_millis(m.mutex_timeout_ms),
            boot_timeout: Duration::from_millis(m.boot_timeout_ms),
            reach_retries: m.reach_retries,
            reach_backoff: Duration::from_millis(m.reach_backoff_ms),
            registration_retries: m.registration_retries,
            activation_timeout: Duration::from_millis(m.activation_timeout_ms),
            debounce: Duration::from_millis(m.debounce_ms),
            reset_pulse: Duration::from_millis(m.reset_pulse_ms),
            ..DeviceTiming::default()
        }
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            apn: self.modem.apn.clone(),
            username: self.modem.username.clone(),
            password: self.modem.password.clone(),
            auth: self.modem.auth,
            context_id: self.modem.context_id,
        }
    }
}

impl MqttSection {
    /// Subscribe messages for the configured topics, ids drawn from `next_id`.
    pub fn subscribe_messages(&self, mut next_id: impl FnMut() -> u16) -> Vec<Message> {
        self.subscriptions
            .iter()
            .map(|sub| {
                Message::new()
                    .with_socket(self.session.socket)
                    .with_msg_id(next_id())
                    .with_qos(sub.qos)
                    .with_topic(sub.topic)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_with_defaults() {
        let config = GatewayConfig::from_toml(
            r#"
            [serial]
            port = "/dev/ttyAMA0"

            [modem]
            apn = "iot.example"
            auth = "chap"

            [mqtt]
            host = "broker.local"
            client_id = "gw-7"
            subscriptions = [{ topic = "command", qos = 1 }]
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.modem.auth, AuthMode::Chap);
        assert_eq!(config.modem.reach_retries, 3);
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.session.port, 1883);
        assert_eq!(mqtt.subscriptions[0].topic, Topic::Command);
        assert_eq!(mqtt.subscriptions[0].qos, QoS::AtLeastOnce);
        assert!(config.http.is_none());
    }

    #[test]
    fn test_json_and_overrides() {
        let mut config = GatewayConfig::from_json(
            r#"{"modem":{"apn":"internet","boot_timeout_ms":250},"http":{"request_header_mode":true}}"#,
        )
        .unwrap();
        config.apply_overrides(Some("COM9"), Some(9600));
        assert_eq!(config.serial.port, "COM9");
        assert_eq!(config.serial_config().baud, 9600);
        assert_eq!(config.device_timing().boot_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_params().apn, "internet");
        assert!(config.http.unwrap().request_header_mode);
    }

    #[test]
    fn test_subscribe_messages_take_fresh_ids() {
        let section = MqttSection {
            session: BrokerSession::new("broker.local", 1883, "gw").with_socket(2),
            subscriptions: vec![
                Subscription { topic: Topic::Command, qos: QoS::AtLeastOnce },
                Subscription { topic: Topic::Config, qos: QoS::AtMostOnce },
            ],
        };
        let mut id = 40;
        let messages = section.subscribe_messages(|| {
            id += 1;
            id
        });
        assert_eq!(messages[1].msg_id().unwrap(), 42);
        assert_eq!(messages[1].socket().unwrap(), 2);
        assert_eq!(messages[0].topic().unwrap(), Topic::Command);
    }
}
