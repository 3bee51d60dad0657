use serde::{Deserialize, Serialize};

use crate::protocol::error::{ModemError, Result};

/// Highest socket id the modem firmware multiplexes.
pub const MAX_SOCKET: u8 = 5;
/// Highest security context id accepted by `AT+QSSLCFG`.
pub const MAX_SSL_CONTEXT: u8 = 5;

/// MQTT protocol level sent in CONNECT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttVersion {
    /// MQTT 3.1
    V3_1,
    /// MQTT 3.1.1
    #[default]
    V3_1_1,
}

impl MqttVersion {
    /// Value of the `"version"` configuration item.
    pub fn level(self) -> u8 {
        match self {
            MqttVersion::V3_1 => 3,
            MqttVersion::V3_1_1 => 4,
        }
    }
}

/// Broker connection parameters, fixed for the lifetime of a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSession {
    /// Modem-side socket id (0..=5)
    #[serde(default)]
    pub socket: u8,
    /// Broker host name or address
    pub host: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client identifier sent in CONNECT
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive_s")]
    pub keepalive_s: u16,
    /// Security context used for TLS, plain TCP when absent
    #[serde(default)]
    pub ssl_context: Option<u8>,
    #[serde(default)]
    pub version: MqttVersion,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Prefix under which closed-set topics are rendered
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive_s() -> u16 {
    120
}

fn default_clean_session() -> bool {
    true
}

fn default_topic_root() -> String {
    "gateway".to_string()
}

impl BrokerSession {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            socket: 0,
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keepalive_s: default_keepalive_s(),
            ssl_context: None,
            version: MqttVersion::default(),
            clean_session: default_clean_session(),
            topic_root: default_topic_root(),
        }
    }

    pub fn with_socket(mut self, socket: u8) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_ssl_context(mut self, context: u8) -> Self {
        self.ssl_context = Some(context);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket > MAX_SOCKET {
            return Err(ModemError::invalid(format!(
                "mqtt socket {} out of range 0..={MAX_SOCKET}",
                self.socket
            )));
        }
        if self.host.is_empty() || self.host.contains('"') {
            return Err(ModemError::invalid(format!("broker host {:?}", self.host)));
        }
        if self.client_id.is_empty() || self.client_id.len() > 256 || self.client_id.contains('"') {
            return Err(ModemError::invalid(format!("client id {:?}", self.client_id)));
        }
        if self.ssl_context.is_some_and(|c| c > MAX_SSL_CONTEXT) {
            return Err(ModemError::invalid("ssl context out of range"));
        }
        if self.keepalive_s > 3600 {
            return Err(ModemError::invalid("keep-alive above 3600 s"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ModemError::invalid("password without username"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let session: BrokerSession =
            serde_json::from_str(r#"{"host":"broker.local","client_id":"gw-1"}"#).unwrap();
        assert_eq!(session.port, 1883);
        assert_eq!(session.keepalive_s, 120);
        assert!(session.clean_session);
        assert_eq!(session.version.level(), 4);
        assert!(session.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let session = BrokerSession::new("broker.local", 8883, "gw-1");
        assert!(session.clone().with_socket(6).validate().is_err());
        assert!(session.clone().with_ssl_context(9).validate().is_err());
        let mut quoted = session.clone();
        quoted.client_id = "a\"b".into();
        assert!(quoted.validate().is_err());
        let mut lone_password = session;
        lone_password.password = Some("secret".into());
        assert!(lone_password.validate().is_err());
    }
}
