use std::str::FromStr;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::protocol::error::{ModemError, Result};

/// Topics the gateway publishes or subscribes to, rendered under the
/// session's topic root.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Telemetry,
    Attributes,
    Status,
    Command,
    CommandReply,
    Config,
    Ota,
}

impl Topic {
    pub fn path(self, root: &str) -> String {
        if root.is_empty() {
            self.to_string()
        } else {
            format!("{}/{self}", root.trim_end_matches('/'))
        }
    }

    /// Reverse of [`path`](Self::path).
    pub fn resolve(root: &str, path: &str) -> Option<Topic> {
        let root = root.trim_end_matches('/');
        let leaf = if root.is_empty() {
            path
        } else {
            path.strip_prefix(root)?.strip_prefix('/')?
        };
        Topic::from_str(leaf).ok()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// A publish/subscribe unit. Fields are set incrementally; reading one that
/// was never set is a contract violation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    socket: Option<u8>,
    msg_id: Option<u16>,
    qos: Option<QoS>,
    retain: Option<bool>,
    topic: Option<Topic>,
    payload: Option<Bytes>,
}

fn required<T: Clone>(value: &Option<T>, field: &str) -> Result<T> {
    value
        .clone()
        .ok_or_else(|| ModemError::ContractViolation(format!("message {field} read before set")))
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket(mut self, socket: u8) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn with_msg_id(mut self, msg_id: u16) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn set_msg_id(&mut self, msg_id: u16) {
        self.msg_id = Some(msg_id);
    }

    pub fn socket(&self) -> Result<u8> {
        required(&self.socket, "socket")
    }

    pub fn msg_id(&self) -> Result<u16> {
        required(&self.msg_id, "message id")
    }

    pub fn has_msg_id(&self) -> bool {
        self.msg_id.is_some()
    }

    pub fn qos(&self) -> Result<QoS> {
        required(&self.qos, "qos")
    }

    pub fn retain(&self) -> Result<bool> {
        required(&self.retain, "retain flag")
    }

    pub fn topic(&self) -> Result<Topic> {
        required(&self.topic, "topic")
    }

    pub fn payload(&self) -> Result<Bytes> {
        required(&self.payload, "payload")
    }
}

/// A `+QMTRECV` delivery as handed to the layers above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPublish {
    pub socket: u8,
    pub msg_id: u16,
    pub topic: String,
    pub payload: Bytes,
}

impl InboundPublish {
    /// Convert into a [`Message`] when the topic belongs to the closed set under `root`.
    pub fn to_message(&self, root: &str) -> Option<Message> {
        let topic = Topic::resolve(root, &self.topic)?;
        Some(
            Message::new()
                .with_socket(self.socket)
                .with_msg_id(self.msg_id)
                .with_topic(topic)
                .with_payload(self.payload.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_field_fails_fast() {
        let message = Message::new().with_topic(Topic::Telemetry);
        assert_eq!(message.topic().unwrap(), Topic::Telemetry);
        assert!(matches!(
            message.payload(),
            Err(ModemError::ContractViolation(_))
        ));
        assert!(!message.has_msg_id());
    }

    #[test]
    fn test_topic_paths() {
        assert_eq!(Topic::CommandReply.path("site/gw-1/"), "site/gw-1/command_reply");
        assert_eq!(Topic::resolve("site/gw-1", "site/gw-1/ota"), Some(Topic::Ota));
        assert_eq!(Topic::resolve("site/gw-1", "other/ota"), None);
        assert_eq!(Topic::resolve("", "config"), Some(Topic::Config));
    }

    #[test]
    fn test_qos_codes() {
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
        assert!(QoS::try_from(3u8).is_err());
        let qos: QoS = serde_json::from_str("1").unwrap();
        assert_eq!(qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_inbound_outside_closed_set() {
        let inbound = InboundPublish {
            socket: 0,
            msg_id: 1,
            topic: "gateway/unknown".into(),
            payload: Bytes::from_static(b"{}"),
        };
        assert!(inbound.to_message("gateway").is_none());
    }
}
