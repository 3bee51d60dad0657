//! MQTT over the modem's embedded client (`AT+QMT*`).

pub mod client;
pub mod message;
pub mod session;

pub use client::{MqttClient, MqttTiming, MAX_PAYLOAD, RETRANSMIT_CEILING};
pub use message::{InboundPublish, Message, QoS, Topic};
pub use session::{BrokerSession, MqttVersion};
