//! Application layer on top of the protocol stack.
//!
//! - [`gateway`]: owns the device controller and protocol clients, runs the
//!   bring-up sequence and bounded recovery
//! - [`pump`]: queues between the MQTT client and the layers above

pub mod gateway;
pub mod pump;

pub use gateway::{Gateway, MAX_SESSION_RETRIES};
pub use pump::{MessagePump, PumpConfig, PumpEvent};
