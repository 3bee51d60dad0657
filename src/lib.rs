//! atmux: AT-command modem communication core for cellular edge gateways
//!
//! The crate drives a cellular modem over a half-duplex serial link and
//! exposes MQTT and HTTP clients built on the modem's embedded stacks.
//!
//! - [`protocol`]: ring buffer, transport, device controller and the
//!   MQTT/HTTP clients
//! - [`core`]: gateway wiring, bring-up and recovery, message pump
//! - [`cli`]: command line front end and configuration files
//!
//! Hardware is reached only through the traits in [`protocol::hal`], so the
//! whole stack runs against the scripted modem in `protocol::hal::mock`
//! (built for tests and with the `mock` feature).

#[doc(hidden)]
pub mod boot;
pub mod cli;
pub mod core;
pub mod protocol;
pub mod utils;

pub use protocol::{ErrorKind, ModemError, Result};
