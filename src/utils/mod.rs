//! Shared utilities for atmux
//!
//! General-purpose helpers used across the protocol stack and the CLI:
//! - Monotonic deadlines for bounded polling loops
//! - Printable rendering of wire bytes for logs
//! - Serial port enumeration

pub mod format;
pub mod ports;
pub mod sleep;

pub use format::*;
pub use ports::*;
pub use sleep::*;
