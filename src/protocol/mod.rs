pub mod codes;
pub mod device;
pub mod error;
pub mod hal;
pub mod http;
pub mod mqtt;
pub mod response;
pub mod ring_buffer;
pub mod transport;
pub mod urc;

pub use error::{ErrorKind, ModemError, Result};
