//! Hardware collaborators consumed by the modem stack.
//!
//! The stack only needs byte-level read/write on the serial channel, one
//! digital output wired to the modem's reset/power key, and one digital
//! input reporting modem health that can notify on edges.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::{
    io::{Read, Write},
    time::Duration,
};

use anyhow::Result;
use flume::Sender;
use serialport::{DataBits, Parity, SerialPort, StopBits};

/// Half-duplex byte channel to the modem.
///
/// Reads must return promptly (`Ok(0)` or a `TimedOut` error when nothing is
/// pending) so the transport's drain loop never starves writers.
pub trait SerialChannel: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialChannel for T {}

/// Digital output driving the modem reset / power key line.
pub trait OutputPin: Send {
    fn set_high(&mut self) -> Result<()>;
    fn set_low(&mut self) -> Result<()>;
}

/// Level change observed on the status input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEdge {
    Rising,
    Falling,
}

/// Digital input reporting modem health (high = modem powered and running).
pub trait StatusLine: Send + Sync {
    fn is_high(&self) -> bool;

    /// Deliver every subsequent edge into `edges`.
    ///
    /// Implementations call this from their interrupt context and must do
    /// nothing beyond a non-blocking send.
    fn subscribe(&self, edges: Sender<PinEdge>) -> Result<()>;
}

/// Output pin for boards where the reset line is not wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPin;

impl OutputPin for NoopPin {
    fn set_high(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_low(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Status input with a constant level, for modems without a status line
/// (for example USB dongles that are powered whenever they enumerate).
#[derive(Debug, Clone, Copy)]
pub struct FixedStatusLine(pub bool);

impl StatusLine for FixedStatusLine {
    fn is_high(&self) -> bool {
        self.0
    }

    fn subscribe(&self, _edges: Sender<PinEdge>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Read timeout of the underlying port; keeps each drain cycle short.
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_timeout: Duration::from_millis(10),
        }
    }
}

impl SerialConfig {
    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });
        b.parity(self.parity).timeout(self.read_timeout)
    }
}

/// Open a physical serial port as a [`SerialChannel`].
pub fn open_serial(port_name: &str, cfg: &SerialConfig) -> Result<Box<dyn SerialPort>> {
    let builder = cfg.apply_builder(serialport::new(port_name, cfg.baud));
    let port = builder.open()?;
    log::info!("Opened serial port {port_name} at {} baud", cfg.baud);
    Ok(port)
}
