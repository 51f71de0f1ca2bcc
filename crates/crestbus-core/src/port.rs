//! Bus port traits for the half-duplex serial link.
//!
//! A [`BusPort`] abstracts the physical RS-485 channel: one shared wire pair
//! plus a transmit-enable (direction) line. Implementations exist for serial
//! ports (`crestbus-transport`) and for the in-memory `MockBus` in
//! `crestbus-test-harness`.
//!
//! The port is split into a [`BusReader`] and a [`BusWriter`] so that the
//! receive loop and the transmit side can own their halves independently.
//! Neither half adds framing: this protocol has no length prefix and no
//! checksum, so frame boundaries are decided by the caller from read timeouts.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Receiving half of a bus port.
#[async_trait]
pub trait BusReader: Send {
    /// Read whatever bytes are available into `buf`.
    ///
    /// Waits up to `timeout` for at least one byte; returns
    /// [`Error::Timeout`](crate::error::Error::Timeout) if the line stays
    /// quiet for the whole period.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// Transmitting half of a bus port, including the direction and break lines.
#[async_trait]
pub trait BusWriter: Send {
    /// Write bytes to the line. Returns the number of bytes accepted, which
    /// may be short.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Wait until the hardware has shifted every written byte onto the wire.
    async fn wait_tx_done(&mut self, timeout: Duration) -> Result<()>;

    /// Drive the transceiver's transmit-enable line.
    ///
    /// `true` turns the driver on (transmit), `false` returns the
    /// transceiver to receive.
    fn set_tx_enable(&mut self, enable: bool) -> Result<()>;

    /// Hold the TX line at logic 0 (`true`) or release it (`false`).
    fn set_break(&mut self, asserted: bool) -> Result<()>;
}

/// A physical half-duplex channel that can be split into its two halves.
pub trait BusPort: Send {
    /// Human-readable name of the port for logging (e.g. `/dev/ttyUSB0`).
    fn name(&self) -> &str;

    /// Split into independently owned receive and transmit halves.
    fn split(self: Box<Self>) -> (Box<dyn BusReader>, Box<dyn BusWriter>);
}
