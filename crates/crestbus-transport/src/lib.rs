//! Transport implementations for crestbus.
//!
//! This crate turns a [`BusPort`](crestbus_core::BusPort) into the two
//! transports used on the bus:
//!
//! - [`HalfDuplexTransport`]: the master's queued transport with a receive
//!   task, a transmit task and break generation
//! - [`TimedTransport`]: the slave's transport, writing responses inside a
//!   fixed transmit-enable timing window
//!
//! and provides [`SerialBus`], the RS-485 port over a serial device.
//!
//! # Example
//!
//! ```no_run
//! use crestbus_transport::{HalfDuplexTransport, SerialBus, SerialConfig, TransportConfig};
//!
//! # async fn example() -> crestbus_core::Result<()> {
//! let bus = SerialBus::open("/dev/ttyUSB0", SerialConfig::master()).await?;
//! let transport = HalfDuplexTransport::new(Box::new(bus), TransportConfig::default());
//! transport.initialize()?;
//! transport.send_ping(0x0B).await?;
//! # Ok(())
//! # }
//! ```

pub mod half_duplex;
mod receive;
pub mod serial;
pub mod timed;

pub use half_duplex::{HalfDuplexTransport, TransportConfig};
pub use serial::{Parity, SerialBus, SerialConfig, StopBits};
pub use timed::{SlaveTiming, TimedTransport};
