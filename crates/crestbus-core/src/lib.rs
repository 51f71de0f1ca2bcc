//! crestbus-core: Core traits, types, and error definitions for crestbus.
//!
//! This crate defines what both ends of the half-duplex lighting bus share:
//! the physical port abstraction, frames, protocol constants, timing and
//! events. The master (`crestbus-master`) and slave (`crestbus-slave`) crates
//! build on these types without depending on each other.
//!
//! # Key types
//!
//! - [`BusPort`] -- the physical channel, split into [`BusReader`] / [`BusWriter`]
//! - [`Frame`] -- a silence-delimited run of bytes with a timestamp
//! - [`BusEvent`], [`DeviceEvent`], [`SwitchEvent`] -- broadcast notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod frame;
pub mod port;
pub mod protocol;
pub mod timing;
pub mod types;

// Re-export key types at crate root for ergonomic `use crestbus_core::*`.
pub use error::{Error, Result};
pub use events::{BusEvent, DeviceEvent, SwitchEvent, SwitchEventKind};
pub use frame::{Direction, Frame};
pub use port::{BusPort, BusReader, BusWriter};
pub use timing::precise_delay;
pub use types::*;
