//! Bus master for crestbus.
//!
//! The master owns the bus. It keeps a registry of known slaves, polls them
//! round-robin with pings, detects silent slaves and recovers the bus with a
//! break, runs per-device configuration sequences, and sends dim commands.
//!
//! - **Commands** ([`commands`]) -- outbound command values and dim frame
//!   encoding.
//! - **Queue** ([`queue`]) -- the bounded queue feeding the single command
//!   consumer.
//! - **Templates** ([`templates`]) -- configuration step sequences per
//!   device type.
//! - **Registry** ([`registry`]) -- per-slave state machine, polling
//!   schedule and statistics, free of any I/O.
//! - **BusMaster** ([`master`]) -- the tasks that tie the registry to a
//!   [`HalfDuplexTransport`](crestbus_transport::HalfDuplexTransport).
//! - **MasterBuilder** ([`builder`]) -- fluent construction.
//!
//! # Example
//!
//! ```
//! use crestbus_master::commands::DimCommand;
//!
//! let frame = DimCommand::short(0x0B, 1, 255, 500).encode();
//! assert_eq!(
//!     frame.as_ref(),
//!     &[0x0B, 0x08, 0x1D, 0x00, 0x01, 0xF4, 0x00, 0xFF, 0x01, 0xFF]
//! );
//! ```

pub mod builder;
pub mod commands;
pub mod master;
pub mod queue;
pub mod registry;
pub mod templates;

pub use builder::MasterBuilder;
pub use commands::{Command, DimCommand, DimVariant};
pub use master::{BusMaster, MasterTiming};
pub use registry::{RegistryConfig, RegistryStats, SlaveDescriptor, SlaveRegistry};
