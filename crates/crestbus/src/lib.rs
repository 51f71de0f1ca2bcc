//! # crestbus -- Half-Duplex Lighting Bus Emulation
//!
//! `crestbus` is an asynchronous Rust library that emulates both ends of a
//! proprietary lighting-control bus carried over RS-485: a **master** that
//! polls a fixed population of addressed slaves, tracks their liveness and
//! configuration, and sends dimmer commands; and a **slave** that answers
//! the master's polls and switch commands with strict transceiver timing.
//!
//! ## Quick Start
//!
//! ```no_run
//! use crestbus::DeviceType;
//! use crestbus::master::MasterBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let master = MasterBuilder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .default_slave(DeviceType::Dim8)
//!         .polling(true)
//!         .build()
//!         .await?;
//!
//!     master.send_dim_command(0x0B, 1, 255, 500).await?;
//!     println!("online: {:02X?}", master.get_online_slaves().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                    | Purpose                                                |
//! |--------------------------|--------------------------------------------------------|
//! | `crestbus-core`          | Port traits, frames, events, protocol and timing constants, errors |
//! | `crestbus-transport`     | Serial port, master half-duplex transport, slave timed transport |
//! | `crestbus-master`        | Slave registry, polling, configuration, dim commands   |
//! | `crestbus-slave`         | Protocol handler and switch debouncer                  |
//! | **`crestbus`**           | This facade crate -- re-exports everything             |
//!
//! ## Feature Flags
//!
//! | Feature  | Enables                      | Default |
//! |----------|------------------------------|---------|
//! | `master` | [`master`] module            | yes     |
//! | `slave`  | [`slave`] module             | yes     |
//!
//! ## Event Subscription
//!
//! The master broadcasts [`BusEvent`]s, the slave handler [`DeviceEvent`]s
//! and the switch input [`SwitchEvent`]s. Subscribers that fall behind lose
//! the oldest events; producers never block.
//!
//! ```no_run
//! use crestbus::BusEvent;
//! # async fn example(master: &crestbus::master::BusMaster) {
//! let mut events = master.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let BusEvent::SlaveStateChanged { address, from, to } = event {
//!         println!("0x{address:02X}: {from} -> {to}");
//!     }
//! }
//! # }
//! ```

pub use crestbus_core::*;

/// Transports and the serial port implementation.
pub mod transport {
    pub use crestbus_transport::*;
}

/// The bus master: registry, polling, configuration and dim commands.
///
/// Provides [`BusMaster`](master::BusMaster) and
/// [`MasterBuilder`](master::MasterBuilder).
#[cfg(feature = "master")]
pub mod master {
    pub use crestbus_master::*;
}

/// The emulated slave device and its switch input.
///
/// Provides [`BusSlave`](slave::BusSlave) and
/// [`SlaveBuilder`](slave::SlaveBuilder).
#[cfg(feature = "slave")]
pub mod slave {
    pub use crestbus_slave::*;
}
