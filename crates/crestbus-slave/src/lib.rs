//! Bus slave for crestbus.
//!
//! Emulates one addressed device on the bus:
//!
//! - **ProtocolHandler** ([`handler`]) -- answers pings and switch commands
//!   addressed to the device through the timed transport.
//! - **Switch input** ([`debounce`]) -- debounces a physical input into
//!   press, release, long-press and double-click events; every release
//!   toggles the device's switch state.
//! - **SlaveBuilder** ([`builder`]) -- fluent construction of a [`BusSlave`].
//!
//! # Example
//!
//! ```
//! use crestbus_slave::handler::{classify, Request};
//!
//! assert_eq!(classify(0x22, &[0x22, 0x00]), Request::Ping);
//! assert_eq!(
//!     classify(0x22, &[0x22, 0x03, 0x00, 0x00, 0x80]),
//!     Request::Switch { on: false }
//! );
//! ```

pub mod builder;
pub mod debounce;
pub mod handler;
pub mod slave;

pub use builder::SlaveBuilder;
pub use debounce::{
    DebounceConfig, ManualSwitch, SwitchDebouncer, SwitchHandler, SwitchInput, SwitchStats,
};
pub use handler::{HandlerStats, ProtocolHandler, Request};
pub use slave::BusSlave;
