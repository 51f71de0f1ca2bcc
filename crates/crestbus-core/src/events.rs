//! Event types broadcast by the master, the slave handler and the switch
//! debouncer.
//!
//! Events are delivered through [`tokio::sync::broadcast`] channels on a
//! best-effort basis: a slow subscriber may lag and miss events, but no
//! producer ever blocks on a subscriber. Status displays and tests subscribe
//! to these instead of registering callbacks.

use crate::types::{ConfigStep, DeviceState, SlaveState};

/// An event emitted by the bus master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A slave moved from one liveness/configuration state to another.
    SlaveStateChanged {
        address: u8,
        from: SlaveState,
        to: SlaveState,
    },

    /// A ping went unanswered past the liveness timeout.
    PingTimeout {
        address: u8,
        /// The slave's error counter after the timeout was recorded.
        error_count: u8,
    },

    /// A bus-recovery break was emitted.
    BreakSent,

    /// A ping response arrived with no ping outstanding.
    UnmatchedResponse,

    /// One configuration step was handed to the transport.
    ConfigStepSent { address: u8, step: ConfigStep },

    /// A configuration sequence ran to completion.
    ConfigurationComplete { address: u8 },

    /// A configuration sequence stopped at `step` and was abandoned.
    ConfigurationAborted { address: u8, step: ConfigStep },

    /// Round-robin polling was switched on or off.
    PollingChanged { enabled: bool },
}

/// An event emitted by the slave-side protocol handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A ping addressed to this device was answered.
    PingAnswered,

    /// A switch command was applied and acknowledged.
    SwitchCommand { on: bool },

    /// The logical switch state changed (from the bus or the local input).
    SwitchStateChanged { on: bool },

    /// A frame did not match any known command.
    UnknownFrame { len: usize },

    /// The device state changed.
    StateChanged { from: DeviceState, to: DeviceState },
}

/// Kind of a debounced switch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEventKind {
    Press,
    Release,
    LongPress,
    DoubleClick,
}

/// A debounced switch event together with the logical switch state at the
/// time it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchEvent {
    pub kind: SwitchEventKind,
    /// Logical (toggled) switch state, not the physical level.
    pub switch_on: bool,
}
