//! Error types for crestbus.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, framing and
//! registry-level failures are all captured here.
//!
//! None of these errors is fatal. A failed send, a dropped frame or a lock
//! that could not be taken in time is also recorded in the owning
//! component's statistics, so callers that ignore the `Result` still see the
//! failure through the counters.

use crate::types::SlaveState;

/// The error type for all crestbus operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port, direction line, break control).
    #[error("transport error: {0}")]
    Transport(String),

    /// Timed out waiting for bytes on the bus.
    #[error("timeout waiting for data")]
    Timeout,

    /// An invalid parameter was passed to an operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The underlying port is closed or was never opened.
    #[error("not connected")]
    NotConnected,

    /// The component has not been initialized (or was deinitialized).
    #[error("not initialized")]
    NotInitialized,

    /// A bounded queue could not accept the item within its wait budget.
    #[error("queue full")]
    QueueFull,

    /// A bounded lock acquisition timed out.
    #[error("lock acquisition timed out")]
    LockTimeout,

    /// A frame payload exceeds the maximum frame length.
    #[error("frame too long: {len} bytes (max {max})")]
    FrameTooLong {
        /// Length of the rejected payload.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// A frame payload was empty.
    #[error("empty frame")]
    EmptyFrame,

    /// The address is not registered with the master.
    #[error("unknown slave 0x{0:02X}")]
    UnknownSlave(u8),

    /// The slave is not in a state that allows the requested operation.
    #[error("slave 0x{address:02X} is in state {state:?}")]
    InvalidState {
        /// Address of the slave.
        address: u8,
        /// State the slave was found in.
        state: SlaveState,
    },

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for data");
    }

    #[test]
    fn error_display_queue_full() {
        assert_eq!(Error::QueueFull.to_string(), "queue full");
    }

    #[test]
    fn error_display_lock_timeout() {
        assert_eq!(Error::LockTimeout.to_string(), "lock acquisition timed out");
    }

    #[test]
    fn error_display_frame_too_long() {
        let e = Error::FrameTooLong { len: 130, max: 128 };
        assert_eq!(e.to_string(), "frame too long: 130 bytes (max 128)");
    }

    #[test]
    fn error_display_unknown_slave() {
        let e = Error::UnknownSlave(0x0B);
        assert_eq!(e.to_string(), "unknown slave 0x0B");
    }

    #[test]
    fn error_display_invalid_state() {
        let e = Error::InvalidState {
            address: 0x11,
            state: SlaveState::Offline,
        };
        assert_eq!(e.to_string(), "slave 0x11 is in state Offline");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
