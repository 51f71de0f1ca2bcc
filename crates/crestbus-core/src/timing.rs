//! Protocol timing constants and the precise-delay primitive.
//!
//! The bus has no arbitration. Transceiver direction changes must respect
//! fixed settle times, and the break used for bus recovery must last an
//! exact number of microseconds. A scheduler sleep cannot deliver either, so
//! [`precise_delay`] busy-waits against the monotonic clock.

use std::time::{Duration, Instant};

/// Line rate shared by master and slaves.
pub const BAUD_RATE: u32 = 38_400;

/// Interval between two round-robin polling ticks.
pub const PING_INTERVAL: Duration = Duration::from_millis(23);

/// Time a slave has to answer a ping before it is considered offline.
pub const PING_TIMEOUT: Duration = Duration::from_millis(4);

/// Gap between two steps of a configuration sequence.
pub const CONFIG_STEP_DELAY: Duration = Duration::from_millis(2);

/// Pause after a dim command before the next command goes out.
pub const INTER_COMMAND_DELAY: Duration = Duration::from_millis(4);

/// Duration the TX line is held low for a bus-recovery break.
pub const BREAK_DURATION: Duration = Duration::from_micros(260);

/// Recovery time after a break before releasing transmit-enable.
pub const BREAK_RECOVERY: Duration = Duration::from_millis(1);

/// Master: settle time after asserting transmit-enable.
pub const TX_ENABLE_SETTLE: Duration = Duration::from_micros(10);

/// Master: settle time after returning to receive.
pub const RX_ENABLE_SETTLE: Duration = Duration::from_micros(5);

/// Slave: wait before asserting transmit-enable.
pub const PRE_TRANSMIT_DELAY: Duration = Duration::from_micros(100);

/// Slave: hold after asserting transmit-enable before the first byte.
pub const TRANSMIT_ENABLE_DELAY: Duration = Duration::from_micros(600);

/// Slave: hold after the last byte before releasing transmit-enable.
pub const POST_TRANSMIT_DELAY: Duration = Duration::from_micros(350);

/// How long the receive loop waits for the first byte of a frame.
pub const RX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Quiet period that ends an inbound frame.
pub const FRAME_GAP: Duration = Duration::from_millis(2);

/// Bound on every lock acquisition shared between tasks.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Switch input sampling period (20 Hz).
pub const SWITCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time a switch level must stay stable before it is committed.
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(50);

/// Hold time that turns a press into a long press.
pub const LONG_PRESS: Duration = Duration::from_millis(1000);

/// Window in which a second release makes a double click.
pub const DOUBLE_CLICK_WINDOW: Duration = Duration::from_millis(300);

/// Busy-wait for exactly `duration`.
///
/// Spins on [`Instant`] instead of yielding to the scheduler. Only meant for
/// sub-millisecond transceiver timing; callers block their thread for the
/// whole duration.
pub fn precise_delay(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precise_delay_waits_at_least_duration() {
        let start = Instant::now();
        precise_delay(Duration::from_micros(260));
        assert!(start.elapsed() >= Duration::from_micros(260));
    }

    #[test]
    fn precise_delay_zero_returns_immediately() {
        let start = Instant::now();
        precise_delay(Duration::ZERO);
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn liveness_timeout_fits_inside_tick() {
        assert!(PING_TIMEOUT < PING_INTERVAL);
    }
}
