//! The slave's timed transport.
//!
//! A slave only ever speaks when spoken to, and it must leave the master's
//! transceiver time to turn around before driving the pair. Responses are
//! therefore written synchronously under an exclusive lock, with fixed
//! busy-wait delays around the transmit-enable window:
//!
//! ```text
//! pre-delay | TE on | enable delay | write + drain | post-delay | TE off
//! ```
//!
//! Receiving uses the same silence-delimited pipeline as the master.

use std::sync::Arc;
use std::time::Duration;

use crestbus_core::error::{Error, Result};
use crestbus_core::frame::Frame;
use crestbus_core::port::{BusPort, BusWriter};
use crestbus_core::protocol::SLAVE_MAX_FRAME_LEN;
use crestbus_core::timing::{self, precise_delay};
use crestbus_core::types::TransportStats;

use crate::receive::{Counters, InboundPipeline, ReceiveSettings};

/// Tunables of a [`TimedTransport`].
#[derive(Debug, Clone)]
pub struct SlaveTiming {
    pub max_frame_len: usize,
    pub inbound_capacity: usize,
    pub poll_interval: Duration,
    pub frame_gap: Duration,
    pub lock_timeout: Duration,
    pub tx_done_timeout: Duration,
    pub pre_transmit: Duration,
    pub transmit_enable: Duration,
    pub post_transmit: Duration,
}

impl Default for SlaveTiming {
    fn default() -> Self {
        SlaveTiming {
            max_frame_len: SLAVE_MAX_FRAME_LEN,
            inbound_capacity: 16,
            poll_interval: timing::RX_POLL_INTERVAL,
            frame_gap: timing::FRAME_GAP,
            lock_timeout: timing::LOCK_TIMEOUT,
            tx_done_timeout: Duration::from_millis(50),
            pre_transmit: timing::PRE_TRANSMIT_DELAY,
            transmit_enable: timing::TRANSMIT_ENABLE_DELAY,
            post_transmit: timing::POST_TRANSMIT_DELAY,
        }
    }
}

/// Transport for a slave node: queued receive, synchronous timed transmit.
pub struct TimedTransport {
    port_name: String,
    timing: SlaveTiming,
    inbound: InboundPipeline,
    writer: tokio::sync::Mutex<Box<dyn BusWriter>>,
    counters: Arc<Counters>,
}

impl TimedTransport {
    pub fn new(port: Box<dyn BusPort>, timing: SlaveTiming) -> Self {
        let port_name = port.name().to_string();
        let (reader, writer) = port.split();
        let counters = Arc::new(Counters::default());
        let settings = ReceiveSettings {
            max_frame_len: timing.max_frame_len,
            queue_capacity: timing.inbound_capacity,
            poll_interval: timing.poll_interval,
            frame_gap: timing.frame_gap,
        };
        TimedTransport {
            inbound: InboundPipeline::new(&port_name, reader, settings, counters.clone()),
            port_name,
            timing,
            writer: tokio::sync::Mutex::new(writer),
            counters,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Start receiving. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        if !self.inbound.is_running() {
            self.inbound.start()?;
            tracing::info!(port = %self.port_name, "timed transport initialized");
        }
        Ok(())
    }

    /// Stop receiving. Idempotent.
    pub async fn deinitialize(&self) {
        if self.inbound.is_running() {
            self.inbound.stop().await;
            tracing::info!(port = %self.port_name, "timed transport deinitialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inbound.is_running()
    }

    /// Write `data` inside the timed transmit-enable window and return once
    /// the direction line is released.
    pub async fn send_with_timing(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::EmptyFrame);
        }
        if data.len() > self.timing.max_frame_len {
            return Err(Error::FrameTooLong {
                len: data.len(),
                max: self.timing.max_frame_len,
            });
        }

        let Ok(mut writer) = tokio::time::timeout(self.timing.lock_timeout, self.writer.lock()).await
        else {
            Counters::bump(&self.counters.errors);
            tracing::warn!(port = %self.port_name, "transmit lock busy");
            return Err(Error::LockTimeout);
        };

        precise_delay(self.timing.pre_transmit);
        let result = timed_write(writer.as_mut(), data, &self.timing).await;
        precise_delay(self.timing.post_transmit);
        let released = writer.set_tx_enable(false);

        match result.and(released) {
            Ok(()) => {
                Counters::bump(&self.counters.transmitted);
                tracing::trace!(port = %self.port_name, bytes = data.len(), data = ?data, "response sent");
                Ok(())
            }
            Err(e) => {
                Counters::bump(&self.counters.errors);
                tracing::warn!(port = %self.port_name, error = %e, "response failed");
                Err(e)
            }
        }
    }

    /// Wait up to `timeout` for the next inbound frame.
    pub async fn receive_message(&self, timeout: Duration) -> Option<Frame> {
        self.inbound.receive(timeout).await
    }

    pub fn try_receive_message(&self) -> Option<Frame> {
        self.inbound.try_receive()
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

async fn timed_write(writer: &mut dyn BusWriter, data: &[u8], timing: &SlaveTiming) -> Result<()> {
    writer.set_tx_enable(true)?;
    precise_delay(timing.transmit_enable);
    let n = writer.write(data).await?;
    if n < data.len() {
        return Err(Error::Transport(format!(
            "short write: {n} of {} bytes",
            data.len()
        )));
    }
    writer.wait_tx_done(timing.tx_done_timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crestbus_test_harness::{MockBus, MockBusHandle};

    fn transport() -> (TimedTransport, MockBusHandle) {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        (
            TimedTransport::new(Box::new(bus), SlaveTiming::default()),
            handle,
        )
    }

    #[tokio::test]
    async fn response_is_framed_by_transmit_enable() {
        let (transport, handle) = transport();
        transport.send_with_timing(&[0x02, 0x00]).await.unwrap();

        assert_eq!(handle.written(), vec![vec![0x02, 0x00]]);
        assert_eq!(handle.tx_enable_log(), vec![true, false]);
        assert_eq!(transport.stats().transmitted, 1);
    }

    #[tokio::test]
    async fn response_waits_out_turnaround_delays() {
        let (transport, _handle) = transport();
        let start = std::time::Instant::now();
        transport.send_with_timing(&[0x02, 0x00]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_micros(100 + 600 + 350));
    }

    #[tokio::test]
    async fn short_write_is_an_error() {
        let (transport, handle) = transport();
        handle.set_short_write(true);

        let result = transport.send_with_timing(&[0x02, 0x03, 0x00, 0x00, 0x00]).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(transport.stats().errors, 1);
        assert!(!handle.tx_enabled());
    }

    #[tokio::test]
    async fn oversized_response_rejected() {
        let (transport, handle) = transport();
        let big = [0u8; SLAVE_MAX_FRAME_LEN + 1];
        assert!(matches!(
            transport.send_with_timing(&big).await,
            Err(Error::FrameTooLong { .. })
        ));
        assert!(handle.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn receives_after_initialize() {
        let (transport, handle) = transport();
        transport.initialize().unwrap();
        transport.initialize().unwrap();

        handle.inject(&[0x22, 0x00]);
        let frame = transport
            .receive_message(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(frame.bytes(), &[0x22, 0x00]);

        transport.deinitialize().await;
        assert!(!transport.is_initialized());
    }
}
