//! The master's half-duplex transport.
//!
//! [`HalfDuplexTransport`] owns one [`BusPort`] and runs two tasks over it:
//!
//! - the receive task (see [`receive`](crate::receive)), turning silence-
//!   delimited bursts into inbound frames;
//! - the transmit task, draining a bounded outbound queue and wrapping each
//!   write in the transmit-enable sequence: assert, settle, write, drain,
//!   release, settle.
//!
//! [`send_message`](HalfDuplexTransport::send_message) only queues a frame.
//! Producers are serialized by a gate acquired with a bounded timeout and the
//! queue itself is entered with a bounded wait, so a caller is never blocked
//! indefinitely: it gets [`Error::LockTimeout`] or [`Error::QueueFull`] instead.
//!
//! [`send_break`](HalfDuplexTransport::send_break) bypasses the queue and
//! drives the line directly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crestbus_core::error::{Error, Result};
use crestbus_core::frame::{Direction, Frame};
use crestbus_core::port::{BusPort, BusWriter};
use crestbus_core::protocol::{self, MASTER_MAX_FRAME_LEN};
use crestbus_core::timing::{self, precise_delay};
use crestbus_core::types::TransportStats;

use crate::receive::{Counters, InboundPipeline, ReceiveSettings, lock};

/// Tunables of a [`HalfDuplexTransport`]. Defaults are the bus constants.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest frame accepted in either direction.
    pub max_frame_len: usize,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    /// Wait for the first byte of an inbound frame.
    pub poll_interval: Duration,
    /// Silence that ends an inbound frame.
    pub frame_gap: Duration,
    /// Bound on acquiring the producer gate or the line for a break.
    pub lock_timeout: Duration,
    /// Bound on waiting for room in the outbound queue.
    pub enqueue_timeout: Duration,
    /// Bound on waiting for the UART to drain after a write.
    pub tx_done_timeout: Duration,
    pub tx_settle: Duration,
    pub rx_settle: Duration,
    pub break_duration: Duration,
    pub break_recovery: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_frame_len: MASTER_MAX_FRAME_LEN,
            inbound_capacity: 32,
            outbound_capacity: 32,
            poll_interval: timing::RX_POLL_INTERVAL,
            frame_gap: timing::FRAME_GAP,
            lock_timeout: timing::LOCK_TIMEOUT,
            enqueue_timeout: Duration::from_millis(50),
            tx_done_timeout: Duration::from_millis(100),
            tx_settle: timing::TX_ENABLE_SETTLE,
            rx_settle: timing::RX_ENABLE_SETTLE,
            break_duration: timing::BREAK_DURATION,
            break_recovery: timing::BREAK_RECOVERY,
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn BusWriter>>>;

struct TxTask {
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Queued, direction-controlled transport for the bus master.
pub struct HalfDuplexTransport {
    port_name: String,
    config: TransportConfig,
    inbound: InboundPipeline,
    writer: SharedWriter,
    tx: Mutex<Option<TxTask>>,
    /// Serializes producers on the outbound queue.
    gate: tokio::sync::Mutex<()>,
    counters: Arc<Counters>,
}

impl HalfDuplexTransport {
    /// Take ownership of `port`. Nothing runs until [`initialize`](Self::initialize).
    pub fn new(port: Box<dyn BusPort>, config: TransportConfig) -> Self {
        let port_name = port.name().to_string();
        let (reader, writer) = port.split();
        let counters = Arc::new(Counters::default());
        let settings = ReceiveSettings {
            max_frame_len: config.max_frame_len,
            queue_capacity: config.inbound_capacity,
            poll_interval: config.poll_interval,
            frame_gap: config.frame_gap,
        };
        HalfDuplexTransport {
            inbound: InboundPipeline::new(&port_name, reader, settings, counters.clone()),
            port_name,
            config,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            tx: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            counters,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Start the receive and transmit tasks. Calling it again while running
    /// is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let mut tx = lock(&self.tx);
        if tx.is_some() {
            return Ok(());
        }
        self.inbound.start()?;

        let (outbound, rx) = mpsc::channel(self.config.outbound_capacity);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(transmit_loop(
            rx,
            self.writer.clone(),
            self.config.clone(),
            self.counters.clone(),
            cancel.clone(),
        ));
        *tx = Some(TxTask {
            outbound,
            cancel,
            task,
        });
        tracing::info!(port = %self.port_name, "half-duplex transport initialized");
        Ok(())
    }

    /// Stop both tasks and drop the queues. Calling it again is a no-op.
    pub async fn deinitialize(&self) {
        let tx = lock(&self.tx).take();
        if let Some(tx) = tx {
            tx.cancel.cancel();
            if let Err(e) = tx.task.await {
                tracing::error!(port = %self.port_name, error = %e, "transmit task failed");
            }
        }
        self.inbound.stop().await;
        // Leave the transceiver listening.
        if let Err(e) = self.writer.lock().await.set_tx_enable(false) {
            tracing::warn!(port = %self.port_name, error = %e, "failed to release transmit-enable");
        }
        tracing::info!(port = %self.port_name, "half-duplex transport deinitialized");
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.tx).is_some()
    }

    fn outbound(&self) -> Result<mpsc::Sender<Frame>> {
        lock(&self.tx)
            .as_ref()
            .map(|tx| tx.outbound.clone())
            .ok_or(Error::NotInitialized)
    }

    /// Queue one frame for transmission.
    ///
    /// Success means the frame was accepted into the outbound queue, not
    /// that it reached the wire.
    pub async fn send_message(&self, data: &[u8]) -> Result<()> {
        let frame = Frame::new(data, Direction::Outbound, self.config.max_frame_len)?;
        let outbound = self.outbound()?;

        let Ok(_gate) = tokio::time::timeout(self.config.lock_timeout, self.gate.lock()).await
        else {
            Counters::bump(&self.counters.errors);
            tracing::warn!(port = %self.port_name, "outbound gate busy");
            return Err(Error::LockTimeout);
        };

        match outbound.send_timeout(frame, self.config.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                Counters::bump(&self.counters.errors);
                tracing::warn!(port = %self.port_name, bytes = data.len(), "outbound queue full");
                Err(Error::QueueFull)
            }
            Err(SendTimeoutError::Closed(_)) => Err(Error::NotInitialized),
        }
    }

    /// Queue the 2-byte ping frame for `address`.
    pub async fn send_ping(&self, address: u8) -> Result<()> {
        self.send_message(&protocol::ping_frame(address)).await
    }

    /// Emit a bus-recovery break and wait until it is complete.
    ///
    /// The line is held low for exactly the configured break duration by
    /// busy-waiting; the recovery pause that follows is an ordinary sleep.
    pub async fn send_break(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let Ok(mut writer) = tokio::time::timeout(self.config.lock_timeout, self.writer.lock()).await
        else {
            Counters::bump(&self.counters.errors);
            return Err(Error::LockTimeout);
        };

        let result = hold_break(writer.as_mut(), &self.config).await;
        if let Err(e) = writer.set_tx_enable(false) {
            tracing::warn!(port = %self.port_name, error = %e, "failed to release transmit-enable");
        }
        match result {
            Ok(()) => {
                Counters::bump(&self.counters.breaks);
                tracing::debug!(port = %self.port_name, "break sent");
                Ok(())
            }
            Err(e) => {
                Counters::bump(&self.counters.errors);
                tracing::warn!(port = %self.port_name, error = %e, "break failed");
                Err(e)
            }
        }
    }

    /// Wait up to `timeout` for the next inbound frame, in arrival order.
    pub async fn receive_message(&self, timeout: Duration) -> Option<Frame> {
        self.inbound.receive(timeout).await
    }

    /// Take the next inbound frame without waiting.
    pub fn try_receive_message(&self) -> Option<Frame> {
        self.inbound.try_receive()
    }

    pub fn available_messages(&self) -> usize {
        self.inbound.available()
    }

    /// Discard queued inbound frames.
    pub fn flush_buffers(&self) -> usize {
        self.inbound.flush()
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

impl Drop for HalfDuplexTransport {
    fn drop(&mut self) {
        if let Some(tx) = lock(&self.tx).take() {
            tx.cancel.cancel();
            tx.task.abort();
        }
    }
}

async fn hold_break(writer: &mut dyn BusWriter, config: &TransportConfig) -> Result<()> {
    writer.set_tx_enable(true)?;
    writer.set_break(true)?;
    precise_delay(config.break_duration);
    writer.set_break(false)?;
    tokio::time::sleep(config.break_recovery).await;
    Ok(())
}

/// Write one frame inside the transmit-enable window. The direction line is
/// released even when the write fails.
async fn transmit_frame(
    writer: &mut dyn BusWriter,
    data: &[u8],
    config: &TransportConfig,
) -> Result<()> {
    writer.set_tx_enable(true)?;
    precise_delay(config.tx_settle);

    let written = async {
        let n = writer.write(data).await?;
        if n < data.len() {
            return Err(Error::Transport(format!(
                "short write: {n} of {} bytes",
                data.len()
            )));
        }
        writer.wait_tx_done(config.tx_done_timeout).await
    }
    .await;

    let released = writer.set_tx_enable(false);
    precise_delay(config.rx_settle);
    written.and(released)
}

async fn transmit_loop(
    mut outbound: mpsc::Receiver<Frame>,
    writer: SharedWriter,
    config: TransportConfig,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mut line = writer.lock().await;
        match transmit_frame(line.as_mut(), frame.bytes(), &config).await {
            Ok(()) => {
                Counters::bump(&counters.transmitted);
                tracing::trace!(bytes = frame.len(), data = ?frame.bytes(), "frame transmitted");
            }
            Err(e) => {
                Counters::bump(&counters.errors);
                tracing::warn!(bytes = frame.len(), error = %e, "transmit failed");
            }
        }
    }
    tracing::debug!("transmit loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crestbus_test_harness::{MockBus, MockBusHandle};

    fn transport() -> (HalfDuplexTransport, MockBusHandle) {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        (
            HalfDuplexTransport::new(Box::new(bus), TransportConfig::default()),
            handle,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_is_idempotent() {
        let (transport, _handle) = transport();
        assert!(!transport.is_initialized());
        transport.initialize().unwrap();
        transport.initialize().unwrap();
        assert!(transport.is_initialized());

        transport.deinitialize().await;
        transport.deinitialize().await;
        assert!(!transport.is_initialized());

        transport.initialize().unwrap();
        assert!(transport.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_initialize() {
        let (transport, _handle) = transport();
        let result = transport.send_message(&[0x0B, 0x00]).await;
        assert!(matches!(result, Err(Error::NotInitialized)));
        assert!(matches!(transport.send_break().await, Err(Error::NotInitialized)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_rejects_empty_and_oversized() {
        let (transport, _handle) = transport();
        transport.initialize().unwrap();

        assert!(matches!(transport.send_message(&[]).await, Err(Error::EmptyFrame)));
        let big = vec![0u8; MASTER_MAX_FRAME_LEN + 1];
        assert!(matches!(
            transport.send_message(&big).await,
            Err(Error::FrameTooLong { len: 129, max: 128 })
        ));
        let max = vec![0u8; MASTER_MAX_FRAME_LEN];
        assert!(transport.send_message(&max).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn write_is_wrapped_in_transmit_enable() {
        let (transport, handle) = transport();
        transport.initialize().unwrap();

        transport.send_ping(0x0B).await.unwrap();
        let written = handle.next_written(Duration::from_millis(10)).await;
        assert_eq!(written, Some(vec![0x0B, 0x00]));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(handle.tx_enable_log(), vec![true, false]);
        assert!(!handle.tx_enabled());
        assert_eq!(transport.stats().transmitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_write_counts_as_error() {
        let (transport, handle) = transport();
        handle.set_short_write(true);
        transport.initialize().unwrap();

        transport.send_message(&[0x0B, 0x00]).await.unwrap();
        handle.next_written(Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let stats = transport.stats();
        assert_eq!(stats.transmitted, 0);
        assert_eq!(stats.errors, 1);
        assert!(!handle.tx_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn break_toggles_line_once() {
        let (transport, handle) = transport();
        transport.initialize().unwrap();

        transport.send_break().await.unwrap();
        assert_eq!(handle.break_count(), 1);
        assert!(!handle.break_asserted());
        assert_eq!(handle.tx_enable_log(), vec![true, false]);
        assert_eq!(transport.stats().breaks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_is_received_as_frame() {
        let (transport, handle) = transport();
        handle.expect(&[0x0B, 0x00], &[0x02, 0x00]);
        transport.initialize().unwrap();

        transport.send_ping(0x0B).await.unwrap();
        let frame = transport
            .receive_message(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(frame.bytes(), &[0x02, 0x00]);
        assert_eq!(transport.stats().received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deinitialize_leaves_receive_mode() {
        let (transport, handle) = transport();
        transport.initialize().unwrap();
        transport.deinitialize().await;
        assert!(!handle.tx_enabled());
        assert!(transport.receive_message(Duration::from_millis(5)).await.is_none());
    }
}
