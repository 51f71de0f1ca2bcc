//! The slave-side protocol handler.
//!
//! A single emulated device sits on the bus at a fixed address. Every
//! inbound frame is classified:
//!
//! ```text
//! ping     exactly [own, 0x00]                 -> reply [0x02, 0x00]
//! switch   [own, 0x03, x, x, 0x00 | 0x80, ...] -> reply [0x02, 0x03, 0x00, 0x00, state]
//! other    anything else                       -> error counter, no reply
//! ```
//!
//! Replies go out through [`TimedTransport::send_with_timing`], so every
//! response respects the transceiver turnaround window.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crestbus_core::error::{Error, Result};
use crestbus_core::events::DeviceEvent;
use crestbus_core::frame::Frame;
use crestbus_core::protocol::{self, SWITCH_COMMAND, SWITCH_OFF, SWITCH_ON, SWITCH_STATE_OFFSET};
use crestbus_core::timing;
use crestbus_core::types::{DeviceState, TransportStats};
use crestbus_transport::TimedTransport;

/// Address the emulated device answers to unless configured otherwise.
pub const DEFAULT_ADDRESS: u8 = 0x22;

/// What an inbound frame asks of this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Ping,
    Switch { on: bool },
    Unknown,
}

/// Classify `data` for the device at `address`.
pub fn classify(address: u8, data: &[u8]) -> Request {
    if data == protocol::ping_frame(address) {
        return Request::Ping;
    }
    if data.len() >= 5 && data[0] == address && data[1] == SWITCH_COMMAND {
        match data[SWITCH_STATE_OFFSET] {
            SWITCH_ON => return Request::Switch { on: true },
            SWITCH_OFF => return Request::Switch { on: false },
            _ => {}
        }
    }
    Request::Unknown
}

/// Counters kept by the handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub pings: u64,
    pub commands: u64,
    /// Unknown frames plus replies that could not be sent.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct DeviceStatus {
    state: DeviceState,
    switch_on: bool,
    stats: HandlerStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    address: u8,
    transport: TimedTransport,
    status: tokio::sync::Mutex<DeviceStatus>,
    events: broadcast::Sender<DeviceEvent>,
    lock_timeout: Duration,
    receive_wait: Duration,
}

impl Inner {
    async fn status(&self) -> Result<tokio::sync::MutexGuard<'_, DeviceStatus>> {
        tokio::time::timeout(self.lock_timeout, self.status.lock())
            .await
            .map_err(|_| {
                warn!(address = format_args!("0x{:02X}", self.address), "device state lock timed out");
                Error::LockTimeout
            })
    }

    async fn set_state(&self, to: DeviceState) {
        let Ok(mut status) = self.status().await else {
            return;
        };
        let from = status.state;
        if from == to {
            return;
        }
        status.state = to;
        drop(status);
        debug!(%from, %to, "device state changed");
        let _ = self.events.send(DeviceEvent::StateChanged { from, to });
    }

    async fn set_switch(&self, on: bool) -> Result<()> {
        let mut status = self.status().await?;
        let changed = status.switch_on != on;
        status.switch_on = on;
        drop(status);
        if changed {
            info!(on, "switch state changed");
            let _ = self.events.send(DeviceEvent::SwitchStateChanged { on });
        }
        Ok(())
    }

    async fn count(&self, f: impl FnOnce(&mut HandlerStats)) {
        if let Ok(mut status) = self.status().await {
            f(&mut status.stats);
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        let data = frame.bytes();
        trace!(bytes = data.len(), data = ?data, "frame received");

        match classify(self.address, data) {
            Request::Ping => {
                self.count(|s| s.pings += 1).await;
                match self.transport.send_with_timing(&protocol::ping_response()).await {
                    Ok(()) => {
                        let _ = self.events.send(DeviceEvent::PingAnswered);
                    }
                    Err(e) => {
                        warn!(error = %e, "ping response failed");
                        self.count(|s| s.errors += 1).await;
                    }
                }
            }
            Request::Switch { on } => {
                self.set_state(DeviceState::ProcessingCommand).await;
                self.count(|s| s.commands += 1).await;
                let _ = self.set_switch(on).await;
                let _ = self.events.send(DeviceEvent::SwitchCommand { on });
                info!(on, "switch command");

                if let Err(e) = self.transport.send_with_timing(&protocol::switch_ack(on)).await {
                    warn!(error = %e, "switch acknowledgment failed");
                    self.count(|s| s.errors += 1).await;
                }
                self.set_state(DeviceState::Online).await;
            }
            Request::Unknown => {
                debug!(bytes = data.len(), data = ?data, "unknown frame");
                self.count(|s| s.errors += 1).await;
                let _ = self.events.send(DeviceEvent::UnknownFrame { len: data.len() });
            }
        }
    }
}

async fn handler_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        while let Some(frame) = inner.transport.try_receive_message() {
            inner.handle_frame(frame).await;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            frame = inner.transport.receive_message(inner.receive_wait) => {
                if let Some(frame) = frame {
                    inner.handle_frame(frame).await;
                }
            }
        }
    }
    debug!("protocol handler stopped");
}

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The emulated slave device.
///
/// Shared with the switch debouncer through an `Arc`.
pub struct ProtocolHandler {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl ProtocolHandler {
    pub fn new(address: u8, transport: TimedTransport, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        ProtocolHandler {
            inner: Arc::new(Inner {
                address,
                transport,
                status: tokio::sync::Mutex::new(DeviceStatus::default()),
                events,
                lock_timeout: timing::LOCK_TIMEOUT,
                receive_wait: Duration::from_millis(10),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn address(&self) -> u8 {
        self.inner.address
    }

    pub fn port_name(&self) -> &str {
        self.inner.transport.port_name()
    }

    /// Start the transport and the handler task; the device goes `Online`.
    /// Idempotent.
    pub fn initialize(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        self.inner.transport.initialize()?;

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                inner.set_state(DeviceState::Online).await;
                handler_loop(inner, cancel).await;
            }
        });
        *worker = Some(Worker { cancel, task });
        info!(address = format_args!("0x{:02X}", self.inner.address), "protocol handler initialized");
        Ok(())
    }

    /// Stop the handler task and the transport; the device goes `Offline`.
    pub async fn deinitialize(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            let _ = worker.task.await;
            self.inner.transport.deinitialize().await;
            self.inner.set_state(DeviceState::Offline).await;
            info!(address = format_args!("0x{:02X}", self.inner.address), "protocol handler deinitialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Set the logical switch state, as the local input does on release.
    pub async fn set_switch_state(&self, on: bool) -> Result<()> {
        self.inner.set_switch(on).await
    }

    /// Logical switch state; `false` if the state lock is busy.
    pub async fn switch_state(&self) -> bool {
        self.try_switch_state().await.unwrap_or(false)
    }

    /// Logical switch state, or [`Error::LockTimeout`] if the state lock is
    /// busy.
    pub async fn try_switch_state(&self) -> Result<bool> {
        self.inner.status().await.map(|s| s.switch_on)
    }

    pub async fn device_state(&self) -> DeviceState {
        self.inner
            .status()
            .await
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> HandlerStats {
        self.inner
            .status()
            .await
            .map(|s| s.stats)
            .unwrap_or_default()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for ProtocolHandler {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.cancel.cancel();
            worker.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crestbus_test_harness::{MockBus, MockBusHandle};
    use crestbus_transport::SlaveTiming;

    fn handler(address: u8) -> (ProtocolHandler, MockBusHandle) {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let transport = TimedTransport::new(Box::new(bus), SlaveTiming::default());
        let handler = ProtocolHandler::new(address, transport, 16);
        handler.initialize().unwrap();
        (handler, handle)
    }

    #[test]
    fn classify_frames() {
        assert_eq!(classify(0x22, &[0x22, 0x00]), Request::Ping);
        assert_eq!(classify(0x22, &[0x22, 0x00, 0x00]), Request::Unknown);
        assert_eq!(classify(0x22, &[0x0B, 0x00]), Request::Unknown);
        assert_eq!(
            classify(0x22, &[0x22, 0x03, 0x00, 0x00, 0x00]),
            Request::Switch { on: true }
        );
        assert_eq!(
            classify(0x22, &[0x22, 0x03, 0x00, 0x00, 0x80, 0x11]),
            Request::Switch { on: false }
        );
        assert_eq!(classify(0x22, &[0x22, 0x03, 0x00, 0x00, 0x40]), Request::Unknown);
        assert_eq!(classify(0x22, &[0x22, 0x03, 0x00, 0x00]), Request::Unknown);
        assert_eq!(classify(0x22, &[0x23, 0x03, 0x00, 0x00, 0x00]), Request::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_answered() {
        let (handler, handle) = handler(0x22);
        handle.inject(&[0x22, 0x00]);

        let reply = handle.next_written(Duration::from_millis(50)).await;
        assert_eq!(reply, Some(vec![0x02, 0x00]));
        assert_eq!(handle.tx_enable_log(), vec![true, false]);
        let stats = handler.stats().await;
        assert_eq!(stats.pings, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(handler.device_state().await, DeviceState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_command_applied_and_acknowledged() {
        let (handler, handle) = handler(0x22);
        let mut events = handler.subscribe();

        handle.inject(&[0x22, 0x03, 0x00, 0x00, 0x00]);
        let reply = handle.next_written(Duration::from_millis(50)).await;
        assert_eq!(reply, Some(vec![0x02, 0x03, 0x00, 0x00, 0x00]));
        assert!(handler.switch_state().await);
        assert_eq!(handler.stats().await.commands, 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&DeviceEvent::SwitchCommand { on: true }));
        assert!(seen.contains(&DeviceEvent::SwitchStateChanged { on: true }));
        assert!(seen.contains(&DeviceEvent::StateChanged {
            from: DeviceState::Online,
            to: DeviceState::ProcessingCommand,
        }));

        handle.inject(&[0x22, 0x03, 0x00, 0x00, 0x80]);
        let reply = handle.next_written(Duration::from_millis(50)).await;
        assert_eq!(reply, Some(vec![0x02, 0x03, 0x00, 0x00, 0x80]));
        assert!(!handler.switch_state().await);
        assert_eq!(handler.device_state().await, DeviceState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_frame_counts_error_without_reply() {
        let (handler, handle) = handler(0x22);
        handle.inject(&[0x0B, 0x00]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.written().is_empty());
        let stats = handler.stats().await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.pings, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_counts_error() {
        let (handler, handle) = handler(0x22);
        handle.set_short_write(true);
        handle.inject(&[0x22, 0x00]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = handler.stats().await;
        assert_eq!(stats.pings, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(handler.transport_stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_drives_device_state() {
        let (handler, _handle) = handler(0x22);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handler.device_state().await, DeviceState::Online);

        handler.deinitialize().await;
        assert!(!handler.is_initialized());
        assert_eq!(handler.device_state().await, DeviceState::Offline);
        handler.deinitialize().await;
    }

    #[tokio::test]
    async fn set_switch_state_reports_change_once() {
        let (handler, _handle) = handler(0x22);
        let mut events = handler.subscribe();
        handler.set_switch_state(true).await.unwrap();
        handler.set_switch_state(true).await.unwrap();
        assert!(handler.switch_state().await);

        let mut changes = 0;
        while let Ok(event) = events.try_recv() {
            if event == (DeviceEvent::SwitchStateChanged { on: true }) {
                changes += 1;
            }
        }
        assert_eq!(changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_state_reports_busy_lock() {
        let (handler, _handle) = handler(0x22);
        handler.set_switch_state(true).await.unwrap();
        assert!(handler.try_switch_state().await.unwrap());

        let _status = handler.inner.status.lock().await;
        assert!(matches!(
            handler.try_switch_state().await,
            Err(Error::LockTimeout)
        ));
        assert!(!handler.switch_state().await);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_handler_does_not_reset_switch_input() {
        use crate::debounce::{DebounceConfig, ManualSwitch, SwitchHandler};
        use crestbus_core::events::SwitchEventKind;

        let (handler, _handle) = handler(0x22);
        let handler = Arc::new(handler);
        handler.set_switch_state(true).await.unwrap();

        let button = ManualSwitch::new();
        let switch = SwitchHandler::spawn(
            Box::new(button.clone()),
            handler.clone(),
            DebounceConfig::default(),
            16,
        );
        let mut events = switch.subscribe();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = handler.inner.status.lock().await;
        button.set(true);
        tokio::time::sleep(Duration::from_millis(400)).await;
        button.set(false);
        tokio::time::sleep(Duration::from_millis(400)).await;

        // Toggled from the last known state, not from a failed read.
        assert!(!switch.switch_on());
        assert_eq!(events.try_recv().unwrap().kind, SwitchEventKind::Press);
        let release = events.try_recv().unwrap();
        assert_eq!(release.kind, SwitchEventKind::Release);
        assert!(!release.switch_on);
        drop(status);

        switch.shutdown().await;
    }
}
