//! The receive pipeline shared by the master and slave transports.
//!
//! The bus carries no length prefix and no checksum, so a frame is simply the
//! burst of bytes that arrives before the line goes quiet. The receive task
//! waits up to `poll_interval` for the first chunk, then keeps reading with a
//! `frame_gap` timeout until the line is silent or `max_frame_len` bytes have
//! been collected. Each burst becomes one inbound [`Frame`].
//!
//! The inbound queue is bounded. When it is full the new frame is dropped and
//! counted as an error; receiving never waits for the consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crestbus_core::error::{Error, Result};
use crestbus_core::frame::{Direction, Frame};
use crestbus_core::port::BusReader;
use crestbus_core::types::TransportStats;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Monotonic traffic counters, shared between a transport and its tasks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub transmitted: AtomicU64,
    pub received: AtomicU64,
    pub errors: AtomicU64,
    pub breaks: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            transmitted: self.transmitted.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            breaks: self.breaks.load(Ordering::Relaxed),
        }
    }
}

/// Framing and queueing parameters of the receive side.
#[derive(Debug, Clone)]
pub(crate) struct ReceiveSettings {
    pub max_frame_len: usize,
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub frame_gap: Duration,
}

struct Active {
    inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    cancel: CancellationToken,
    task: JoinHandle<Box<dyn BusReader>>,
}

/// Owns the reading half of a port and, while started, the task that turns
/// it into a queue of inbound frames.
pub(crate) struct InboundPipeline {
    port_name: String,
    settings: ReceiveSettings,
    /// Parked reader while the pipeline is stopped.
    reader: Mutex<Option<Box<dyn BusReader>>>,
    active: Mutex<Option<Active>>,
    counters: Arc<Counters>,
}

impl InboundPipeline {
    pub fn new(
        port_name: &str,
        reader: Box<dyn BusReader>,
        settings: ReceiveSettings,
        counters: Arc<Counters>,
    ) -> Self {
        InboundPipeline {
            port_name: port_name.to_string(),
            settings,
            reader: Mutex::new(Some(reader)),
            active: Mutex::new(None),
            counters,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Spawn the receive task. Does nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut active = lock(&self.active);
        if active.is_some() {
            return Ok(());
        }
        let reader = lock(&self.reader).take().ok_or(Error::NotConnected)?;

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            reader,
            tx,
            self.settings.clone(),
            self.counters.clone(),
            cancel.clone(),
            self.port_name.clone(),
        ));
        *active = Some(Active {
            inbound: Arc::new(tokio::sync::Mutex::new(rx)),
            cancel,
            task,
        });
        Ok(())
    }

    /// Stop the receive task and park the reader again. Queued frames are
    /// discarded.
    pub async fn stop(&self) {
        let Some(active) = lock(&self.active).take() else {
            return;
        };
        active.cancel.cancel();
        match active.task.await {
            Ok(reader) => *lock(&self.reader) = Some(reader),
            Err(e) => {
                tracing::error!(port = %self.port_name, error = %e, "receive task failed");
            }
        }
    }

    fn inbound(&self) -> Option<Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>> {
        lock(&self.active).as_ref().map(|a| a.inbound.clone())
    }

    /// Wait up to `timeout` for the next inbound frame.
    pub async fn receive(&self, timeout: Duration) -> Option<Frame> {
        let inbound = self.inbound()?;
        tokio::time::timeout(timeout, async move { inbound.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    /// Take the next inbound frame if one is already queued.
    pub fn try_receive(&self) -> Option<Frame> {
        let inbound = self.inbound()?;
        let mut rx = inbound.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Number of frames waiting in the inbound queue.
    pub fn available(&self) -> usize {
        self.inbound()
            .and_then(|inbound| inbound.try_lock().ok().map(|rx| rx.len()))
            .unwrap_or(0)
    }

    /// Discard every queued inbound frame, returning how many were dropped.
    pub fn flush(&self) -> usize {
        let Some(inbound) = self.inbound() else {
            return 0;
        };
        let Ok(mut rx) = inbound.try_lock() else {
            return 0;
        };
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Drop for InboundPipeline {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.active).take() {
            active.cancel.cancel();
            active.task.abort();
        }
    }
}

/// Read one burst into `buf`, starting with an already received first chunk
/// of `len` bytes. Returns the burst length.
async fn collect_burst(
    reader: &mut dyn BusReader,
    buf: &mut [u8],
    mut len: usize,
    frame_gap: Duration,
    port_name: &str,
) -> usize {
    while len < buf.len() {
        match reader.read(&mut buf[len..], frame_gap).await {
            Ok(0) | Err(Error::Timeout) => break,
            Ok(n) => len += n,
            Err(e) => {
                tracing::warn!(port = %port_name, error = %e, "read failed mid-frame");
                break;
            }
        }
    }
    len
}

async fn receive_loop(
    mut reader: Box<dyn BusReader>,
    inbound: mpsc::Sender<Frame>,
    settings: ReceiveSettings,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    port_name: String,
) -> Box<dyn BusReader> {
    let mut buf = vec![0u8; settings.max_frame_len];

    loop {
        let first = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf, settings.poll_interval) => result,
        };

        let len = match first {
            Ok(0) | Err(Error::Timeout) => continue,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(port = %port_name, error = %e, "bus read failed");
                Counters::bump(&counters.errors);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.poll_interval) => {}
                }
                continue;
            }
        };

        let len = collect_burst(
            reader.as_mut(),
            &mut buf,
            len,
            settings.frame_gap,
            &port_name,
        )
        .await;

        let frame = match Frame::new(&buf[..len], Direction::Inbound, settings.max_frame_len) {
            Ok(frame) => frame,
            Err(e) => {
                Counters::bump(&counters.errors);
                tracing::warn!(port = %port_name, error = %e, "discarding inbound burst");
                continue;
            }
        };

        match inbound.try_send(frame) {
            Ok(()) => {
                Counters::bump(&counters.received);
                tracing::trace!(port = %port_name, bytes = len, data = ?&buf[..len], "frame received");
            }
            Err(TrySendError::Full(_)) => {
                Counters::bump(&counters.errors);
                tracing::warn!(port = %port_name, bytes = len, "inbound queue full, frame dropped");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    tracing::debug!(port = %port_name, "receive loop stopped");
    reader
}
