//! In-memory bus port for deterministic testing of the master and slave.
//!
//! [`MockBus`] implements [`BusPort`]. Tests keep a [`MockBusHandle`] to
//! inject inbound bursts, inspect what was written and which control lines
//! were toggled, and pre-load automatic replies.
//!
//! Each injected burst is delivered as one contiguous read followed by one
//! simulated quiet period ([`Error::Timeout`]), so a receive loop that ends
//! frames on silence sees exactly one frame per burst.
//!
//! # Example
//!
//! ```
//! use crestbus_test_harness::MockBus;
//!
//! let bus = MockBus::new("mock");
//! let handle = bus.handle();
//! // When the node under test pings 0x0B, answer with a ping response.
//! handle.expect_always(&[0x0B, 0x00], &[0x02, 0x00]);
//! ```
//!
//! Two buses can also be wired back to back with [`MockBus::pair`], so that
//! bytes written by one end arrive as bursts on the other.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crestbus_core::error::{Error, Result};
use crestbus_core::port::{BusPort, BusReader, BusWriter};

/// A pre-loaded request/response pair.
#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    response: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    /// Bursts waiting to be read.
    inbound: VecDeque<Vec<u8>>,
    /// Burst currently being read and the cursor into it.
    current: Option<(Vec<u8>, usize)>,
    /// Next read reports the quiet gap that ends the previous burst.
    gap_pending: bool,

    written: Vec<Vec<u8>>,
    written_cursor: usize,
    tx_enable_log: Vec<bool>,
    tx_enabled: bool,
    break_asserted: bool,
    breaks: usize,
    short_write: bool,
    connected: bool,

    expectations: VecDeque<Expectation>,
    always: Vec<Expectation>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    rx_ready: Notify,
    tx_written: Notify,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            state: Mutex::new(State {
                connected: true,
                ..Default::default()
            }),
            rx_ready: Notify::new(),
            tx_written: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_inbound(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock().inbound.push_back(data.to_vec());
        self.rx_ready.notify_one();
    }
}

/// A mock [`BusPort`] for testing protocol nodes without hardware.
#[derive(Debug)]
pub struct MockBus {
    name: String,
    shared: Arc<Shared>,
    peer: Option<Arc<Shared>>,
}

impl MockBus {
    /// Create a standalone mock bus.
    pub fn new(name: &str) -> Self {
        MockBus {
            name: name.to_string(),
            shared: Shared::new(),
            peer: None,
        }
    }

    /// Create two buses wired to each other: every frame written on one end
    /// is delivered as an inbound burst on the other.
    pub fn pair() -> (MockBus, MockBus) {
        let a = Shared::new();
        let b = Shared::new();
        (
            MockBus {
                name: "mock-a".to_string(),
                shared: a.clone(),
                peer: Some(b.clone()),
            },
            MockBus {
                name: "mock-b".to_string(),
                shared: b,
                peer: Some(a),
            },
        )
    }

    /// Get a handle for driving and inspecting this bus from a test.
    pub fn handle(&self) -> MockBusHandle {
        MockBusHandle {
            shared: self.shared.clone(),
        }
    }
}

impl BusPort for MockBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn split(self: Box<Self>) -> (Box<dyn BusReader>, Box<dyn BusWriter>) {
        let reader = MockReader {
            shared: self.shared.clone(),
        };
        let writer = MockWriter {
            shared: self.shared,
            peer: self.peer,
        };
        (Box::new(reader), Box::new(writer))
    }
}

/// Test-side view of a [`MockBus`].
#[derive(Debug, Clone)]
pub struct MockBusHandle {
    shared: Arc<Shared>,
}

impl MockBusHandle {
    /// Queue one inbound burst, as if a remote node had transmitted it.
    pub fn inject(&self, data: &[u8]) {
        self.shared.push_inbound(data);
    }

    /// Reply with `response` the next time exactly `request` is written.
    ///
    /// One-shot expectations are consumed in order and checked before the
    /// permanent ones registered with [`expect_always`](Self::expect_always).
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.shared.lock().expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Reply with `response` every time exactly `request` is written.
    pub fn expect_always(&self, request: &[u8], response: &[u8]) {
        self.shared.lock().always.push(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Drop every pre-loaded reply.
    pub fn clear_expectations(&self) {
        let mut state = self.shared.lock();
        state.expectations.clear();
        state.always.clear();
    }

    /// Number of one-shot expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.shared.lock().expectations.len()
    }

    /// Every frame written so far, one element per `write()` call.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.lock().written.clone()
    }

    /// Wait for the next frame written after the last one returned here.
    pub async fn next_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.shared.lock();
                if state.written_cursor < state.written.len() {
                    let frame = state.written[state.written_cursor].clone();
                    state.written_cursor += 1;
                    return Some(frame);
                }
            }
            if tokio::time::timeout_at(deadline, self.shared.tx_written.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Every transition of the transmit-enable line, in order.
    pub fn tx_enable_log(&self) -> Vec<bool> {
        self.shared.lock().tx_enable_log.clone()
    }

    /// Current level of the transmit-enable line.
    pub fn tx_enabled(&self) -> bool {
        self.shared.lock().tx_enabled
    }

    /// Number of breaks asserted on the line.
    pub fn break_count(&self) -> usize {
        self.shared.lock().breaks
    }

    /// Whether the line is currently held in break.
    pub fn break_asserted(&self) -> bool {
        self.shared.lock().break_asserted
    }

    /// Make subsequent writes accept one byte less than requested.
    pub fn set_short_write(&self, short: bool) {
        self.shared.lock().short_write = short;
    }

    /// When set to `false`, every operation fails with [`Error::NotConnected`].
    pub fn set_connected(&self, connected: bool) {
        self.shared.lock().connected = connected;
        self.shared.rx_ready.notify_one();
    }
}

struct MockReader {
    shared: Arc<Shared>,
}

#[async_trait]
impl BusReader for MockReader {
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.shared.lock();
                if !state.connected {
                    return Err(Error::NotConnected);
                }
                if state.current.is_none() {
                    if state.gap_pending {
                        state.gap_pending = false;
                        return Err(Error::Timeout);
                    }
                    state.current = state.inbound.pop_front().map(|burst| (burst, 0));
                }
                if let Some((burst, cursor)) = state.current.as_mut() {
                    let n = (burst.len() - *cursor).min(buf.len());
                    buf[..n].copy_from_slice(&burst[*cursor..*cursor + n]);
                    *cursor += n;
                    if *cursor >= burst.len() {
                        state.current = None;
                        state.gap_pending = true;
                    }
                    return Ok(n);
                }
            }
            if tokio::time::timeout_at(deadline, self.shared.rx_ready.notified())
                .await
                .is_err()
            {
                return Err(Error::Timeout);
            }
        }
    }
}

struct MockWriter {
    shared: Arc<Shared>,
    peer: Option<Arc<Shared>>,
}

#[async_trait]
impl BusWriter for MockWriter {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let (accepted, reply) = {
            let mut state = self.shared.lock();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            let accepted = if state.short_write {
                data.len().saturating_sub(1)
            } else {
                data.len()
            };
            state.written.push(data[..accepted].to_vec());

            let one_shot = state
                .expectations
                .front()
                .is_some_and(|e| e.request == data);
            let reply = if one_shot {
                state.expectations.pop_front().map(|e| e.response)
            } else {
                state
                    .always
                    .iter()
                    .find(|e| e.request == data)
                    .map(|e| e.response.clone())
            };
            (accepted, reply)
        };
        self.shared.tx_written.notify_one();

        if let Some(peer) = &self.peer {
            peer.push_inbound(&data[..accepted]);
        }
        if let Some(reply) = reply {
            self.shared.push_inbound(&reply);
        }
        Ok(accepted)
    }

    async fn wait_tx_done(&mut self, _timeout: Duration) -> Result<()> {
        if !self.shared.lock().connected {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn set_tx_enable(&mut self, enable: bool) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.tx_enabled = enable;
        state.tx_enable_log.push(enable);
        Ok(())
    }

    fn set_break(&mut self, asserted: bool) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        if asserted && !state.break_asserted {
            state.breaks += 1;
        }
        state.break_asserted = asserted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(bus: MockBus) -> (Box<dyn BusReader>, Box<dyn BusWriter>) {
        Box::new(bus).split()
    }

    #[tokio::test]
    async fn injected_burst_is_read_then_gap() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let (mut reader, _writer) = split(bus);

        handle.inject(&[0x02, 0x00]);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x02, 0x00]);

        let gap = reader.read(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(gap, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn back_to_back_bursts_stay_separate() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let (mut reader, _writer) = split(bus);

        handle.inject(&[0x01]);
        handle.inject(&[0x02, 0x03]);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x01]);
        assert!(reader.read(&mut buf, Duration::from_millis(10)).await.is_err());
        let n = reader.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x02, 0x03]);
    }

    #[tokio::test]
    async fn small_buffer_reads_burst_in_parts() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let (mut reader, _writer) = split(bus);

        handle.inject(&[0xAA, 0xBB, 0xCC]);
        let mut buf = [0u8; 2];
        let n = reader.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0xBB]);
        let n = reader.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0xCC]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_line_times_out() {
        let bus = MockBus::new("mock");
        let (mut reader, _writer) = split(bus);
        let mut buf = [0u8; 8];
        let result = reader.read(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn read_wakes_on_late_inject() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let (mut reader, _writer) = split(bus);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            handle.inject(&[0x42]);
        });
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf, Duration::from_millis(50)).await.unwrap();
        assert_eq!(&buf[..n], &[0x42]);
    }

    #[tokio::test]
    async fn writes_are_logged_and_answered() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        handle.expect(&[0x0B, 0x00], &[0x02, 0x00]);
        let (mut reader, mut writer) = split(bus);

        assert_eq!(writer.write(&[0x0B, 0x00]).await.unwrap(), 2);
        assert_eq!(handle.written(), vec![vec![0x0B, 0x00]]);
        assert_eq!(handle.remaining_expectations(), 0);

        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x02, 0x00]);
    }

    #[tokio::test]
    async fn expect_always_answers_repeatedly() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        handle.expect_always(&[0x0B, 0x00], &[0x02, 0x00]);
        let (mut reader, mut writer) = split(bus);

        let mut buf = [0u8; 8];
        for _ in 0..3 {
            writer.write(&[0x0B, 0x00]).await.unwrap();
            let n = reader.read(&mut buf, Duration::from_millis(10)).await.unwrap();
            assert_eq!(&buf[..n], &[0x02, 0x00]);
            assert!(reader.read(&mut buf, Duration::from_millis(10)).await.is_err());
        }
    }

    #[tokio::test]
    async fn short_write_accepts_one_byte_less() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        handle.set_short_write(true);
        let (_reader, mut writer) = split(bus);

        assert_eq!(writer.write(&[1, 2, 3]).await.unwrap(), 2);
        assert_eq!(handle.written(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn control_lines_are_recorded() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let (_reader, mut writer) = split(bus);

        writer.set_tx_enable(true).unwrap();
        writer.set_break(true).unwrap();
        assert!(handle.break_asserted());
        writer.set_break(false).unwrap();
        writer.set_tx_enable(false).unwrap();

        assert_eq!(handle.tx_enable_log(), vec![true, false]);
        assert_eq!(handle.break_count(), 1);
        assert!(!handle.tx_enabled());
    }

    #[tokio::test]
    async fn disconnected_bus_rejects_io() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        handle.set_connected(false);
        let (mut reader, mut writer) = split(bus);

        assert!(matches!(writer.write(&[1]).await, Err(Error::NotConnected)));
        let mut buf = [0u8; 4];
        assert!(matches!(
            reader.read(&mut buf, Duration::from_millis(1)).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn paired_buses_cross_deliver() {
        let (a, b) = MockBus::pair();
        let (_ra, mut wa) = split(a);
        let (mut rb, _wb) = split(b);

        wa.write(&[0x22, 0x00]).await.unwrap();
        let mut buf = [0u8; 8];
        let n = rb.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x22, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn next_written_walks_the_log() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let (_reader, mut writer) = split(bus);

        writer.write(&[1]).await.unwrap();
        writer.write(&[2]).await.unwrap();
        assert_eq!(handle.next_written(Duration::from_millis(5)).await, Some(vec![1]));
        assert_eq!(handle.next_written(Duration::from_millis(5)).await, Some(vec![2]));
        assert_eq!(handle.next_written(Duration::from_millis(5)).await, None);
    }
}
