//! [`BusMaster`]: the running bus master.
//!
//! The master owns a [`HalfDuplexTransport`], the [`SlaveRegistry`] behind a
//! mutex, and two tasks:
//!
//! - the **ticker**, which runs a registry polling tick every ping interval
//!   and expires an outstanding ping the moment its timeout elapses. The
//!   timeout is armed when the consumer dispatches the ping, not when the
//!   tick queues it;
//! - the **consumer**, the single reader of the command queue. Before each
//!   command it drains every inbound frame already received so responses are
//!   classified promptly, and it is the only code that hands frames to the
//!   transport.
//!
//! Registry access from any task or caller goes through a lock acquired with
//! a bounded timeout. Readers that cannot get the lock in time fall back to
//! a default answer instead of blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crestbus_core::error::{Error, Result};
use crestbus_core::events::BusEvent;
use crestbus_core::frame::Frame;
use crestbus_core::protocol;
use crestbus_core::timing;
use crestbus_core::types::{DeviceType, SlaveState, TransportStats};
use crestbus_transport::HalfDuplexTransport;

use crate::commands::{Command, DimCommand};
use crate::queue::{COMMAND_QUEUE_CAPACITY, CommandQueue, CommandReceiver, command_queue};
use crate::registry::{ConfigProgress, RegistryStats, SlaveDescriptor, SlaveRegistry};
use crate::templates;

/// Scheduling parameters of the master.
#[derive(Debug, Clone)]
pub struct MasterTiming {
    /// Period of the polling tick.
    pub ping_interval: Duration,
    /// Gap between two configuration steps.
    pub config_step_delay: Duration,
    /// Pause after each dim command.
    pub inter_command_delay: Duration,
    /// How long the consumer waits for a command before draining again.
    pub consumer_wait: Duration,
    /// Bound on every registry lock acquisition.
    pub lock_timeout: Duration,
    /// Bound on waiting for room in the command queue.
    pub enqueue_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for MasterTiming {
    fn default() -> Self {
        MasterTiming {
            ping_interval: timing::PING_INTERVAL,
            config_step_delay: timing::CONFIG_STEP_DELAY,
            inter_command_delay: timing::INTER_COMMAND_DELAY,
            consumer_wait: Duration::from_millis(10),
            lock_timeout: timing::LOCK_TIMEOUT,
            enqueue_timeout: Duration::from_millis(50),
            queue_capacity: COMMAND_QUEUE_CAPACITY,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    transport: HalfDuplexTransport,
    registry: tokio::sync::Mutex<SlaveRegistry>,
    events: broadcast::Sender<BusEvent>,
    polling: AtomicBool,
    /// Wakes the ticker when a ping deadline is armed.
    ping_armed: Notify,
    timing: MasterTiming,
}

impl Shared {
    /// Run `f` on the registry under the bounded lock, then publish the
    /// events it produced.
    async fn with_registry<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SlaveRegistry) -> R + Send,
        R: Send,
    {
        let Ok(mut registry) =
            tokio::time::timeout(self.timing.lock_timeout, self.registry.lock()).await
        else {
            warn!("registry lock timed out");
            return Err(Error::LockTimeout);
        };
        let result = f(&mut registry);
        for event in registry.take_events() {
            if let BusEvent::SlaveStateChanged { address, from, to } = event {
                debug!(address = format_args!("0x{address:02X}"), %from, %to, "slave state changed");
            }
            let _ = self.events.send(event);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Ticker
    // -----------------------------------------------------------------------

    async fn poll_tick(&self, queue: &CommandQueue) {
        if !self.polling.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        let Ok(outcome) = self.with_registry(|r| r.tick(now)).await else {
            return;
        };
        if let Some(address) = outcome.timed_out {
            self.timed_out(address, queue).await;
        }
        if let Some(address) = outcome.ping {
            // A tick that cannot be queued is dropped, not delayed.
            if queue.try_enqueue(Command::Ping(address)).is_err() {
                debug!(address = format_args!("0x{address:02X}"), "command queue full, ping skipped");
                let _ = self.with_registry(|r| r.cancel_ping(address)).await;
            }
        }
    }

    async fn expire_ping(&self, queue: &CommandQueue) {
        let now = Instant::now();
        if let Ok(Some(address)) = self.with_registry(|r| r.expire(now)).await {
            self.timed_out(address, queue).await;
        }
    }

    /// Every timeout gets exactly one break. It is queued behind the
    /// commands already waiting; with the queue full it goes out directly.
    async fn timed_out(&self, address: u8, queue: &CommandQueue) {
        warn!(address = format_args!("0x{address:02X}"), "ping timeout");
        if let Err(e) = queue.try_enqueue(Command::Break) {
            debug!(error = %e, "break not queued, sending directly");
            self.send_break().await;
        }
    }

    async fn send_break(&self) {
        match self.transport.send_break().await {
            Ok(()) => {
                let _ = self.events.send(BusEvent::BreakSent);
            }
            Err(e) => warn!(error = %e, "break not sent"),
        }
    }

    // -----------------------------------------------------------------------
    // Consumer
    // -----------------------------------------------------------------------

    async fn drain_inbound(&self) {
        while let Some(frame) = self.transport.try_receive_message() {
            self.classify(frame).await;
        }
    }

    async fn classify(&self, frame: Frame) {
        let data = frame.bytes();
        if protocol::is_ping_response(data) {
            match self.with_registry(|r| r.ping_response()).await {
                Ok(Some(address)) => {
                    trace!(address = format_args!("0x{address:02X}"), "ping answered");
                }
                Ok(None) => debug!("ping response with no ping outstanding"),
                Err(_) => {}
            }
        } else if let Some(on) = protocol::parse_switch_ack(data) {
            debug!(on, "switch acknowledgment");
        } else {
            debug!(bytes = data.len(), data = ?data, "unrecognized frame");
            let _ = self.with_registry(|r| r.unknown_frame()).await;
        }
    }

    async fn dispatch(&self, command: Command, queue: &CommandQueue) {
        match command {
            Command::Ping(address) => self.ping(address).await,
            Command::Break => self.send_break().await,
            Command::Dim(dim) => {
                let frame = dim.encode();
                if let Err(e) = self.transport.send_message(&frame).await {
                    warn!(address = format_args!("0x{:02X}", dim.address), error = %e, "dim command not sent");
                }
                let _ = self
                    .with_registry(|r| r.command_dispatched(dim.address))
                    .await;
                tokio::time::sleep(self.timing.inter_command_delay).await;
            }
            Command::ConfigStep(address) => self.config_step(address, queue).await,
        }
    }

    async fn ping(&self, address: u8) {
        // Released or deregistered while it waited in the queue.
        if let Ok(false) = self.with_registry(|r| r.ping_pending(address)).await {
            debug!(address = format_args!("0x{address:02X}"), "stale ping dropped");
            return;
        }
        match self.transport.send_ping(address).await {
            Ok(()) => {
                let now = Instant::now();
                let _ = self.with_registry(|r| r.ping_dispatched(address, now)).await;
                self.ping_armed.notify_one();
            }
            Err(e) => {
                warn!(address = format_args!("0x{address:02X}"), error = %e, "ping not sent");
                let _ = self.with_registry(|r| r.cancel_ping(address)).await;
            }
        }
    }

    async fn config_step(&self, address: u8, queue: &CommandQueue) {
        let step = match self.with_registry(|r| r.next_config_step(address)).await {
            Ok(Ok(step)) => step,
            Ok(Err(e)) => {
                debug!(address = format_args!("0x{address:02X}"), error = %e, "configuration step dropped");
                return;
            }
            Err(_) => return self.abort_configuration(address).await,
        };

        let frame = templates::step_frame(address, step);
        if let Err(e) = self.transport.send_message(&frame).await {
            warn!(address = format_args!("0x{address:02X}"), step = %step.step, error = %e, "configuration step not sent");
            return self.abort_configuration(address).await;
        }

        match self
            .with_registry(|r| r.config_step_sent(address, step.step))
            .await
        {
            Ok(Ok(ConfigProgress::Continue)) => {
                tokio::time::sleep(self.timing.config_step_delay).await;
                if let Err(e) = queue.try_enqueue(Command::ConfigStep(address)) {
                    warn!(address = format_args!("0x{address:02X}"), error = %e, "next configuration step not queued");
                    self.abort_configuration(address).await;
                }
            }
            Ok(Ok(ConfigProgress::Complete)) => {
                info!(address = format_args!("0x{address:02X}"), "configuration complete");
            }
            Ok(Err(e)) => {
                debug!(address = format_args!("0x{address:02X}"), error = %e, "configuration abandoned");
            }
            Err(_) => self.abort_configuration(address).await,
        }
    }

    async fn abort_configuration(&self, address: u8) {
        warn!(address = format_args!("0x{address:02X}"), "configuration aborted");
        let _ = self.with_registry(|r| r.abort_configuration(address)).await;
    }
}

async fn ticker_loop(shared: Arc<Shared>, queue: CommandQueue, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(shared.timing.ping_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let deadline = shared
            .with_registry(|r| r.ping_deadline())
            .await
            .ok()
            .flatten();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                shared.expire_ping(&queue).await;
            }
            _ = shared.ping_armed.notified() => {}
            _ = interval.tick() => shared.poll_tick(&queue).await,
        }
    }
    debug!("ticker stopped");
}

async fn consumer_loop(
    shared: Arc<Shared>,
    mut commands: CommandReceiver,
    queue: CommandQueue,
    cancel: CancellationToken,
) {
    loop {
        shared.drain_inbound().await;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => shared.dispatch(command, &queue).await,
                None => break,
            },
            frame = shared.transport.receive_message(shared.timing.consumer_wait) => {
                if let Some(frame) = frame {
                    shared.classify(frame).await;
                }
            }
        }
    }
    debug!("command consumer stopped");
}

struct Workers {
    queue: CommandQueue,
    cancel: CancellationToken,
    ticker: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

/// A bus master polling a fixed population of slaves.
///
/// Construct with [`MasterBuilder`](crate::MasterBuilder).
pub struct BusMaster {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl BusMaster {
    pub(crate) fn new(
        transport: HalfDuplexTransport,
        registry: SlaveRegistry,
        timing: MasterTiming,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        BusMaster {
            shared: Arc::new(Shared {
                transport,
                registry: tokio::sync::Mutex::new(registry),
                events,
                polling: AtomicBool::new(false),
                ping_armed: Notify::new(),
                timing,
            }),
            workers: Mutex::new(None),
        }
    }

    /// Start the transport, the ticker and the command consumer.
    /// Idempotent.
    pub fn initialize(&self) -> Result<()> {
        let mut workers = lock(&self.workers);
        if workers.is_some() {
            return Ok(());
        }
        self.shared.transport.initialize()?;

        let (queue, commands) = command_queue(self.shared.timing.queue_capacity);
        let cancel = CancellationToken::new();
        let ticker = tokio::spawn(ticker_loop(
            self.shared.clone(),
            queue.clone(),
            cancel.clone(),
        ));
        let consumer = tokio::spawn(consumer_loop(
            self.shared.clone(),
            commands,
            queue.clone(),
            cancel.clone(),
        ));
        *workers = Some(Workers {
            queue,
            cancel,
            ticker,
            consumer,
        });
        info!(port = %self.shared.transport.port_name(), "bus master initialized");
        Ok(())
    }

    /// Stop polling and dispatch, drop the command queue and release the
    /// port. Idempotent.
    pub async fn deinitialize(&self) {
        let workers = lock(&self.workers).take();
        if let Some(workers) = workers {
            workers.cancel.cancel();
            let _ = workers.ticker.await;
            let _ = workers.consumer.await;
            self.shared.transport.deinitialize().await;
            info!(port = %self.shared.transport.port_name(), "bus master deinitialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.workers).is_some()
    }

    fn queue(&self) -> Result<CommandQueue> {
        lock(&self.workers)
            .as_ref()
            .map(|w| w.queue.clone())
            .ok_or(Error::NotInitialized)
    }

    pub fn port_name(&self) -> &str {
        self.shared.transport.port_name()
    }

    /// Register a slave. Re-registering an address replaces its descriptor,
    /// which is also how a slave leaves the `Error` state.
    pub async fn add_slave(&self, address: u8, device_type: DeviceType) -> Result<()> {
        let replaced = self
            .shared
            .with_registry(|r| r.add_slave(address, device_type))
            .await?;
        info!(address = format_args!("0x{address:02X}"), %device_type, replaced, "slave registered");
        Ok(())
    }

    pub async fn remove_slave(&self, address: u8) -> Result<()> {
        self.shared
            .with_registry(|r| r.remove_slave(address))
            .await?
            .ok_or(Error::UnknownSlave(address))?;
        info!(address = format_args!("0x{address:02X}"), "slave removed");
        Ok(())
    }

    /// Turn round-robin polling on or off.
    pub fn enable_polling(&self, enabled: bool) {
        let was = self.shared.polling.swap(enabled, Ordering::Relaxed);
        if was != enabled {
            info!(enabled, "polling toggled");
            let _ = self.shared.events.send(BusEvent::PollingChanged { enabled });
        }
    }

    pub fn is_polling(&self) -> bool {
        self.shared.polling.load(Ordering::Relaxed)
    }

    async fn send_dim(&self, dim: DimCommand) -> Result<()> {
        let queue = self.queue()?;
        self.shared
            .with_registry(|r| r.command_queued(dim.address))
            .await?;
        if let Err(e) = queue
            .enqueue(Command::Dim(dim), self.shared.timing.enqueue_timeout)
            .await
        {
            let _ = self
                .shared
                .with_registry(|r| r.command_dispatched(dim.address))
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Queue a dim command using the short frame layout.
    pub async fn send_dim_command(
        &self,
        address: u8,
        channel: u8,
        level: u8,
        ramp_ms: u16,
    ) -> Result<()> {
        self.send_dim(DimCommand::short(address, channel, level, ramp_ms))
            .await
    }

    /// Queue a dim command using the universal-dimmer (long) frame layout.
    pub async fn send_dimu_command(
        &self,
        address: u8,
        channel: u8,
        level: u8,
        ramp_ms: u16,
    ) -> Result<()> {
        self.send_dim(DimCommand::long(address, channel, level, ramp_ms))
            .await
    }

    /// Start the configuration sequence for a live slave.
    pub async fn request_configuration(&self, address: u8) -> Result<()> {
        let queue = self.queue()?;
        self.shared
            .with_registry(|r| r.request_configuration(address))
            .await??;
        if let Err(e) = queue
            .enqueue(
                Command::ConfigStep(address),
                self.shared.timing.enqueue_timeout,
            )
            .await
        {
            self.shared.abort_configuration(address).await;
            return Err(e);
        }
        debug!(address = format_args!("0x{address:02X}"), "configuration requested");
        Ok(())
    }

    /// State of `address`, or `Offline` if it is unknown or the registry is
    /// busy.
    pub async fn get_slave_state(&self, address: u8) -> SlaveState {
        self.shared
            .with_registry(|r| r.state(address))
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Addresses that are `Online` or `Configured`.
    pub async fn get_online_slaves(&self) -> Vec<u8> {
        self.shared
            .with_registry(|r| r.online_addresses())
            .await
            .unwrap_or_default()
    }

    pub async fn get_offline_slaves(&self) -> Vec<u8> {
        self.shared
            .with_registry(|r| r.offline_addresses())
            .await
            .unwrap_or_default()
    }

    /// Snapshot of one slave's descriptor.
    pub async fn slave_info(&self, address: u8) -> Option<SlaveDescriptor> {
        self.shared
            .with_registry(|r| r.get(address).cloned())
            .await
            .ok()
            .flatten()
    }

    pub async fn stats(&self) -> RegistryStats {
        self.shared
            .with_registry(|r| r.stats())
            .await
            .unwrap_or_default()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.shared.transport.stats()
    }

    /// Subscribe to bus events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for BusMaster {
    fn drop(&mut self) {
        if let Some(workers) = lock(&self.workers).take() {
            workers.cancel.cancel();
            workers.ticker.abort();
            workers.consumer.abort();
        }
    }
}
