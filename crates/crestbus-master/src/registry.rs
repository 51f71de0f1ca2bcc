//! The slave registry and the per-slave liveness/configuration state machine.
//!
//! [`SlaveRegistry`] is plain data: every transition takes an explicit
//! [`Instant`] and nothing here sleeps, locks or spawns. [`BusMaster`] keeps
//! it behind a mutex and drives it from the polling ticker and the command
//! consumer; tests drive it directly.
//!
//! # Polling
//!
//! Each tick first expires the outstanding ping if its timeout has elapsed
//! (the slave goes `Offline`, its error counter increments and the caller is
//! told to emit a break). It then selects the next slave in address order and
//! pings it if it is `Offline`, `Online` or `Configured` and no unexpired
//! ping is outstanding. The cursor advances once per tick either way, so a
//! population of N slaves is fully inspected every N ticks.
//!
//! At most one ping is outstanding at any time. A ping response carries no
//! source address; it is matched to that single outstanding ping.
//!
//! A selected ping is only *queued*. Its timeout starts when the consumer
//! reports it handed to the transport ([`SlaveRegistry::ping_dispatched`]);
//! until then it cannot expire and a response cannot match it. A ping still
//! waiting behind other commands after `dispatch_timeout` is released
//! without penalty and never sent.
//!
//! [`BusMaster`]: crate::BusMaster

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crestbus_core::error::{Error, Result};
use crestbus_core::events::BusEvent;
use crestbus_core::timing::PING_TIMEOUT;
use crestbus_core::types::{ConfigStep, DeviceType, SlaveState};

use crate::templates::{self, TemplateStep};

/// Registry behaviour that callers may tune.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Time a slave has to answer a ping.
    pub ping_timeout: Duration,
    /// Error count at which a slave is parked in `Error`.
    pub max_errors: u8,
    /// How long a selected ping may wait in the command queue.
    pub dispatch_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            ping_timeout: PING_TIMEOUT,
            max_errors: u8::MAX,
            dispatch_timeout: Duration::from_millis(250),
        }
    }
}

/// Everything the master knows about one slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveDescriptor {
    pub address: u8,
    pub device_type: DeviceType,
    pub state: SlaveState,
    pub config_step: ConfigStep,
    pub last_ping: Option<Instant>,
    pub error_count: u8,
    /// Dim commands queued but not yet dispatched.
    pub pending_commands: u16,
    /// The slave completed a configuration sequence and has not timed out
    /// since.
    pub configured: bool,
}

impl SlaveDescriptor {
    fn new(address: u8, device_type: DeviceType) -> Self {
        SlaveDescriptor {
            address,
            device_type,
            state: SlaveState::Offline,
            config_step: ConfigStep::None,
            last_ping: None,
            error_count: 0,
            pending_commands: 0,
            configured: false,
        }
    }
}

/// Registry-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Pings handed to the transport.
    pub total_pings: u64,
    pub successful_pings: u64,
    /// Ping responses that arrived with no dispatched ping outstanding.
    pub unmatched_responses: u64,
    pub timeouts: u64,
    pub configurations: u64,
    /// Inbound frames that matched nothing.
    pub unknown_frames: u64,
}

/// What a polling tick decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// A slave whose ping just timed out; a break must follow.
    pub timed_out: Option<u8>,
    /// A slave that must be pinged now.
    pub ping: Option<u8>,
}

/// Result of recording a dispatched configuration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigProgress {
    /// More steps follow.
    Continue,
    /// The sequence finished; the slave is `Configured`.
    Complete,
}

#[derive(Debug, Clone, Copy)]
struct OutstandingPing {
    address: u8,
    queued_at: Instant,
    /// Set once the ping is on its way to the wire.
    sent_at: Option<Instant>,
    previous: SlaveState,
}

/// Authoritative per-address slave state.
#[derive(Debug, Default)]
pub struct SlaveRegistry {
    slaves: BTreeMap<u8, SlaveDescriptor>,
    cursor: usize,
    outstanding: Option<OutstandingPing>,
    config: RegistryConfig,
    stats: RegistryStats,
    events: Vec<BusEvent>,
}

fn transition(slave: &mut SlaveDescriptor, to: SlaveState, events: &mut Vec<BusEvent>) {
    if slave.state == to {
        return;
    }
    let from = slave.state;
    slave.state = to;
    events.push(BusEvent::SlaveStateChanged {
        address: slave.address,
        from,
        to,
    });
}

impl SlaveRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        SlaveRegistry {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register `address`. An existing descriptor for the address is
    /// replaced by a fresh `Offline` one; returns `true` in that case.
    pub fn add_slave(&mut self, address: u8, device_type: DeviceType) -> bool {
        self.forget_ping_for(address);
        self.slaves
            .insert(address, SlaveDescriptor::new(address, device_type))
            .is_some()
    }

    /// Deregister `address`.
    pub fn remove_slave(&mut self, address: u8) -> Option<SlaveDescriptor> {
        self.forget_ping_for(address);
        self.slaves.remove(&address)
    }

    fn forget_ping_for(&mut self, address: u8) {
        if self.outstanding.is_some_and(|p| p.address == address) {
            self.outstanding = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn contains(&self, address: u8) -> bool {
        self.slaves.contains_key(&address)
    }

    pub fn get(&self, address: u8) -> Option<&SlaveDescriptor> {
        self.slaves.get(&address)
    }

    /// Registered addresses in polling order.
    pub fn addresses(&self) -> Vec<u8> {
        self.slaves.keys().copied().collect()
    }

    pub fn state(&self, address: u8) -> Option<SlaveState> {
        self.slaves.get(&address).map(|s| s.state)
    }

    /// Addresses that are `Online` or `Configured`.
    pub fn online_addresses(&self) -> Vec<u8> {
        self.addresses_where(|s| s.is_online())
    }

    /// Addresses that are `Offline` or parked in `Error`.
    pub fn offline_addresses(&self) -> Vec<u8> {
        self.addresses_where(|s| matches!(s, SlaveState::Offline | SlaveState::Error))
    }

    fn addresses_where(&self, pred: impl Fn(SlaveState) -> bool) -> Vec<u8> {
        self.slaves
            .values()
            .filter(|s| pred(s.state))
            .map(|s| s.address)
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    /// Drain the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<BusEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// When the outstanding ping times out. `None` while no ping has been
    /// dispatched.
    pub fn ping_deadline(&self) -> Option<Instant> {
        self.outstanding
            .and_then(|p| p.sent_at)
            .map(|sent_at| sent_at + self.config.ping_timeout)
    }

    /// The address of the outstanding ping, if any.
    pub fn outstanding_ping(&self) -> Option<u8> {
        self.outstanding.map(|p| p.address)
    }

    /// Whether a ping for `address` is selected but not yet dispatched.
    pub fn ping_pending(&self, address: u8) -> bool {
        self.outstanding
            .is_some_and(|p| p.address == address && p.sent_at.is_none())
    }

    /// Expire the outstanding ping if its timeout has elapsed at `now`.
    /// Returns the address that timed out. Undispatched pings never expire.
    pub fn expire(&mut self, now: Instant) -> Option<u8> {
        let ping = self.outstanding?;
        let sent_at = ping.sent_at?;
        if now.saturating_duration_since(sent_at) < self.config.ping_timeout {
            return None;
        }
        self.outstanding = None;
        self.stats.timeouts += 1;

        let slave = self.slaves.get_mut(&ping.address)?;
        slave.error_count = slave.error_count.saturating_add(1);
        slave.configured = false;
        slave.config_step = ConfigStep::None;
        transition(slave, SlaveState::Offline, &mut self.events);
        self.events.push(BusEvent::PingTimeout {
            address: ping.address,
            error_count: slave.error_count,
        });
        if slave.error_count >= self.config.max_errors {
            transition(slave, SlaveState::Error, &mut self.events);
        }
        Some(ping.address)
    }

    /// Run one polling tick at `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome {
            timed_out: self.expire(now),
            ping: None,
        };
        let released = self.release_stale_ping(now);
        if self.slaves.is_empty() {
            return outcome;
        }

        let len = self.slaves.len();
        let selected = self.slaves.keys().nth(self.cursor % len).copied();
        self.cursor = (self.cursor + 1) % len;

        if released || self.outstanding.is_some() {
            return outcome;
        }
        let Some(slave) = selected.and_then(|address| self.slaves.get_mut(&address)) else {
            return outcome;
        };
        if !slave.state.is_pollable() {
            return outcome;
        }

        self.outstanding = Some(OutstandingPing {
            address: slave.address,
            queued_at: now,
            sent_at: None,
            previous: slave.state,
        });
        transition(slave, SlaveState::PingSent, &mut self.events);
        outcome.ping = Some(slave.address);
        outcome
    }

    /// The ping selected by [`tick`](Self::tick) was handed to the transport
    /// at `now`; its timeout runs from here.
    pub fn ping_dispatched(&mut self, address: u8, now: Instant) {
        self.stats.total_pings += 1;
        if let Some(ping) = self
            .outstanding
            .as_mut()
            .filter(|p| p.address == address && p.sent_at.is_none())
        {
            ping.sent_at = Some(now);
            if let Some(slave) = self.slaves.get_mut(&address) {
                slave.last_ping = Some(now);
            }
        }
    }

    fn release_stale_ping(&mut self, now: Instant) -> bool {
        let Some(ping) = self.outstanding.filter(|p| p.sent_at.is_none()) else {
            return false;
        };
        if now.saturating_duration_since(ping.queued_at) < self.config.dispatch_timeout {
            return false;
        }
        self.cancel_ping(ping.address);
        true
    }

    /// The ping selected by [`tick`](Self::tick) never left; restore the
    /// slave's previous state.
    pub fn cancel_ping(&mut self, address: u8) {
        let Some(ping) = self.outstanding.filter(|p| p.address == address) else {
            return;
        };
        self.outstanding = None;
        if let Some(slave) = self.slaves.get_mut(&address) {
            transition(slave, ping.previous, &mut self.events);
        }
    }

    /// A ping response arrived. Returns the slave it answered for.
    pub fn ping_response(&mut self) -> Option<u8> {
        let Some(ping) = self.outstanding.take_if(|p| p.sent_at.is_some()) else {
            self.stats.unmatched_responses += 1;
            self.events.push(BusEvent::UnmatchedResponse);
            return None;
        };
        self.stats.successful_pings += 1;
        let slave = self.slaves.get_mut(&ping.address)?;
        let to = if slave.configured {
            SlaveState::Configured
        } else {
            SlaveState::Online
        };
        transition(slave, to, &mut self.events);
        Some(ping.address)
    }

    /// Count an inbound frame that matched nothing.
    pub fn unknown_frame(&mut self) {
        self.stats.unknown_frames += 1;
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    fn slave_mut(&mut self, address: u8) -> Result<&mut SlaveDescriptor> {
        self.slaves
            .get_mut(&address)
            .ok_or(Error::UnknownSlave(address))
    }

    /// Start a configuration sequence. Only live slaves can be configured.
    pub fn request_configuration(&mut self, address: u8) -> Result<()> {
        let slave = self.slaves.get_mut(&address).ok_or(Error::UnknownSlave(address))?;
        if !slave.state.is_online() {
            return Err(Error::InvalidState {
                address,
                state: slave.state,
            });
        }
        slave.config_step = ConfigStep::None;
        transition(slave, SlaveState::ConfigRequested, &mut self.events);
        Ok(())
    }

    /// The template step to send next for a slave being configured.
    pub fn next_config_step(&mut self, address: u8) -> Result<&'static TemplateStep> {
        let slave = self.slave_mut(address)?;
        if !slave.state.is_configuring() {
            return Err(Error::InvalidState {
                address,
                state: slave.state,
            });
        }
        templates::next_step(slave.device_type, slave.config_step).ok_or(Error::InvalidState {
            address,
            state: slave.state,
        })
    }

    /// Record that `step` was accepted by the transport.
    pub fn config_step_sent(&mut self, address: u8, step: ConfigStep) -> Result<ConfigProgress> {
        let slave = self.slaves.get_mut(&address).ok_or(Error::UnknownSlave(address))?;
        if !slave.state.is_configuring() {
            return Err(Error::InvalidState {
                address,
                state: slave.state,
            });
        }
        transition(slave, SlaveState::Configuring, &mut self.events);
        slave.config_step = step;
        self.events.push(BusEvent::ConfigStepSent { address, step });

        if !templates::is_last_step(slave.device_type, step) {
            return Ok(ConfigProgress::Continue);
        }
        slave.config_step = ConfigStep::Complete;
        slave.configured = true;
        transition(slave, SlaveState::Configured, &mut self.events);
        self.events.push(BusEvent::ConfigurationComplete { address });
        self.stats.configurations += 1;
        Ok(ConfigProgress::Complete)
    }

    /// Abandon a configuration sequence: the slave returns to `Online` with
    /// one more error on its counter. No retry is scheduled.
    pub fn abort_configuration(&mut self, address: u8) {
        let max_errors = self.config.max_errors;
        let Some(slave) = self.slaves.get_mut(&address) else {
            return;
        };
        if !slave.state.is_configuring() {
            return;
        }
        let step = slave.config_step;
        slave.config_step = ConfigStep::None;
        slave.error_count = slave.error_count.saturating_add(1);
        transition(slave, SlaveState::Online, &mut self.events);
        self.events
            .push(BusEvent::ConfigurationAborted { address, step });
        if slave.error_count >= max_errors {
            transition(slave, SlaveState::Error, &mut self.events);
        }
    }

    // -----------------------------------------------------------------------
    // Dim bookkeeping
    // -----------------------------------------------------------------------

    pub fn command_queued(&mut self, address: u8) {
        if let Some(slave) = self.slaves.get_mut(&address) {
            slave.pending_commands = slave.pending_commands.saturating_add(1);
        }
    }

    pub fn command_dispatched(&mut self, address: u8) {
        if let Some(slave) = self.slaves.get_mut(&address) {
            slave.pending_commands = slave.pending_commands.saturating_sub(1);
        }
    }
}
