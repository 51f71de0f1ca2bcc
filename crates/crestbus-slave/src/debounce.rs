//! Physical switch input: debouncing and gesture detection.
//!
//! [`SwitchDebouncer`] is the pure state machine. It is fed raw samples and
//! the current time and returns the events that became due; it owns no
//! timers and does no I/O. [`SwitchHandler`] drives it from a task that
//! samples a [`SwitchInput`] every poll period and wakes exactly at the
//! machine's next deadline.
//!
//! Timers:
//!
//! - **debounce**: restarted by every observed level change; when it runs
//!   out the last sampled level is committed.
//! - **long press**: armed by a committed press, cancelled by the release.
//! - **double click**: armed by a release. A second release inside the
//!   window is a double click; if the window runs out nothing is emitted.
//!
//! Every committed release toggles the logical switch state, which is
//! forwarded to the [`ProtocolHandler`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crestbus_core::events::{SwitchEvent, SwitchEventKind};
use crestbus_core::timing;

use crate::handler::ProtocolHandler;

/// Timing of the switch input.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub long_press: Duration,
    pub double_click_window: Duration,
    /// The raw input reads `false` while the switch is pressed.
    pub active_low: bool,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        DebounceConfig {
            poll_interval: timing::SWITCH_POLL_INTERVAL,
            debounce: timing::DEBOUNCE_DELAY,
            long_press: timing::LONG_PRESS,
            double_click_window: timing::DOUBLE_CLICK_WINDOW,
            active_low: false,
        }
    }
}

/// Gesture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchStats {
    pub presses: u64,
    pub long_presses: u64,
    pub double_clicks: u64,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Debounce,
    LongPress,
    DoubleClick,
}

/// Debounce and gesture state machine.
#[derive(Debug)]
pub struct SwitchDebouncer {
    config: DebounceConfig,
    last_raw: bool,
    pressed: bool,
    switch_on: bool,
    debounce_at: Option<Instant>,
    long_press_at: Option<Instant>,
    double_click_at: Option<Instant>,
    stats: SwitchStats,
}

impl SwitchDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        SwitchDebouncer {
            config,
            last_raw: false,
            pressed: false,
            switch_on: false,
            debounce_at: None,
            long_press_at: None,
            double_click_at: None,
            stats: SwitchStats::default(),
        }
    }

    /// The debounced physical level.
    pub fn is_pressed(&self) -> bool {
        self.pressed
    }

    /// The logical switch state, toggled on every release.
    pub fn switch_on(&self) -> bool {
        self.switch_on
    }

    /// Align the logical state with an external change (e.g. a bus command)
    /// so the next release toggles from the right value.
    pub fn set_switch_on(&mut self, on: bool) {
        self.switch_on = on;
    }

    pub fn stats(&self) -> SwitchStats {
        self.stats
    }

    /// The earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.debounce_at, self.long_press_at, self.double_click_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Feed one sample of the input (`true` = active). Timers due at `now`
    /// fire first.
    pub fn sample(&mut self, active: bool, now: Instant) -> Vec<SwitchEvent> {
        let events = self.fire_due(now);
        if active != self.last_raw {
            self.last_raw = active;
            self.debounce_at = Some(now + self.config.debounce);
        }
        events
    }

    /// Fire every timer due at `now`, earliest first.
    pub fn fire_due(&mut self, now: Instant) -> Vec<SwitchEvent> {
        let mut events = Vec::new();
        while let Some((timer, at)) = self.earliest_due(now) {
            match timer {
                Timer::Debounce => {
                    self.debounce_at = None;
                    self.commit(self.last_raw, at, &mut events);
                }
                Timer::LongPress => {
                    self.long_press_at = None;
                    self.stats.long_presses += 1;
                    events.push(self.event(SwitchEventKind::LongPress));
                }
                Timer::DoubleClick => {
                    // Window expired: the single click already toggled.
                    self.double_click_at = None;
                }
            }
        }
        events
    }

    fn earliest_due(&self, now: Instant) -> Option<(Timer, Instant)> {
        [
            (Timer::Debounce, self.debounce_at),
            (Timer::LongPress, self.long_press_at),
            (Timer::DoubleClick, self.double_click_at),
        ]
        .into_iter()
        .filter_map(|(timer, at)| at.filter(|at| *at <= now).map(|at| (timer, at)))
        .min_by_key(|(_, at)| *at)
    }

    fn commit(&mut self, level: bool, at: Instant, events: &mut Vec<SwitchEvent>) {
        if level == self.pressed {
            return;
        }
        self.pressed = level;

        if level {
            self.stats.presses += 1;
            self.long_press_at = Some(at + self.config.long_press);
            events.push(self.event(SwitchEventKind::Press));
            return;
        }

        self.long_press_at = None;
        if self.double_click_at.take().is_some() {
            self.stats.double_clicks += 1;
            events.push(self.event(SwitchEventKind::DoubleClick));
        } else {
            self.double_click_at = Some(at + self.config.double_click_window);
        }
        self.switch_on = !self.switch_on;
        events.push(self.event(SwitchEventKind::Release));
    }

    fn event(&self, kind: SwitchEventKind) -> SwitchEvent {
        SwitchEvent {
            kind,
            switch_on: self.switch_on,
        }
    }
}

/// A raw switch level source.
pub trait SwitchInput: Send {
    /// Current raw level of the input line.
    fn read(&mut self) -> bool;
}

/// A switch driven from software, e.g. a simulated button.
#[derive(Debug, Clone, Default)]
pub struct ManualSwitch {
    level: Arc<AtomicBool>,
}

impl ManualSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, level: bool) {
        self.level.store(level, Ordering::Relaxed);
    }
}

impl SwitchInput for ManualSwitch {
    fn read(&mut self) -> bool {
        self.level.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default, Clone, Copy)]
struct Snapshot {
    stats: SwitchStats,
    switch_on: bool,
}

struct Published {
    events: broadcast::Sender<SwitchEvent>,
    snapshot: Mutex<Snapshot>,
}

async fn publish(
    published: &Published,
    machine: &SwitchDebouncer,
    handler: &ProtocolHandler,
    events: Vec<SwitchEvent>,
) {
    *lock(&published.snapshot) = Snapshot {
        stats: machine.stats(),
        switch_on: machine.switch_on(),
    };
    for event in events {
        match event.kind {
            SwitchEventKind::Press => debug!("switch pressed"),
            SwitchEventKind::LongPress => info!("long press"),
            SwitchEventKind::DoubleClick => info!("double click"),
            SwitchEventKind::Release => {
                debug!(on = event.switch_on, "switch released");
                if let Err(e) = handler.set_switch_state(event.switch_on).await {
                    warn!(error = %e, "switch state not forwarded");
                }
            }
        }
        let _ = published.events.send(event);
    }
}

async fn switch_loop(
    mut input: Box<dyn SwitchInput>,
    mut machine: SwitchDebouncer,
    handler: Arc<ProtocolHandler>,
    published: Arc<Published>,
    cancel: CancellationToken,
) {
    let active_low = machine.config.active_low;
    let mut interval = tokio::time::interval(machine.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let deadline = machine.next_deadline();

        let events = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                machine.fire_due(Instant::now())
            }
            _ = interval.tick() => {
                // Pick up switch changes made over the bus before sampling.
                // A busy handler leaves the last known state in place.
                if let Ok(on) = handler.try_switch_state().await {
                    machine.set_switch_on(on);
                }
                let raw = input.read();
                machine.sample(raw != active_low, Instant::now())
            }
        };
        if !events.is_empty() {
            publish(&published, &machine, &handler, events).await;
        }
    }
    debug!("switch handler stopped");
}

/// Runs a [`SwitchDebouncer`] over a [`SwitchInput`] and forwards toggles
/// to the protocol handler.
pub struct SwitchHandler {
    published: Arc<Published>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SwitchHandler {
    /// Start sampling `input`.
    pub fn spawn(
        input: Box<dyn SwitchInput>,
        handler: Arc<ProtocolHandler>,
        config: DebounceConfig,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        let published = Arc::new(Published {
            events,
            snapshot: Mutex::new(Snapshot::default()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(switch_loop(
            input,
            SwitchDebouncer::new(config),
            handler,
            published.clone(),
            cancel.clone(),
        ));
        SwitchHandler {
            published,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitchEvent> {
        self.published.events.subscribe()
    }

    pub fn stats(&self) -> SwitchStats {
        lock(&self.published.snapshot).stats
    }

    /// Logical switch state as of the last gesture.
    pub fn switch_on(&self) -> bool {
        lock(&self.published.snapshot).switch_on
    }

    /// Stop sampling. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SwitchHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn kinds(events: &[SwitchEvent]) -> Vec<SwitchEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    /// Sample `level` every 10ms from `from` to `to` (exclusive).
    fn hold(
        machine: &mut SwitchDebouncer,
        level: bool,
        t0: Instant,
        from: u64,
        to: u64,
    ) -> Vec<SwitchEvent> {
        let mut events = Vec::new();
        let mut t = from;
        while t < to {
            events.extend(machine.sample(level, t0 + MS * t as u32));
            t += 10;
        }
        events
    }

    #[test]
    fn rapid_toggles_collapse_to_one_transition() {
        let mut machine = SwitchDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();

        let mut events = Vec::new();
        for i in 0..5u32 {
            events.extend(machine.sample(i % 2 == 0, t0 + MS * (i * 5)));
        }
        assert!(events.is_empty());

        events.extend(hold(&mut machine, true, t0, 30, 200));
        assert_eq!(kinds(&events), vec![SwitchEventKind::Press]);
        assert!(machine.is_pressed());
        assert_eq!(machine.stats().presses, 1);
    }

    #[test]
    fn press_then_release_toggles_once() {
        let mut machine = SwitchDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();

        let mut events = hold(&mut machine, true, t0, 0, 200);
        events.extend(hold(&mut machine, false, t0, 200, 400));
        assert_eq!(
            kinds(&events),
            vec![SwitchEventKind::Press, SwitchEventKind::Release]
        );
        assert!(events[1].switch_on);
        assert!(machine.switch_on());
    }

    #[test]
    fn double_click_fires_once_and_toggles_twice() {
        let mut machine = SwitchDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();

        let mut events = hold(&mut machine, true, t0, 0, 80);
        events.extend(hold(&mut machine, false, t0, 80, 160));
        events.extend(hold(&mut machine, true, t0, 160, 240));
        events.extend(hold(&mut machine, false, t0, 240, 800));

        assert_eq!(
            kinds(&events),
            vec![
                SwitchEventKind::Press,
                SwitchEventKind::Release,
                SwitchEventKind::Press,
                SwitchEventKind::DoubleClick,
                SwitchEventKind::Release,
            ]
        );
        assert_eq!(machine.stats().double_clicks, 1);
        assert!(!machine.switch_on());
    }

    #[test]
    fn slow_clicks_are_not_double() {
        let mut machine = SwitchDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();

        let mut events = hold(&mut machine, true, t0, 0, 100);
        events.extend(hold(&mut machine, false, t0, 100, 600));
        events.extend(hold(&mut machine, true, t0, 600, 700));
        events.extend(hold(&mut machine, false, t0, 700, 1200));

        assert!(!kinds(&events).contains(&SwitchEventKind::DoubleClick));
        assert_eq!(machine.stats().presses, 2);
        assert!(!machine.switch_on());
    }

    #[test]
    fn long_press_fires_after_hold() {
        let mut machine = SwitchDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();

        machine.sample(true, t0);
        let press = machine.fire_due(t0 + MS * 50);
        assert_eq!(kinds(&press), vec![SwitchEventKind::Press]);

        assert_eq!(machine.next_deadline(), Some(t0 + MS * 1050));
        assert!(machine.fire_due(t0 + MS * 1049).is_empty());
        let long = machine.fire_due(t0 + MS * 1050);
        assert_eq!(kinds(&long), vec![SwitchEventKind::LongPress]);
        assert_eq!(machine.stats().long_presses, 1);
    }

    #[test]
    fn release_cancels_long_press() {
        let mut machine = SwitchDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();

        let mut events = hold(&mut machine, true, t0, 0, 500);
        events.extend(hold(&mut machine, false, t0, 500, 2000));
        assert!(!kinds(&events).contains(&SwitchEventKind::LongPress));
        assert_eq!(machine.stats().long_presses, 0);
    }

    #[test]
    fn set_switch_on_changes_next_toggle() {
        let mut machine = SwitchDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();
        machine.set_switch_on(true);

        let mut events = hold(&mut machine, true, t0, 0, 100);
        events.extend(hold(&mut machine, false, t0, 100, 200));
        assert!(!events.last().unwrap().switch_on);
    }

    mod task {
        use super::*;
        use crestbus_test_harness::MockBus;
        use crestbus_transport::{SlaveTiming, TimedTransport};

        fn handler() -> Arc<ProtocolHandler> {
            let transport = TimedTransport::new(Box::new(MockBus::new("mock")), SlaveTiming::default());
            let handler = Arc::new(ProtocolHandler::new(0x22, transport, 16));
            handler.initialize().unwrap();
            handler
        }

        #[tokio::test(start_paused = true)]
        async fn release_forwards_toggle_to_handler() {
            let handler = handler();
            let button = ManualSwitch::new();
            let switch = SwitchHandler::spawn(
                Box::new(button.clone()),
                handler.clone(),
                DebounceConfig::default(),
                16,
            );
            let mut events = switch.subscribe();

            button.set(true);
            tokio::time::sleep(Duration::from_millis(200)).await;
            button.set(false);
            tokio::time::sleep(Duration::from_millis(200)).await;

            assert!(handler.switch_state().await);
            assert!(switch.switch_on());
            assert_eq!(switch.stats().presses, 1);
            assert_eq!(events.try_recv().unwrap().kind, SwitchEventKind::Press);
            let release = events.try_recv().unwrap();
            assert_eq!(release.kind, SwitchEventKind::Release);
            assert!(release.switch_on);

            switch.shutdown().await;
            switch.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn active_low_input_is_inverted() {
            let handler = handler();
            let button = ManualSwitch::new();
            button.set(true);
            let config = DebounceConfig {
                active_low: true,
                ..DebounceConfig::default()
            };
            let switch = SwitchHandler::spawn(Box::new(button.clone()), handler.clone(), config, 16);

            // Idle high: no press.
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(switch.stats().presses, 0);

            button.set(false);
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(switch.stats().presses, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn long_press_is_broadcast() {
            let handler = handler();
            let button = ManualSwitch::new();
            let switch = SwitchHandler::spawn(
                Box::new(button.clone()),
                handler.clone(),
                DebounceConfig::default(),
                16,
            );
            let mut events = switch.subscribe();

            button.set(true);
            tokio::time::sleep(Duration::from_millis(1500)).await;

            assert_eq!(events.try_recv().unwrap().kind, SwitchEventKind::Press);
            assert_eq!(events.try_recv().unwrap().kind, SwitchEventKind::LongPress);
            assert_eq!(switch.stats().long_presses, 1);
            assert!(!handler.switch_state().await);
        }
    }
}
