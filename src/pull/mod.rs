use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::event::AtomEvent;
use crate::guardrail::{ConfigKey, EngineStats};

/// Sentinel for "no pull scheduled".
pub const NO_ALARM: i64 = i64::MAX;
/// Floor for per-puller cooldown.
pub const MIN_COOL_DOWN_NS: i64 = 1_000_000_000;
/// Ceiling for per-puller timeout.
pub const MAX_TIMEOUT_NS: i64 = 10_000_000_000;
/// Scheduled pulls are at least one minute apart outside test mode.
pub const MIN_INTERVAL_NS: i64 = 60 * 1_000_000_000;

const NS_PER_MINUTE: i64 = 60 * 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    Success,
    Fail,
    Timeout,
    DeadObject,
    NotNeeded,
}

/// A data source that can be sampled on demand.
pub trait Puller: Send + Sync {
    fn pull(&self, event_time_ns: i64) -> (PullResult, Vec<AtomEvent>);
}

/// A consumer of pulled data, registered per `(atom, config)`.
///
/// Held by weak reference: expired receivers are collected on next touch.
pub trait PullDataReceiver: Send + Sync {
    fn is_pull_needed(&self) -> bool;
    fn on_data_pulled(&self, events: &[AtomEvent], result: PullResult, elapsed_ts_ns: i64);
}

/// External collaborator told when the single global pull alarm moves.
pub trait PullAlarmSink: Send + Sync {
    fn set_pulling_alarm(&self, next_pull_ns: i64);
}

struct PullCache {
    last_pull_ns: i64,
    last_result: PullResult,
    cached: Vec<AtomEvent>,
}

struct PullerEntry {
    atom_id: u32,
    cool_down_ns: i64,
    timeout_ns: i64,
    puller: Box<dyn Puller>,
    cache: Mutex<PullCache>,
}

impl PullerEntry {
    /// Invokes the puller, honoring the cooldown cache and the timeout.
    fn pull(&self, event_time_ns: i64, stats: &EngineStats) -> (PullResult, Vec<AtomEvent>) {
        {
            let cache = self.cache.lock();
            if cache.last_pull_ns != 0
                && event_time_ns - cache.last_pull_ns < self.cool_down_ns
                && cache.last_result == PullResult::Success
            {
                trace!(atom_id = self.atom_id, "pull served from cooldown cache");
                return (PullResult::Success, cache.cached.clone());
            }
        }

        let started = Instant::now();
        let (mut result, events) = self.puller.pull(event_time_ns);
        let elapsed_ns = started.elapsed().as_nanos() as i64;
        if result == PullResult::Success && elapsed_ns > self.timeout_ns {
            stats.note_pull_timeout(self.atom_id);
            warn!(
                atom_id = self.atom_id,
                elapsed_ns, "pull exceeded its timeout",
            );
            result = PullResult::Timeout;
        }
        if result != PullResult::Success {
            stats.note_pull_failed(self.atom_id);
        }

        let mut cache = self.cache.lock();
        cache.last_pull_ns = event_time_ns;
        cache.last_result = result;
        cache.cached = if result == PullResult::Success {
            events.clone()
        } else {
            Vec::new()
        };
        (result, events)
    }
}

struct ReceiverInfo {
    receiver: Weak<dyn PullDataReceiver>,
    interval_ns: i64,
    next_pull_ns: i64,
}

#[derive(Default)]
struct Inner {
    pullers: HashMap<u32, Arc<PullerEntry>>,
    receivers: HashMap<(u32, ConfigKey), Vec<ReceiverInfo>>,
    next_pull_ns: i64,
    /// Bumped on every registration change so `on_alarm` can detect
    /// concurrent edits made while the lock was released for pulling.
    generation: u64,
}

/// Alarm-driven scheduler for pulled atoms.
///
/// One global alarm tracks the minimum `next_pull_ns` across receivers. The
/// scheduler lock is never held across a puller invocation: `on_alarm`
/// snapshots the due receivers, releases the lock, pulls, then reacquires to
/// advance pull times under a generation check.
pub struct PullScheduler {
    inner: Mutex<Inner>,
    alarm: Mutex<Option<Box<dyn PullAlarmSink>>>,
    stats: Arc<EngineStats>,
    test_mode: bool,
}

impl PullScheduler {
    pub fn new(stats: Arc<EngineStats>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_pull_ns: NO_ALARM,
                ..Inner::default()
            }),
            alarm: Mutex::new(None),
            stats,
            test_mode: false,
        }
    }

    /// Test mode skips the one-minute interval floor.
    pub fn new_test_mode(stats: Arc<EngineStats>) -> Self {
        Self {
            test_mode: true,
            ..Self::new(stats)
        }
    }

    pub fn set_alarm_sink(&self, sink: Box<dyn PullAlarmSink>) {
        *self.alarm.lock() = Some(sink);
        let next = self.inner.lock().next_pull_ns;
        self.update_alarm(next);
    }

    fn update_alarm(&self, next_pull_ns: i64) {
        if next_pull_ns == NO_ALARM {
            return;
        }
        if let Some(sink) = self.alarm.lock().as_ref() {
            sink.set_pulling_alarm(next_pull_ns);
        }
    }

    pub fn register_puller(
        &self,
        atom_id: u32,
        cool_down_ns: i64,
        timeout_ns: i64,
        puller: Box<dyn Puller>,
    ) {
        let entry = Arc::new(PullerEntry {
            atom_id,
            cool_down_ns: cool_down_ns.max(MIN_COOL_DOWN_NS),
            timeout_ns: timeout_ns.min(MAX_TIMEOUT_NS),
            puller,
            cache: Mutex::new(PullCache {
                last_pull_ns: 0,
                last_result: PullResult::Fail,
                cached: Vec::new(),
            }),
        });
        let mut inner = self.inner.lock();
        inner.pullers.insert(atom_id, entry);
        inner.generation += 1;
        debug!(atom_id, "puller registered");
    }

    pub fn unregister_puller(&self, atom_id: u32) {
        let mut inner = self.inner.lock();
        if inner.pullers.remove(&atom_id).is_some() {
            inner.generation += 1;
            debug!(atom_id, "puller unregistered");
        }
    }

    /// Registers a receiver for scheduled pulls of `atom_id`. The interval is
    /// rounded down to whole minutes with a one-minute floor.
    pub fn register_receiver(
        &self,
        atom_id: u32,
        config_key: ConfigKey,
        receiver: &Arc<dyn PullDataReceiver>,
        next_pull_ns: i64,
        interval_ns: i64,
    ) {
        let interval_ns = if self.test_mode {
            interval_ns.max(1)
        } else {
            (interval_ns / NS_PER_MINUTE * NS_PER_MINUTE).max(MIN_INTERVAL_NS)
        };

        let mut inner = self.inner.lock();
        let receivers = inner.receivers.entry((atom_id, config_key)).or_default();
        if receivers
            .iter()
            .any(|r| r.receiver.ptr_eq(&Arc::downgrade(receiver)))
        {
            trace!(atom_id, "receiver already registered");
            return;
        }
        receivers.push(ReceiverInfo {
            receiver: Arc::downgrade(receiver),
            interval_ns,
            next_pull_ns,
        });
        inner.generation += 1;

        if next_pull_ns < inner.next_pull_ns {
            inner.next_pull_ns = next_pull_ns;
            let next = inner.next_pull_ns;
            drop(inner);
            self.update_alarm(next);
        }
    }

    pub fn unregister_receiver(
        &self,
        atom_id: u32,
        config_key: ConfigKey,
        receiver: &Arc<dyn PullDataReceiver>,
    ) {
        let mut inner = self.inner.lock();
        if let Some(receivers) = inner.receivers.get_mut(&(atom_id, config_key)) {
            let weak = Arc::downgrade(receiver);
            receivers.retain(|r| !r.receiver.ptr_eq(&weak));
        }
        inner.generation += 1;
    }

    /// One-shot pull outside the alarm cadence (condition flips, bucket
    /// starts). Never holds the scheduler lock across the puller call.
    pub fn pull_now(&self, atom_id: u32, event_time_ns: i64) -> (PullResult, Vec<AtomEvent>) {
        let entry = {
            let inner = self.inner.lock();
            inner.pullers.get(&atom_id).cloned()
        };
        let Some(entry) = entry else {
            self.stats.note_puller_not_found(atom_id);
            warn!(atom_id, "no puller registered");
            return (PullResult::Fail, Vec::new());
        };
        let (result, events) = entry.pull(event_time_ns, &self.stats);
        if result == PullResult::DeadObject {
            self.evict_puller(atom_id);
        }
        (result, events)
    }

    fn evict_puller(&self, atom_id: u32) {
        warn!(atom_id, "puller returned dead object, evicting");
        let mut inner = self.inner.lock();
        inner.pullers.remove(&atom_id);
        inner.generation += 1;
    }

    /// The global alarm fired. Dispatches due pulls and recomputes the next
    /// alarm time. Calling twice with the same timestamp performs no second
    /// pull: pull times advance past `now` on the first call.
    pub fn on_alarm(&self, elapsed_now_ns: i64) {
        // Phase 1: snapshot due receivers under the lock.
        struct Due {
            atom_id: u32,
            receiver: Arc<dyn PullDataReceiver>,
            weak: Weak<dyn PullDataReceiver>,
            key: (u32, ConfigKey),
        }
        let (due, generation) = {
            let mut inner = self.inner.lock();
            let mut due = Vec::new();
            for (key, receivers) in inner.receivers.iter_mut() {
                receivers.retain(|info| info.receiver.strong_count() > 0);
                for info in receivers.iter() {
                    if info.next_pull_ns > elapsed_now_ns {
                        continue;
                    }
                    if let Some(receiver) = info.receiver.upgrade() {
                        due.push(Due {
                            atom_id: key.0,
                            weak: info.receiver.clone(),
                            receiver,
                            key: *key,
                        });
                    }
                }
            }
            (due, inner.generation)
        };

        // Phase 2: pulls happen with the lock released.
        let mut outcomes: Vec<(Due, PullResult)> = Vec::with_capacity(due.len());
        let mut pulled: HashMap<u32, (PullResult, Vec<AtomEvent>)> = HashMap::new();
        for item in due {
            if !item.receiver.is_pull_needed() {
                item.receiver
                    .on_data_pulled(&[], PullResult::NotNeeded, elapsed_now_ns);
                outcomes.push((item, PullResult::NotNeeded));
                continue;
            }
            let (result, events) = pulled
                .entry(item.atom_id)
                .or_insert_with(|| self.pull_now(item.atom_id, elapsed_now_ns))
                .clone();
            item.receiver
                .on_data_pulled(&events, result, elapsed_now_ns);
            outcomes.push((item, result));
        }

        // Phase 3: advance pull times and recompute the alarm.
        let next = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!("receiver registrations changed during pull dispatch");
            }
            for (item, _result) in &outcomes {
                if let Some(receivers) = inner.receivers.get_mut(&item.key) {
                    for info in receivers.iter_mut() {
                        if info.receiver.ptr_eq(&item.weak) && info.next_pull_ns <= elapsed_now_ns
                        {
                            let ahead = (elapsed_now_ns - info.next_pull_ns) / info.interval_ns;
                            info.next_pull_ns += (ahead + 1) * info.interval_ns;
                        }
                    }
                }
            }
            inner.next_pull_ns = inner
                .receivers
                .values()
                .flatten()
                .map(|info| info.next_pull_ns)
                .min()
                .unwrap_or(NO_ALARM);
            inner.next_pull_ns
        };
        self.update_alarm(next);
    }

    /// The next scheduled pull time, `NO_ALARM` when nothing is registered.
    pub fn next_pull_time_ns(&self) -> i64 {
        self.inner.lock().next_pull_ns
    }
}
