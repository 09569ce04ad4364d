use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Dimension tuple count at which the peak-size telemetry starts recording.
pub const DIMENSION_KEY_SOFT_LIMIT: usize = 500;
/// Lower clamp for a configured per-metric dimension hard limit.
pub const DIMENSION_HARD_LIMIT_MIN: usize = 800;
/// Upper clamp for a configured per-metric dimension hard limit.
pub const DIMENSION_HARD_LIMIT_MAX: usize = 3000;
/// Cap on drop events recorded per skipped bucket.
pub const MAX_LOGGED_BUCKET_DROP_EVENTS: usize = 10;
/// Default per-config byte budget for retained aggregate data.
pub const DEFAULT_CONFIG_BYTE_BUDGET: usize = 2 * 1024 * 1024;
/// Byte budget for the uid/package map's pending output.
pub const UID_MAP_BYTE_BUDGET: usize = 50 * 1024;

const BINDER_CALLS: u32 = 10022;
const LOOPER_STATS: u32 = 10024;
const CPU_TIME_PER_UID_FREQ: u32 = 10010;

/// (default, max) dimension hard limits for atoms with known wide key spaces.
pub fn atom_dimension_key_size_limits(atom_id: u32) -> Option<(usize, usize)> {
    match atom_id {
        BINDER_CALLS => Some((6000, 6500)),
        LOOPER_STATS => Some((1500, 2500)),
        CPU_TIME_PER_UID_FREQ => Some((6000, 6500)),
        _ => None,
    }
}

/// Resolves the dimension hard limit for a metric: the configured value
/// clamped to `[800, 3000]`, unless the atom carries its own override range.
pub fn clamp_dimension_hard_limit(atom_id: u32, configured: Option<i64>) -> usize {
    let (lo, hi) = atom_dimension_key_size_limits(atom_id)
        .unwrap_or((DIMENSION_HARD_LIMIT_MIN, DIMENSION_HARD_LIMIT_MAX));
    match configured {
        Some(c) if c > 0 => (c as usize).clamp(lo, hi),
        _ => lo,
    }
}

/// Identifies a configuration: the owning uid and the config id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConfigKey {
    pub uid: u32,
    pub id: i64,
}

impl ConfigKey {
    pub fn new(uid: u32, id: i64) -> Self {
        Self { uid, id }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.id)
    }
}

/// Why a config (or one of its metrics) was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidConfigCode {
    MatcherNotFound,
    ConditionNotFound,
    ConditionChildNotDefined,
    StateNotFound,
    MetricMissingWhat,
    DuplicateMetricId,
    BadUploadThreshold,
    BadValueFields,
    BadHistogramBins,
    BadSampling,
    ActivationMatcherNotFound,
    DurationMatcherPairIncomplete,
    PullAtomMissing,
    AlertMetricNotFound,
}

/// Caller-visible rejection record; the offending metric is discarded and
/// the rest of the config keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidConfigReason {
    pub code: InvalidConfigCode,
    pub metric_id: Option<i64>,
    pub state_id: Option<u32>,
    pub alert_id: Option<i64>,
    pub matcher_ids: Vec<i64>,
    pub condition_ids: Vec<i64>,
}

impl InvalidConfigReason {
    pub fn new(code: InvalidConfigCode) -> Self {
        Self {
            code,
            metric_id: None,
            state_id: None,
            alert_id: None,
            matcher_ids: Vec::new(),
            condition_ids: Vec::new(),
        }
    }

    pub fn for_metric(code: InvalidConfigCode, metric_id: i64) -> Self {
        Self {
            metric_id: Some(metric_id),
            ..Self::new(code)
        }
    }

    pub fn with_matcher(mut self, matcher_id: i64) -> Self {
        self.matcher_ids.push(matcher_id);
        self
    }

    pub fn with_condition(mut self, condition_id: i64) -> Self {
        self.condition_ids.push(condition_id);
        self
    }

    pub fn with_state(mut self, state_id: u32) -> Self {
        self.state_id = Some(state_id);
        self
    }
}

/// Error taxonomy of the pipeline. Transient and guardrail conditions are
/// counters, not errors; only config rejection and fatal states surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid config: {0:?}")]
    InvalidConfig(InvalidConfigReason),
    #[error("clock source unavailable")]
    ClockUnavailable,
    #[error("corrupted aggregate state for metric {metric_id}")]
    CorruptAggregate { metric_id: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigStats {
    pub key: ConfigKey,
    pub creation_ns: i64,
    pub metric_count: usize,
    pub condition_count: usize,
    pub matcher_count: usize,
    pub alert_count: usize,
    pub valid: bool,
    pub invalid_reason: Option<InvalidConfigReason>,
}

/// Process-wide telemetry counters for the engine itself.
///
/// Lock-free on the hot paths; the config list takes a mutex since it only
/// changes on config add/remove.
#[derive(Default)]
pub struct EngineStats {
    configs: Mutex<Vec<ConfigStats>>,
    events_processed: AtomicU64,
    dropped_events: DashMap<u32, u64>,
    hard_dimension_limit_reached: DashMap<i64, u64>,
    dimension_peaks: DashMap<i64, usize>,
    bucket_count: DashMap<i64, u64>,
    bucket_dropped: DashMap<i64, u64>,
    data_dropped: DashMap<ConfigKey, u64>,
    pull_failures: DashMap<u32, u64>,
    pull_timeouts: DashMap<u32, u64>,
    puller_not_found: DashMap<u32, u64>,
    anomaly_declared: DashMap<i64, u64>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_config_received(
        &self,
        key: ConfigKey,
        creation_ns: i64,
        metric_count: usize,
        condition_count: usize,
        matcher_count: usize,
        alert_count: usize,
        invalid_reason: Option<InvalidConfigReason>,
    ) {
        if let Some(reason) = &invalid_reason {
            warn!(config = %key, ?reason, "invalid config received");
        }
        self.configs.lock().push(ConfigStats {
            key,
            creation_ns,
            metric_count,
            condition_count,
            matcher_count,
            alert_count,
            valid: invalid_reason.is_none(),
            invalid_reason,
        });
    }

    pub fn note_config_removed(&self, key: ConfigKey) {
        self.configs.lock().retain(|c| c.key != key);
    }

    pub fn note_event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue overflow: the event was discarded before processing.
    pub fn note_event_dropped(&self, atom_id: u32) {
        *self.dropped_events.entry(atom_id).or_insert(0) += 1;
    }

    pub fn note_hard_dimension_limit_reached(&self, metric_id: i64) {
        *self
            .hard_dimension_limit_reached
            .entry(metric_id)
            .or_insert(0) += 1;
    }

    /// Records the peak dimension tuple count observed past the soft limit.
    pub fn note_metric_dimension_size(&self, metric_id: i64, size: usize) {
        let mut entry = self.dimension_peaks.entry(metric_id).or_insert(0);
        if size > *entry {
            *entry = size;
        }
    }

    pub fn note_bucket_count(&self, metric_id: i64) {
        *self.bucket_count.entry(metric_id).or_insert(0) += 1;
    }

    pub fn note_bucket_dropped(&self, metric_id: i64) {
        *self.bucket_dropped.entry(metric_id).or_insert(0) += 1;
    }

    pub fn note_data_dropped(&self, key: ConfigKey) {
        *self.data_dropped.entry(key).or_insert(0) += 1;
    }

    pub fn note_pull_failed(&self, atom_id: u32) {
        *self.pull_failures.entry(atom_id).or_insert(0) += 1;
    }

    pub fn note_pull_timeout(&self, atom_id: u32) {
        *self.pull_timeouts.entry(atom_id).or_insert(0) += 1;
    }

    pub fn note_puller_not_found(&self, atom_id: u32) {
        *self.puller_not_found.entry(atom_id).or_insert(0) += 1;
    }

    pub fn note_anomaly_declared(&self, alert_id: i64) {
        *self.anomaly_declared.entry(alert_id).or_insert(0) += 1;
    }

    pub fn hard_dimension_limit_count(&self, metric_id: i64) -> u64 {
        self.hard_dimension_limit_reached
            .get(&metric_id)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn dropped_event_count(&self, atom_id: u32) -> u64 {
        self.dropped_events.get(&atom_id).map(|v| *v).unwrap_or(0)
    }

    pub fn pull_failure_count(&self, atom_id: u32) -> u64 {
        self.pull_failures.get(&atom_id).map(|v| *v).unwrap_or(0)
    }

    pub fn data_dropped_count(&self, key: ConfigKey) -> u64 {
        self.data_dropped.get(&key).map(|v| *v).unwrap_or(0)
    }

    /// Point-in-time snapshot with deterministic ordering.
    pub fn snapshot(&self) -> StatsSnapshot {
        fn sorted<K: Ord + Copy + Hash + Eq, V: Copy>(map: &DashMap<K, V>) -> Vec<(K, V)> {
            let mut v: Vec<(K, V)> = map.iter().map(|e| (*e.key(), *e.value())).collect();
            v.sort_by_key(|(k, _)| *k);
            v
        }

        StatsSnapshot {
            configs: self.configs.lock().clone(),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            dropped_events: sorted(&self.dropped_events),
            hard_dimension_limit_reached: sorted(&self.hard_dimension_limit_reached),
            dimension_peaks: sorted(&self.dimension_peaks),
            bucket_count: sorted(&self.bucket_count),
            bucket_dropped: sorted(&self.bucket_dropped),
            pull_failures: sorted(&self.pull_failures),
            pull_timeouts: sorted(&self.pull_timeouts),
            puller_not_found: sorted(&self.puller_not_found),
            anomaly_declared: sorted(&self.anomaly_declared),
        }
    }
}

/// Serializable view of the engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub configs: Vec<ConfigStats>,
    pub events_processed: u64,
    pub dropped_events: Vec<(u32, u64)>,
    pub hard_dimension_limit_reached: Vec<(i64, u64)>,
    pub dimension_peaks: Vec<(i64, usize)>,
    pub bucket_count: Vec<(i64, u64)>,
    pub bucket_dropped: Vec<(i64, u64)>,
    pub pull_failures: Vec<(u32, u64)>,
    pub pull_timeouts: Vec<(u32, u64)>,
    pub puller_not_found: Vec<(u32, u64)>,
    pub anomaly_declared: Vec<(i64, u64)>,
}
