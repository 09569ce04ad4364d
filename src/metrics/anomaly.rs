use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::dimension::MetricDimensionKey;
use crate::guardrail::EngineStats;

/// Threshold alert over a sliding window of whole buckets.
#[derive(Debug, Clone)]
pub struct AlertSpec {
    pub alert_id: i64,
    pub metric_id: i64,
    /// Window width in buckets, including the current one. Minimum 1.
    pub num_buckets: usize,
    pub trigger_if_sum_gt: i64,
    /// Suppression window after a declared anomaly, per dimension key.
    pub refractory_period_ns: i64,
}

/// Watches the running whole-bucket value of one metric and declares an
/// anomaly when the windowed sum crosses the threshold.
pub struct AnomalyTracker {
    spec: AlertSpec,
    /// Closed full buckets, newest last, keyed by bucket number.
    past: VecDeque<(i64, HashMap<MetricDimensionKey, i64>)>,
    last_declared_ns: HashMap<MetricDimensionKey, i64>,
    stats: Arc<EngineStats>,
}

impl AnomalyTracker {
    pub fn new(spec: AlertSpec, stats: Arc<EngineStats>) -> Self {
        Self {
            spec,
            past: VecDeque::new(),
            last_declared_ns: HashMap::new(),
            stats,
        }
    }

    pub fn alert_id(&self) -> i64 {
        self.spec.alert_id
    }

    /// Records the finished full bucket `bucket_num`. Gaps between bucket
    /// numbers are implicitly empty.
    pub fn add_past_bucket(&mut self, counters: &HashMap<MetricDimensionKey, i64>, bucket_num: i64) {
        self.past.push_back((bucket_num, counters.clone()));
        let window = self.spec.num_buckets.max(1) as i64;
        while let Some((oldest, _)) = self.past.front() {
            if bucket_num - oldest >= window {
                self.past.pop_front();
            } else {
                break;
            }
        }
    }

    /// Most recent bucket number delivered via `add_past_bucket`.
    pub fn most_recent_bucket_num(&self) -> Option<i64> {
        self.past.back().map(|(n, _)| *n)
    }

    fn window_sum(&self, current_bucket_num: i64, key: &MetricDimensionKey) -> i64 {
        let window = self.spec.num_buckets.max(1) as i64;
        self.past
            .iter()
            .filter(|(num, _)| current_bucket_num - num < window)
            .filter_map(|(_, counters)| counters.get(key))
            .sum()
    }

    /// Checks the running whole-bucket value against the threshold and
    /// declares an anomaly, subject to the refractory period.
    pub fn detect_and_declare(
        &mut self,
        event_ts_ns: i64,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        whole_bucket_value: i64,
    ) {
        let total = self.window_sum(current_bucket_num, key) + whole_bucket_value;
        if total <= self.spec.trigger_if_sum_gt {
            return;
        }
        if let Some(last) = self.last_declared_ns.get(key) {
            if event_ts_ns < last + self.spec.refractory_period_ns {
                return;
            }
        }
        self.last_declared_ns.insert(key.clone(), event_ts_ns);
        self.stats.note_anomaly_declared(self.spec.alert_id);
        warn!(
            alert_id = self.spec.alert_id,
            metric_id = self.spec.metric_id,
            key = %key,
            total,
            threshold = self.spec.trigger_if_sum_gt,
            "anomaly declared",
        );
    }
}
