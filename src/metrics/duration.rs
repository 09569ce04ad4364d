use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::condition::{ConditionLookup, ConditionState};
use crate::dimension::MetricDimensionKey;
use crate::event::AtomEvent;
use crate::metrics::{BucketInterval, MetricProducer, ProducerCore, ProducerSpec};
use crate::report::{
    render_dimension, BucketInfo, BucketPayload, DimensionData, DumpReason, MetricReport,
    StringPool,
};

/// How per-key durations fold into a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    /// Total time the what-pair was open within the bucket; open intervals
    /// split across bucket boundaries.
    #[default]
    Sum,
    /// Longest single completed interval, reported in the bucket where it
    /// ended; open intervals are not split.
    MaxSparse,
}

#[derive(Debug, Default)]
struct DurationTracker {
    /// When the open interval started accruing in the current bucket (Sum)
    /// or when the interval opened (MaxSparse).
    running_since_ns: Option<i64>,
    /// Where the current interval originally opened, for MaxSparse totals.
    interval_start_ns: i64,
    nest_count: u32,
    paused: bool,
    accumulated_ns: i64,
    max_duration_ns: i64,
}

#[derive(Debug, Clone)]
struct DurationBucket {
    interval: BucketInterval,
    duration_ns: i64,
}

/// Tracks the time between start and stop matcher events per dimension key.
pub struct DurationMetricProducer {
    core: ProducerCore,
    start_matcher: usize,
    stop_matcher: usize,
    stop_all_matcher: Option<usize>,
    nested: bool,
    aggregation: DurationAggregation,
    current: HashMap<MetricDimensionKey, DurationTracker>,
    past: HashMap<MetricDimensionKey, Vec<DurationBucket>>,
}

impl DurationMetricProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: ProducerSpec,
        start_time_ns: i64,
        start_matcher: usize,
        stop_matcher: usize,
        stop_all_matcher: Option<usize>,
        nested: bool,
        aggregation: DurationAggregation,
    ) -> Self {
        Self {
            core: ProducerCore::new(spec, start_time_ns),
            start_matcher,
            stop_matcher,
            stop_all_matcher,
            nested,
            aggregation,
            current: HashMap::new(),
            past: HashMap::new(),
        }
    }

    fn note_start(&mut self, key: MetricDimensionKey, ts_ns: i64, condition: bool) {
        if !self.current.contains_key(&key)
            && self
                .core
                .hit_dimension_guardrail(self.current.len(), ts_ns)
        {
            return;
        }
        let tracker = self.current.entry(key).or_default();
        if self.nested {
            tracker.nest_count += 1;
            if tracker.nest_count > 1 {
                return;
            }
        } else if tracker.running_since_ns.is_some() || tracker.paused {
            return;
        }
        tracker.interval_start_ns = ts_ns;
        if condition {
            tracker.paused = false;
            tracker.running_since_ns = Some(ts_ns);
        } else {
            // Opened under a false condition: parked until the condition
            // flips true.
            tracker.paused = true;
            tracker.running_since_ns = None;
        }
    }

    fn note_stop(tracker: &mut DurationTracker, ts_ns: i64, aggregation: DurationAggregation, nested: bool) {
        if nested {
            tracker.nest_count = tracker.nest_count.saturating_sub(1);
            if tracker.nest_count > 0 {
                return;
            }
        }
        match aggregation {
            DurationAggregation::Sum => {
                if let Some(since) = tracker.running_since_ns.take() {
                    tracker.accumulated_ns += (ts_ns - since).max(0);
                }
            }
            DurationAggregation::MaxSparse => {
                if tracker.running_since_ns.take().is_some() {
                    let total = (ts_ns - tracker.interval_start_ns).max(0);
                    tracker.max_duration_ns = tracker.max_duration_ns.max(total);
                }
            }
        }
        tracker.paused = false;
        tracker.nest_count = 0;
    }

    fn pause_all(&mut self, ts_ns: i64) {
        for tracker in self.current.values_mut() {
            if let Some(since) = tracker.running_since_ns.take() {
                if self.aggregation == DurationAggregation::Sum {
                    tracker.accumulated_ns += (ts_ns - since).max(0);
                }
                tracker.paused = true;
            }
        }
    }

    fn resume_all(&mut self, ts_ns: i64) {
        for tracker in self.current.values_mut() {
            if tracker.paused {
                tracker.paused = false;
                tracker.running_since_ns = Some(ts_ns);
            }
        }
    }
}

impl MetricProducer for DurationMetricProducer {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProducerCore {
        &mut self.core
    }

    fn update(
        &mut self,
        matcher_index: usize,
        key: MetricDimensionKey,
        event: &AtomEvent,
        condition: bool,
    ) {
        let ts = event.elapsed_ts_ns;
        if Some(matcher_index) == self.stop_all_matcher {
            let aggregation = self.aggregation;
            let nested = self.nested;
            for tracker in self.current.values_mut() {
                tracker.nest_count = tracker.nest_count.min(1);
                Self::note_stop(tracker, ts, aggregation, nested);
            }
            return;
        }
        if matcher_index == self.start_matcher {
            self.note_start(key, ts, condition);
        } else if matcher_index == self.stop_matcher {
            let aggregation = self.aggregation;
            let nested = self.nested;
            if let Some(tracker) = self.current.get_mut(&key) {
                Self::note_stop(tracker, ts, aggregation, nested);
            } else {
                trace!(
                    metric_id = self.core.metric_id,
                    key = %key,
                    "stop without matching start",
                );
            }
        }
    }

    fn on_condition_changed(&mut self, new_state: ConditionState, event_ts_ns: i64) {
        self.flush_if_needed(event_ts_ns);
        self.core.condition = new_state;
        if !self.core.is_active {
            return;
        }
        if new_state.is_true() {
            self.resume_all(event_ts_ns);
        } else {
            self.pause_all(event_ts_ns);
        }
    }

    fn on_sliced_condition_may_change(&mut self, event_ts_ns: i64, conditions: &dyn ConditionLookup) {
        // Without per-slice link keys recoverable here, fall back to the
        // overall node value for pausing.
        if let Some(index) = self.core.condition_index {
            let state = conditions.query(index, &Default::default(), true);
            self.on_condition_changed(state, event_ts_ns);
        }
    }

    fn flush_current_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) {
        let (interval, _cond_true, _corr) =
            self.core.finish_bucket(event_ts_ns, next_bucket_start_ns);

        let mut dead_keys = Vec::new();
        for (key, tracker) in self.current.iter_mut() {
            let duration_ns = match self.aggregation {
                DurationAggregation::Sum => {
                    if let Some(since) = tracker.running_since_ns {
                        tracker.accumulated_ns += (interval.end_ns - since).max(0);
                        tracker.running_since_ns = Some(next_bucket_start_ns);
                    }
                    std::mem::take(&mut tracker.accumulated_ns)
                }
                DurationAggregation::MaxSparse => std::mem::take(&mut tracker.max_duration_ns),
            };

            if duration_ns > 0
                && self
                    .core
                    .upload_threshold
                    .map(|t| t.passes(duration_ns))
                    .unwrap_or(true)
            {
                self.past.entry(key.clone()).or_default().push(DurationBucket {
                    interval,
                    duration_ns,
                });
            }

            if tracker.running_since_ns.is_none() && !tracker.paused {
                dead_keys.push(key.clone());
            }
        }
        for key in dead_keys {
            self.current.remove(&key);
        }
    }

    fn byte_size(&self) -> usize {
        let bucket = std::mem::size_of::<DurationBucket>();
        self.past
            .iter()
            .map(|(key, buckets)| key.byte_size() + buckets.len() * bucket)
            .sum()
    }

    fn dump_report(
        &mut self,
        dump_ts_ns: i64,
        include_partial: bool,
        erase_data: bool,
        reason: DumpReason,
        pool: &mut StringPool,
    ) -> MetricReport {
        let _ = reason;
        if include_partial {
            self.split_bucket(dump_ts_ns);
        } else {
            self.flush_if_needed(dump_ts_ns);
        }

        let mut data: Vec<(u64, DimensionData)> = self
            .past
            .iter()
            .map(|(key, buckets)| {
                let entry = DimensionData {
                    dimension: render_dimension(key.dimension_in_what(), pool),
                    use_nested_dimensions: self.core.use_nested_dimensions,
                    state_values: render_dimension(key.state_values(), pool),
                    buckets: buckets
                        .iter()
                        .map(|b| BucketInfo {
                            span: b.interval.span(),
                            condition_true_ns: None,
                            payload: BucketPayload::DurationNs(b.duration_ns),
                        })
                        .collect(),
                };
                (key.dimension_in_what().stable_hash(), entry)
            })
            .collect();
        data.sort_by_key(|(hash, _)| *hash);

        let report = MetricReport {
            metric_id: self.core.metric_id,
            is_active: self.core.is_active,
            time_base_ns: self.core.time_base_ns,
            bucket_size_ns: self.core.bucket_size_ns,
            dimension_guardrail_hit: self.core.dimension_guardrail_hit,
            dimension_path: self.core.dimension_path_fields(),
            data: data.into_iter().map(|(_, d)| d).collect(),
            skipped: self.core.skipped_reports(),
        };

        if erase_data {
            self.past.clear();
            self.core.skipped_buckets.clear();
            self.core.dimension_guardrail_hit = false;
        }
        report
    }

    fn drop_data(&mut self, drop_ts_ns: i64) {
        self.flush_if_needed(drop_ts_ns);
        self.core.stats.note_bucket_dropped(self.core.metric_id);
        self.past.clear();
    }
}
