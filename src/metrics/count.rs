use std::collections::HashMap;

use tracing::trace;

use crate::dimension::MetricDimensionKey;
use crate::event::AtomEvent;
use crate::metrics::anomaly::AnomalyTracker;
use crate::metrics::{BucketInterval, MetricProducer, ProducerCore, ProducerSpec};
use crate::report::{
    render_dimension, BucketInfo, BucketPayload, DimensionData, DumpReason, MetricReport,
    StringPool,
};

#[derive(Debug, Clone)]
struct CountBucket {
    interval: BucketInterval,
    count: u64,
    condition_true_ns: i64,
}

/// Counts condition-true matched events per dimension key per bucket.
pub struct CountMetricProducer {
    core: ProducerCore,
    current: HashMap<MetricDimensionKey, u64>,
    /// Partial-bucket counts carried until a full bucket boundary, consumed
    /// by anomaly detection.
    full_counters: HashMap<MetricDimensionKey, i64>,
    past: HashMap<MetricDimensionKey, Vec<CountBucket>>,
    anomaly_trackers: Vec<AnomalyTracker>,
}

impl CountMetricProducer {
    pub fn new(spec: ProducerSpec, start_time_ns: i64) -> Self {
        Self {
            core: ProducerCore::new(spec, start_time_ns),
            current: HashMap::new(),
            full_counters: HashMap::new(),
            past: HashMap::new(),
            anomaly_trackers: Vec::new(),
        }
    }

    pub fn add_anomaly_tracker(&mut self, tracker: AnomalyTracker) {
        self.anomaly_trackers.push(tracker);
    }
}

impl MetricProducer for CountMetricProducer {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProducerCore {
        &mut self.core
    }

    fn update(
        &mut self,
        _matcher_index: usize,
        key: MetricDimensionKey,
        event: &AtomEvent,
        condition: bool,
    ) {
        if !condition {
            return;
        }

        if !self.current.contains_key(&key)
            && self
                .core
                .hit_dimension_guardrail(self.current.len(), event.elapsed_ts_ns)
        {
            return;
        }
        let count = self.current.entry(key.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        trace!(metric_id = self.core.metric_id, key = %key, count, "count updated");

        let whole_bucket = count as i64 + self.full_counters.get(&key).copied().unwrap_or(0);
        for tracker in &mut self.anomaly_trackers {
            tracker.detect_and_declare(
                event.elapsed_ts_ns,
                self.core.current_bucket_num,
                &key,
                whole_bucket,
            );
        }
    }

    fn flush_current_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) {
        let full_bucket_end = self.core.current_bucket_end_ns();
        let bucket_num = self.core.current_bucket_num;
        let (interval, condition_true_ns, _correction) =
            self.core.finish_bucket(event_ts_ns, next_bucket_start_ns);

        for (key, count) in self.current.drain() {
            if !self.anomaly_trackers.is_empty() {
                *self.full_counters.entry(key.clone()).or_insert(0) += count as i64;
            }
            if self
                .core
                .upload_threshold
                .map(|t| t.passes(count as i64))
                .unwrap_or(true)
            {
                self.past.entry(key).or_default().push(CountBucket {
                    interval,
                    count,
                    condition_true_ns,
                });
            }
        }

        // Only an event strictly past the full-bucket boundary hands the
        // accumulated whole-bucket counters to anomaly detection; an event
        // exactly at the boundary still belongs to the bucket being flushed.
        if !self.anomaly_trackers.is_empty() && event_ts_ns > full_bucket_end {
            for tracker in &mut self.anomaly_trackers {
                tracker.add_past_bucket(&self.full_counters, bucket_num);
            }
            self.full_counters.clear();
        }
    }

    fn byte_size(&self) -> usize {
        let bucket = std::mem::size_of::<CountBucket>();
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

        let with_condition_times = self.core.reports_condition_true_ns();
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
                            condition_true_ns: with_condition_times
                                .then_some(b.condition_true_ns),
                            payload: BucketPayload::Count(b.count),
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::condition::ConditionState;
    use crate::dimension::{DimensionPath, DimensionSpec};
    use crate::guardrail::EngineStats;
    use crate::metrics::activation::{Activation, ActivationKind};
    use crate::metrics::anomaly::AlertSpec;
    use crate::metrics::testutil::{base_spec, SECOND_NS};
    use crate::metrics::UploadThreshold;
    use crate::report::BucketSpan;
    use crate::state::NoStates;

    struct NoConditions;
    impl crate::condition::ConditionLookup for NoConditions {
        fn query(
            &self,
            _index: usize,
            _key: &crate::dimension::DimensionKey,
            _partial: bool,
        ) -> ConditionState {
            ConditionState::Unknown
        }
    }

    fn feed(producer: &mut CountMetricProducer, atom_id: u32, ts: i64) {
        let event = AtomEvent::new(atom_id, ts);
        producer.on_matched_event(0, &event, &NoConditions, &NoStates);
    }

    fn dump(producer: &mut CountMetricProducer, ts: i64) -> MetricReport {
        let mut pool = StringPool::new();
        producer.dump_report(ts, false, false, DumpReason::Requested, &mut pool)
    }

    #[test]
    fn test_counts_without_condition_across_buckets() {
        // Matcher A, 60s buckets, time base 0; events at 10s, 20s, 70s.
        let mut producer = CountMetricProducer::new(base_spec(1), 0);
        feed(&mut producer, 5, 10 * SECOND_NS);
        feed(&mut producer, 5, 20 * SECOND_NS);
        feed(&mut producer, 5, 70 * SECOND_NS);

        let report = dump(&mut producer, 120 * SECOND_NS);
        assert_eq!(report.data.len(), 1);
        let buckets = &report.data[0].buckets;
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].span, BucketSpan::Num(0));
        assert_eq!(buckets[0].payload, BucketPayload::Count(2));
        assert_eq!(buckets[1].span, BucketSpan::Num(1));
        assert_eq!(buckets[1].payload, BucketPayload::Count(1));
        // No condition configured: no condition timing reported.
        assert_eq!(buckets[0].condition_true_ns, None);
    }

    #[test]
    fn test_condition_gating_and_condition_true_ns() {
        let mut spec = base_spec(2);
        spec.condition_index = Some(0);
        spec.initial_condition = ConditionState::False;
        let mut producer = CountMetricProducer::new(spec, 0);

        feed(&mut producer, 5, 10 * SECOND_NS); // condition false, ignored
        producer.on_condition_changed(ConditionState::True, 30 * SECOND_NS);
        feed(&mut producer, 5, 40 * SECOND_NS);
        feed(&mut producer, 5, 55 * SECOND_NS);
        producer.on_condition_changed(ConditionState::False, 65 * SECOND_NS);
        feed(&mut producer, 5, 70 * SECOND_NS); // false again, ignored
        producer.on_condition_changed(ConditionState::True, 80 * SECOND_NS);
        feed(&mut producer, 5, 90 * SECOND_NS);

        let report = dump(&mut producer, 120 * SECOND_NS);
        let buckets = &report.data[0].buckets;
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].payload, BucketPayload::Count(2));
        // True 30s..60s in bucket 0.
        assert_eq!(buckets[0].condition_true_ns, Some(30 * SECOND_NS));
        assert_eq!(buckets[1].payload, BucketPayload::Count(1));
        // True 60..65 and 80..120 in bucket 1.
        assert_eq!(buckets[1].condition_true_ns, Some(45 * SECOND_NS));
    }

    #[test]
    fn test_dimension_guardrail_drops_third_key() {
        let mut spec = base_spec(3);
        spec.dimensions_in_what = DimensionSpec::new(vec![DimensionPath::leaf(1)]);
        let stats = Arc::clone(&spec.stats);
        let mut producer = CountMetricProducer::new(spec, 0);
        // Shrink both limits so the guardrail is reachable in a small test.
        producer.core.dimension_soft_limit = 0;
        producer.core.dimension_hard_limit = 2;

        for (i, uid) in [100, 200, 300].iter().enumerate() {
            let event = AtomEvent::new(5, (10 + i as i64) * SECOND_NS).with_int(1, *uid);
            producer.on_matched_event(0, &event, &NoConditions, &NoStates);
        }

        // Two keys retained with count 1 each; the third was dropped.
        assert_eq!(producer.current.len(), 2);
        assert!(producer.current.values().all(|&c| c == 1));
        assert!(producer.core.dimension_guardrail_hit);
        assert_eq!(stats.hard_dimension_limit_count(3), 1);

        // Repeated events for an existing key still count.
        let event = AtomEvent::new(5, 20 * SECOND_NS).with_int(1, 100);
        producer.on_matched_event(0, &event, &NoConditions, &NoStates);
        assert_eq!(producer.current.values().sum::<u64>(), 3);
    }

    #[test]
    fn test_upload_threshold_filters_buckets() {
        let mut spec = base_spec(4);
        spec.upload_threshold = Some(UploadThreshold::GtInt(1));
        let mut producer = CountMetricProducer::new(spec, 0);

        feed(&mut producer, 5, 10 * SECOND_NS); // bucket 0: count 1, filtered
        feed(&mut producer, 5, 70 * SECOND_NS); // bucket 1: count 2, kept
        feed(&mut producer, 5, 80 * SECOND_NS);

        let report = dump(&mut producer, 130 * SECOND_NS);
        assert_eq!(report.data.len(), 1);
        let buckets = &report.data[0].buckets;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].span, BucketSpan::Num(1));
        assert_eq!(buckets[0].payload, BucketPayload::Count(2));
    }

    #[test]
    fn test_activation_ttl_window() {
        // Activation S with ttl 100s; S at 10s, A at 50s and 150s.
        let mut spec = base_spec(5);
        spec.activations.insert(
            7,
            Activation::new(ActivationKind::Immediate, 100 * SECOND_NS),
        );
        let mut producer = CountMetricProducer::new(spec, 0);
        assert!(!producer.is_active());

        producer.activate(7, 10 * SECOND_NS);
        assert!(producer.is_active());

        feed(&mut producer, 5, 50 * SECOND_NS);
        feed(&mut producer, 5, 150 * SECOND_NS); // TTL expired at 110s
        assert!(!producer.is_active());

        let report = dump(&mut producer, 200 * SECOND_NS);
        let total: u64 = report.data[0]
            .buckets
            .iter()
            .map(|b| match b.payload {
                BucketPayload::Count(c) => c,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_app_upgrade_splits_bucket() {
        // Events at 10s and 50s with an upgrade at 30s: two partial buckets.
        let mut producer = CountMetricProducer::new(base_spec(6), 0);
        feed(&mut producer, 5, 10 * SECOND_NS);
        producer.notify_app_upgrade(30 * SECOND_NS);
        feed(&mut producer, 5, 50 * SECOND_NS);

        let report = dump(&mut producer, 120 * SECOND_NS);
        let buckets = &report.data[0].buckets;
        assert_eq!(buckets.len(), 2);
        assert_eq!(
            buckets[0].span,
            BucketSpan::Range {
                start_elapsed_ms: 0,
                end_elapsed_ms: 30_000
            }
        );
        assert_eq!(buckets[0].payload, BucketPayload::Count(1));
        assert_eq!(
            buckets[1].span,
            BucketSpan::Range {
                start_elapsed_ms: 30_000,
                end_elapsed_ms: 60_000
            }
        );
        assert_eq!(buckets[1].payload, BucketPayload::Count(1));
    }

    #[test]
    fn test_upgrade_split_disabled() {
        let mut spec = base_spec(7);
        spec.split_bucket_on_app_upgrade = false;
        let mut producer = CountMetricProducer::new(spec, 0);
        feed(&mut producer, 5, 10 * SECOND_NS);
        producer.notify_app_upgrade(30 * SECOND_NS);
        feed(&mut producer, 5, 50 * SECOND_NS);

        let report = dump(&mut producer, 120 * SECOND_NS);
        let buckets = &report.data[0].buckets;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].span, BucketSpan::Num(0));
        assert_eq!(buckets[0].payload, BucketPayload::Count(2));
    }

    #[test]
    fn test_drop_data_clears_past_buckets() {
        let mut producer = CountMetricProducer::new(base_spec(8), 0);
        feed(&mut producer, 5, 10 * SECOND_NS);
        producer.drop_data(70 * SECOND_NS);

        let report = dump(&mut producer, 120 * SECOND_NS);
        assert!(report.data.is_empty());
    }

    #[test]
    fn test_erase_data_clears_on_dump() {
        let mut producer = CountMetricProducer::new(base_spec(9), 0);
        feed(&mut producer, 5, 10 * SECOND_NS);

        let mut pool = StringPool::new();
        let report =
            producer.dump_report(70 * SECOND_NS, false, true, DumpReason::Requested, &mut pool);
        assert_eq!(report.data.len(), 1);

        let report = dump(&mut producer, 80 * SECOND_NS);
        assert!(report.data.is_empty());
    }

    #[test]
    fn test_dump_with_partial_includes_current_bucket() {
        let mut producer = CountMetricProducer::new(base_spec(10), 0);
        feed(&mut producer, 5, 10 * SECOND_NS);

        let mut pool = StringPool::new();
        let report =
            producer.dump_report(30 * SECOND_NS, true, false, DumpReason::Requested, &mut pool);
        let buckets = &report.data[0].buckets;
        assert_eq!(buckets.len(), 1);
        assert_eq!(
            buckets[0].span,
            BucketSpan::Range {
                start_elapsed_ms: 0,
                end_elapsed_ms: 30_000
            }
        );
    }

    #[test]
    fn test_events_older_than_time_base_are_dropped() {
        let mut spec = base_spec(11);
        spec.time_base_ns = 100 * SECOND_NS;
        let mut producer = CountMetricProducer::new(spec, 100 * SECOND_NS);
        feed(&mut producer, 5, 50 * SECOND_NS);
        feed(&mut producer, 5, 110 * SECOND_NS);

        let report = dump(&mut producer, 200 * SECOND_NS);
        let total: u64 = report.data[0]
            .buckets
            .iter()
            .map(|b| match b.payload {
                BucketPayload::Count(c) => c,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_anomaly_tracker_sees_whole_bucket_counts() {
        let stats = Arc::new(EngineStats::new());
        let mut spec = base_spec(12);
        spec.stats = Arc::clone(&stats);
        let mut producer = CountMetricProducer::new(spec, 0);
        producer.add_anomaly_tracker(AnomalyTracker::new(
            AlertSpec {
                alert_id: 99,
                metric_id: 12,
                num_buckets: 1,
                trigger_if_sum_gt: 2,
                refractory_period_ns: 0,
            },
            Arc::clone(&stats),
        ));

        feed(&mut producer, 5, 10 * SECOND_NS);
        // Mid-bucket split; the partial counts must carry into the whole-
        // bucket value instead of resetting the anomaly view.
        producer.notify_app_upgrade(20 * SECOND_NS);
        feed(&mut producer, 5, 30 * SECOND_NS);
        feed(&mut producer, 5, 40 * SECOND_NS);

        let declared = stats
            .snapshot()
            .anomaly_declared
            .iter()
            .find(|(id, _)| *id == 99)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        assert_eq!(declared, 1);
    }

    #[test]
    fn test_boundary_event_does_not_dispatch_full_counters_early() {
        let stats = Arc::new(EngineStats::new());
        let mut spec = base_spec(14);
        spec.stats = Arc::clone(&stats);
        let mut producer = CountMetricProducer::new(spec, 0);
        producer.add_anomaly_tracker(AnomalyTracker::new(
            AlertSpec {
                alert_id: 98,
                metric_id: 14,
                num_buckets: 1,
                trigger_if_sum_gt: i64::MAX,
                refractory_period_ns: 0,
            },
            Arc::clone(&stats),
        ));

        feed(&mut producer, 5, 10 * SECOND_NS);
        // Exactly on the bucket boundary: the bucket rotates, but the
        // whole-bucket counters are carried, not handed to the tracker.
        feed(&mut producer, 5, 60 * SECOND_NS);
        assert!(producer.anomaly_trackers[0].most_recent_bucket_num().is_none());
        assert_eq!(producer.full_counters.values().sum::<i64>(), 1);

        // Strictly past the next boundary: the carry plus bucket 1's counts
        // are dispatched for bucket 1.
        feed(&mut producer, 5, 130 * SECOND_NS);
        assert_eq!(
            producer.anomaly_trackers[0].most_recent_bucket_num(),
            Some(1)
        );
        assert!(producer.full_counters.is_empty());
    }

    #[test]
    fn test_bucket_numbers_non_decreasing() {
        let mut producer = CountMetricProducer::new(base_spec(13), 0);
        let mut last = producer.core.current_bucket_num;
        for ts in [5, 10, 65, 70, 200, 500] {
            feed(&mut producer, 5, ts * SECOND_NS);
            assert!(producer.core.current_bucket_num >= last);
            last = producer.core.current_bucket_num;
        }
        assert_eq!(last, 8);
    }
}
