use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::condition::ConditionState;
use crate::dimension::{filter_first, DimensionPath, MetricDimensionKey};
use crate::event::{AtomEvent, Value};
use crate::metrics::{BucketInterval, MetricProducer, ProducerCore, ProducerSpec};
use crate::report::{
    render_dimension, BucketInfo, BucketPayload, DimensionData, DumpReason, MetricReport,
    StringPool, ValueSummary,
};

/// Fold applied to one value field within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueAggregation {
    #[default]
    Sum,
    Min,
    Max,
    Avg,
}

/// One aggregated field of a value metric.
#[derive(Debug, Clone)]
pub struct ValueField {
    pub path: DimensionPath,
    pub aggregation: ValueAggregation,
}

#[derive(Debug, Clone, Default)]
struct FieldAggregate {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
    /// Last raw sample, for diffing cumulative sources.
    base: Option<f64>,
}

impl FieldAggregate {
    fn absorb(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
    }

    fn emit(&mut self, aggregation: ValueAggregation) -> Option<(f64, u64)> {
        if self.count == 0 {
            return None;
        }
        let value = match aggregation {
            ValueAggregation::Sum => self.sum,
            ValueAggregation::Min => self.min,
            ValueAggregation::Max => self.max,
            ValueAggregation::Avg => self.sum / self.count as f64,
        };
        let count = self.count;
        self.sum = 0.0;
        self.min = 0.0;
        self.max = 0.0;
        self.count = 0;
        Some((value, count))
    }
}

#[derive(Debug, Clone)]
struct ValueBucket {
    interval: BucketInterval,
    condition_true_ns: i64,
    values: Vec<ValueSummary>,
}

/// Aggregates numeric fields per key per bucket; push- or pull-driven.
///
/// With `use_diff` each sample is differenced against the previous one
/// (additive-field semantics for cumulative pulled counters); the first
/// sample only establishes the base.
pub struct ValueMetricProducer {
    core: ProducerCore,
    value_fields: Vec<ValueField>,
    pulled_atom: Option<u32>,
    use_diff: bool,
    skip_new_keys_after_condition_change: bool,
    condition_changed_in_bucket: bool,
    current: HashMap<MetricDimensionKey, Vec<FieldAggregate>>,
    past: HashMap<MetricDimensionKey, Vec<ValueBucket>>,
}

impl ValueMetricProducer {
    pub fn new(
        spec: ProducerSpec,
        start_time_ns: i64,
        value_fields: Vec<ValueField>,
        pulled_atom: Option<u32>,
        use_diff: bool,
        skip_new_keys_after_condition_change: bool,
    ) -> Self {
        Self {
            core: ProducerCore::new(spec, start_time_ns),
            value_fields,
            pulled_atom,
            use_diff,
            skip_new_keys_after_condition_change,
            condition_changed_in_bucket: false,
            current: HashMap::new(),
            past: HashMap::new(),
        }
    }

    /// The pulled atom driving this metric, when pull-driven.
    pub fn pulled_atom(&self) -> Option<u32> {
        self.pulled_atom
    }

    fn numeric(value: &Value) -> Option<f64> {
        match value {
            Value::Float(f) => Some(f64::from(*f)),
            other => other.as_long().map(|v| v as f64),
        }
    }
}

impl MetricProducer for ValueMetricProducer {
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
        let is_new = !self.current.contains_key(&key);
        if is_new {
            if !condition && !self.use_diff {
                return;
            }
            if condition
                && self.skip_new_keys_after_condition_change
                && self.condition_changed_in_bucket
            {
                trace!(
                    metric_id = self.core.metric_id,
                    key = %key,
                    "new key after condition change skipped",
                );
                return;
            }
            if self
                .core
                .hit_dimension_guardrail(self.current.len(), event.elapsed_ts_ns)
            {
                return;
            }
        }

        let aggregates = self
            .current
            .entry(key)
            .or_insert_with(|| vec![FieldAggregate::default(); self.value_fields.len()]);

        for (field, aggregate) in self.value_fields.iter().zip(aggregates.iter_mut()) {
            let Some(raw) = filter_first(&field.path, &event.values).and_then(|fv| Self::numeric(&fv.value))
            else {
                continue;
            };
            if self.use_diff {
                let base = aggregate.base.replace(raw);
                // Even under a false condition the base tracks the source so
                // the next true-condition diff is correct.
                if condition {
                    if let Some(base) = base {
                        aggregate.absorb(raw - base);
                    }
                }
            } else if condition {
                aggregate.absorb(raw);
            }
        }
    }

    fn on_condition_changed(&mut self, new_state: ConditionState, event_ts_ns: i64) {
        self.flush_if_needed(event_ts_ns);
        self.core.condition = new_state;
        self.condition_changed_in_bucket = true;
        if !self.core.is_active {
            return;
        }
        self.core
            .condition_timer
            .on_condition_changed(new_state.is_true(), event_ts_ns);
        if new_state.is_true() && self.use_diff {
            // The source kept counting while we were not looking; a fresh
            // base avoids attributing the gap to this bucket.
            for aggregates in self.current.values_mut() {
                for aggregate in aggregates.iter_mut() {
                    aggregate.base = None;
                }
            }
        }
    }

    fn flush_current_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) {
        let (interval, condition_true_ns, _corr) =
            self.core.finish_bucket(event_ts_ns, next_bucket_start_ns);
        self.condition_changed_in_bucket = false;

        let mut dead_keys = Vec::new();
        for (key, aggregates) in self.current.iter_mut() {
            let mut values = Vec::new();
            for (field, aggregate) in self.value_fields.iter().zip(aggregates.iter_mut()) {
                if let Some((value, count)) = aggregate.emit(field.aggregation) {
                    values.push(ValueSummary {
                        field: field.path.steps.last().map(|s| s.field).unwrap_or(0),
                        aggregate: value,
                        sample_size: count,
                    });
                }
            }
            if !values.is_empty() {
                self.past.entry(key.clone()).or_default().push(ValueBucket {
                    interval,
                    condition_true_ns,
                    values,
                });
            } else if aggregates.iter().all(|a| a.base.is_none()) {
                dead_keys.push(key.clone());
            }
        }
        for key in dead_keys {
            self.current.remove(&key);
        }
    }

    fn byte_size(&self) -> usize {
        self.past
            .iter()
            .map(|(key, buckets)| {
                key.byte_size()
                    + buckets
                        .iter()
                        .map(|b| {
                            std::mem::size_of::<ValueBucket>()
                                + b.values.len() * std::mem::size_of::<ValueSummary>()
                        })
                        .sum::<usize>()
            })
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
                            payload: BucketPayload::Values(b.values.clone()),
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
    use super::*;
    use crate::condition::ConditionLookup;
    use crate::metrics::testutil::{base_spec, SECOND_NS};
    use crate::state::NoStates;

    struct NoConditions;
    impl ConditionLookup for NoConditions {
        fn query(
            &self,
            _index: usize,
            _key: &crate::dimension::DimensionKey,
            _partial: bool,
        ) -> ConditionState {
            ConditionState::Unknown
        }
    }

    fn sum_producer() -> ValueMetricProducer {
        ValueMetricProducer::new(
            base_spec(1),
            0,
            vec![ValueField {
                path: DimensionPath::leaf(2),
                aggregation: ValueAggregation::Sum,
            }],
            None,
            false,
            false,
        )
    }

    fn feed(p: &mut ValueMetricProducer, ts: i64, v: i64) {
        let event = AtomEvent::new(5, ts).with_long(2, v);
        p.on_matched_event(0, &event, &NoConditions, &NoStates);
    }

    fn summaries(p: &mut ValueMetricProducer, dump_ts: i64) -> Vec<Vec<ValueSummary>> {
        let mut pool = StringPool::new();
        let report = p.dump_report(dump_ts, false, false, DumpReason::Requested, &mut pool);
        report
            .data
            .first()
            .map(|d| {
                d.buckets
                    .iter()
                    .map(|b| match &b.payload {
                        BucketPayload::Values(v) => v.clone(),
                        _ => panic!("values payload expected"),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_sum_across_buckets() {
        let mut p = sum_producer();
        feed(&mut p, 10 * SECOND_NS, 5);
        feed(&mut p, 20 * SECOND_NS, 7);
        feed(&mut p, 70 * SECOND_NS, 1);

        let got = summaries(&mut p, 120 * SECOND_NS);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0][0].aggregate, 12.0);
        assert_eq!(got[0][0].sample_size, 2);
        assert_eq!(got[1][0].aggregate, 1.0);
    }

    #[test]
    fn test_min_max_avg() {
        let mut p = ValueMetricProducer::new(
            base_spec(2),
            0,
            vec![
                ValueField {
                    path: DimensionPath::leaf(2),
                    aggregation: ValueAggregation::Min,
                },
                ValueField {
                    path: DimensionPath::leaf(2),
                    aggregation: ValueAggregation::Max,
                },
                ValueField {
                    path: DimensionPath::leaf(2),
                    aggregation: ValueAggregation::Avg,
                },
            ],
            None,
            false,
            false,
        );
        for (ts, v) in [(10, 4), (20, 10), (30, 1)] {
            feed(&mut p, ts * SECOND_NS, v);
        }

        let got = summaries(&mut p, 60 * SECOND_NS);
        assert_eq!(got[0][0].aggregate, 1.0);
        assert_eq!(got[0][1].aggregate, 10.0);
        assert_eq!(got[0][2].aggregate, 5.0);
    }

    #[test]
    fn test_diff_mode_establishes_base_first() {
        let mut p = ValueMetricProducer::new(
            base_spec(3),
            0,
            vec![ValueField {
                path: DimensionPath::leaf(2),
                aggregation: ValueAggregation::Sum,
            }],
            Some(10019),
            true,
            false,
        );
        feed(&mut p, 10 * SECOND_NS, 1_000); // base only
        feed(&mut p, 30 * SECOND_NS, 1_300);
        feed(&mut p, 50 * SECOND_NS, 1_450);

        let got = summaries(&mut p, 60 * SECOND_NS);
        assert_eq!(got[0][0].aggregate, 450.0);
        assert_eq!(got[0][0].sample_size, 2);
    }

    #[test]
    fn test_condition_flip_resets_base_in_diff_mode() {
        let mut spec = base_spec(4);
        spec.condition_index = Some(0);
        spec.initial_condition = ConditionState::True;
        let mut p = ValueMetricProducer::new(
            spec,
            0,
            vec![ValueField {
                path: DimensionPath::leaf(2),
                aggregation: ValueAggregation::Sum,
            }],
            Some(10019),
            true,
            false,
        );
        feed(&mut p, 5 * SECOND_NS, 1_000);
        feed(&mut p, 10 * SECOND_NS, 1_100); // +100
        p.on_condition_changed(ConditionState::False, 15 * SECOND_NS);
        p.on_condition_changed(ConditionState::True, 30 * SECOND_NS);
        // Source advanced to 5_000 while untracked; first sample after the
        // flip only re-arms the base.
        feed(&mut p, 35 * SECOND_NS, 5_000);
        feed(&mut p, 40 * SECOND_NS, 5_020); // +20

        let got = summaries(&mut p, 60 * SECOND_NS);
        assert_eq!(got[0][0].aggregate, 120.0);
    }

    #[test]
    fn test_skip_new_keys_after_condition_change() {
        let mut spec = base_spec(5);
        spec.condition_index = Some(0);
        spec.initial_condition = ConditionState::True;
        spec.dimensions_in_what =
            crate::dimension::DimensionSpec::new(vec![DimensionPath::leaf(1)]);
        let mut p = ValueMetricProducer::new(
            spec,
            0,
            vec![ValueField {
                path: DimensionPath::leaf(2),
                aggregation: ValueAggregation::Sum,
            }],
            None,
            false,
            true,
        );

        let known = AtomEvent::new(5, 5 * SECOND_NS).with_int(1, 100).with_long(2, 1);
        p.on_matched_event(0, &known, &NoConditions, &NoStates);

        p.on_condition_changed(ConditionState::False, 10 * SECOND_NS);
        p.on_condition_changed(ConditionState::True, 20 * SECOND_NS);

        // Existing key keeps aggregating; an unseen key is rejected until the
        // next bucket.
        let known2 = AtomEvent::new(5, 25 * SECOND_NS).with_int(1, 100).with_long(2, 2);
        let fresh = AtomEvent::new(5, 26 * SECOND_NS).with_int(1, 200).with_long(2, 9);
        p.on_matched_event(0, &known2, &NoConditions, &NoStates);
        p.on_matched_event(0, &fresh, &NoConditions, &NoStates);
        assert_eq!(p.current.len(), 1);

        // Rotation clears the latch (and retires the emitted key), so the
        // unseen key is accepted in the next bucket.
        let fresh_next_bucket =
            AtomEvent::new(5, 70 * SECOND_NS).with_int(1, 200).with_long(2, 9);
        p.on_matched_event(0, &fresh_next_bucket, &NoConditions, &NoStates);
        assert_eq!(p.current.len(), 1);
    }

    #[test]
    fn test_condition_false_samples_ignored_without_diff() {
        let mut spec = base_spec(6);
        spec.condition_index = Some(0);
        spec.initial_condition = ConditionState::False;
        let mut p = ValueMetricProducer::new(
            spec,
            0,
            vec![ValueField {
                path: DimensionPath::leaf(2),
                aggregation: ValueAggregation::Sum,
            }],
            None,
            false,
            false,
        );
        feed(&mut p, 10 * SECOND_NS, 100);
        assert!(summaries(&mut p, 60 * SECOND_NS).is_empty());
    }
}
