use std::collections::HashMap;

use crate::dimension::{filter_first, DimensionPath, MetricDimensionKey};
use crate::event::{AtomEvent, Value};
use crate::metrics::{BucketInterval, MetricProducer, ProducerCore, ProducerSpec};
use crate::report::{
    render_dimension, BucketInfo, BucketPayload, DimensionData, DumpReason, MetricReport,
    StringPool,
};

/// Fixed-boundary sketch: `boundaries` are the lower-exclusive upper bounds
/// of bins 0..n-1, with a final +inf bin. A value lands in the first bin
/// whose boundary exceeds it.
#[derive(Debug, Clone)]
pub struct BinSketch {
    counts: Vec<u64>,
}

impl BinSketch {
    fn new(num_bins: usize) -> Self {
        Self {
            counts: vec![0; num_bins],
        }
    }

    fn record(&mut self, boundaries: &[f64], value: f64) {
        let idx = bin_index(boundaries, value);
        if let Some(slot) = self.counts.get_mut(idx) {
            *slot += 1;
        }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }
}

/// Returns the bin index for a value given ascending boundaries.
pub fn bin_index(boundaries: &[f64], value: f64) -> usize {
    for (i, &boundary) in boundaries.iter().enumerate() {
        if value < boundary {
            return i;
        }
    }
    boundaries.len()
}

#[derive(Debug, Clone)]
struct HistogramBucket {
    interval: BucketInterval,
    counts: Vec<u64>,
}

/// Accumulates per-key binned sketches of one value field per bucket.
pub struct HistogramMetricProducer {
    core: ProducerCore,
    value_field: DimensionPath,
    boundaries: Vec<f64>,
    current: HashMap<MetricDimensionKey, BinSketch>,
    past: HashMap<MetricDimensionKey, Vec<HistogramBucket>>,
}

impl HistogramMetricProducer {
    pub fn new(
        spec: ProducerSpec,
        start_time_ns: i64,
        value_field: DimensionPath,
        boundaries: Vec<f64>,
    ) -> Self {
        Self {
            core: ProducerCore::new(spec, start_time_ns),
            value_field,
            boundaries,
            current: HashMap::new(),
            past: HashMap::new(),
        }
    }

    fn num_bins(&self) -> usize {
        self.boundaries.len() + 1
    }
}

impl MetricProducer for HistogramMetricProducer {
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
        let Some(raw) = filter_first(&self.value_field, &event.values) else {
            return;
        };
        let value = match &raw.value {
            Value::Float(f) => f64::from(*f),
            other => match other.as_long() {
                Some(v) => v as f64,
                None => return,
            },
        };

        if !self.current.contains_key(&key)
            && self
                .core
                .hit_dimension_guardrail(self.current.len(), event.elapsed_ts_ns)
        {
            return;
        }
        let bins = self.num_bins();
        self.current
            .entry(key)
            .or_insert_with(|| BinSketch::new(bins))
            .record(&self.boundaries, value);
    }

    fn flush_current_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) {
        let (interval, _cond_true, _corr) =
            self.core.finish_bucket(event_ts_ns, next_bucket_start_ns);
        for (key, sketch) in self.current.drain() {
            if sketch.counts.iter().all(|&c| c == 0) {
                continue;
            }
            self.past.entry(key).or_default().push(HistogramBucket {
                interval,
                counts: sketch.counts,
            });
        }
    }

    fn byte_size(&self) -> usize {
        self.past
            .iter()
            .map(|(key, buckets)| {
                key.byte_size()
                    + buckets
                        .iter()
                        .map(|b| b.counts.len() * std::mem::size_of::<u64>())
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
                            payload: BucketPayload::Histogram(b.counts.clone()),
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
    use crate::condition::{ConditionLookup, ConditionState};
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

    #[test]
    fn test_bin_index_at_and_between_boundaries() {
        let boundaries = [10.0, 100.0, 1000.0];
        assert_eq!(bin_index(&boundaries, 0.0), 0);
        assert_eq!(bin_index(&boundaries, 9.9), 0);
        assert_eq!(bin_index(&boundaries, 10.0), 1);
        assert_eq!(bin_index(&boundaries, 99.0), 1);
        assert_eq!(bin_index(&boundaries, 100.0), 2);
        assert_eq!(bin_index(&boundaries, 5_000.0), 3);
    }

    #[test]
    fn test_sketch_accumulates_per_bucket() {
        let mut p = HistogramMetricProducer::new(
            base_spec(1),
            0,
            DimensionPath::leaf(2),
            vec![10.0, 100.0],
        );

        for (ts, v) in [(10, 5), (20, 50), (30, 55), (70, 500)] {
            let event = AtomEvent::new(5, ts * SECOND_NS).with_long(2, v);
            p.on_matched_event(0, &event, &NoConditions, &NoStates);
        }

        let mut pool = StringPool::new();
        let report =
            p.dump_report(120 * SECOND_NS, false, false, DumpReason::Requested, &mut pool);
        let buckets = &report.data[0].buckets;
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].payload, BucketPayload::Histogram(vec![1, 2, 0]));
        assert_eq!(buckets[1].payload, BucketPayload::Histogram(vec![0, 0, 1]));
    }

    #[test]
    fn test_non_numeric_values_ignored() {
        let mut p = HistogramMetricProducer::new(
            base_spec(2),
            0,
            DimensionPath::leaf(2),
            vec![10.0],
        );
        let event = AtomEvent::new(5, 10 * SECOND_NS).with_str(2, "nope");
        p.on_matched_event(0, &event, &NoConditions, &NoStates);
        assert!(p.current.is_empty());
    }
}
