use std::collections::HashMap;

use crate::dimension::{filter_first, DimensionPath, MetricDimensionKey};
use crate::event::{AtomEvent, FieldValue};
use crate::metrics::{BucketInterval, MetricProducer, ProducerCore, ProducerSpec};
use crate::report::{
    render_dimension, BucketInfo, BucketPayload, DimensionData, DumpReason, GaugeSample,
    MetricReport, ReportField, ReportValue, StringPool,
};

/// Default cap on sampled tuples retained per key per bucket.
pub const DEFAULT_MAX_SAMPLES_PER_BUCKET: usize = 10;

#[derive(Debug, Clone)]
struct RawSample {
    elapsed_ts_ns: i64,
    values: Vec<FieldValue>,
}

#[derive(Debug, Clone)]
struct GaugeBucket {
    interval: BucketInterval,
    samples: Vec<RawSample>,
}

/// Retains the latest sampled field tuples per key per bucket.
///
/// Pull-driven gauges receive their samples through the same matched-event
/// path once the scheduler hands pulled atoms to the engine.
pub struct GaugeMetricProducer {
    core: ProducerCore,
    /// Fields copied into each sample; empty selects the whole tuple.
    gauge_fields: Vec<DimensionPath>,
    pulled_atom: Option<u32>,
    max_samples_per_bucket: usize,
    current: HashMap<MetricDimensionKey, Vec<RawSample>>,
    past: HashMap<MetricDimensionKey, Vec<GaugeBucket>>,
}

impl GaugeMetricProducer {
    pub fn new(
        spec: ProducerSpec,
        start_time_ns: i64,
        gauge_fields: Vec<DimensionPath>,
        pulled_atom: Option<u32>,
        max_samples_per_bucket: usize,
    ) -> Self {
        Self {
            core: ProducerCore::new(spec, start_time_ns),
            gauge_fields,
            pulled_atom,
            max_samples_per_bucket: max_samples_per_bucket.max(1),
            current: HashMap::new(),
            past: HashMap::new(),
        }
    }

    pub fn pulled_atom(&self) -> Option<u32> {
        self.pulled_atom
    }

    fn select_fields(&self, event: &AtomEvent) -> Vec<FieldValue> {
        if self.gauge_fields.is_empty() {
            return event.values.clone();
        }
        self.gauge_fields
            .iter()
            .filter_map(|path| filter_first(path, &event.values))
            .collect()
    }

    fn render_sample(sample: &RawSample, pool: &mut StringPool) -> GaugeSample {
        GaugeSample {
            elapsed_ts_ns: sample.elapsed_ts_ns,
            fields: sample
                .values
                .iter()
                .map(|fv| ReportField {
                    field: fv.field.last_field().unwrap_or(0),
                    value: match &fv.value {
                        crate::event::Value::Int(v) => ReportValue::Int(*v),
                        crate::event::Value::Long(v) => ReportValue::Long(*v),
                        crate::event::Value::Float(v) => ReportValue::Float(*v),
                        crate::event::Value::Bool(v) => ReportValue::Bool(*v),
                        crate::event::Value::Str(s) => ReportValue::StrHash(pool.intern(s)),
                    },
                })
                .collect(),
        }
    }
}

impl MetricProducer for GaugeMetricProducer {
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
        let values = self.select_fields(event);
        let samples = self.current.entry(key).or_default();
        if samples.len() >= self.max_samples_per_bucket {
            return;
        }
        samples.push(RawSample {
            elapsed_ts_ns: event.elapsed_ts_ns,
            values,
        });
    }

    fn flush_current_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) {
        let (interval, _cond_true, _corr) =
            self.core.finish_bucket(event_ts_ns, next_bucket_start_ns);
        for (key, samples) in self.current.drain() {
            if samples.is_empty() {
                continue;
            }
            self.past
                .entry(key)
                .or_default()
                .push(GaugeBucket { interval, samples });
        }
    }

    fn byte_size(&self) -> usize {
        self.past
            .iter()
            .map(|(key, buckets)| {
                key.byte_size()
                    + buckets
                        .iter()
                        .map(|b| b.samples.len() * std::mem::size_of::<RawSample>())
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
                            payload: BucketPayload::GaugeAtoms(
                                b.samples
                                    .iter()
                                    .map(|s| Self::render_sample(s, pool))
                                    .collect(),
                            ),
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

    fn producer(max_samples: usize) -> GaugeMetricProducer {
        GaugeMetricProducer::new(
            base_spec(1),
            0,
            vec![DimensionPath::leaf(2)],
            None,
            max_samples,
        )
    }

    fn feed(p: &mut GaugeMetricProducer, ts: i64, v: i64) {
        let event = AtomEvent::new(5, ts).with_long(2, v);
        p.on_matched_event(0, &event, &NoConditions, &NoStates);
    }

    fn gauge_buckets(p: &mut GaugeMetricProducer, dump_ts: i64) -> Vec<Vec<GaugeSample>> {
        let mut pool = StringPool::new();
        let report = p.dump_report(dump_ts, false, false, DumpReason::Requested, &mut pool);
        report
            .data
            .first()
            .map(|d| {
                d.buckets
                    .iter()
                    .map(|b| match &b.payload {
                        BucketPayload::GaugeAtoms(s) => s.clone(),
                        _ => panic!("gauge payload expected"),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_samples_retained_per_bucket() {
        let mut p = producer(10);
        feed(&mut p, 10 * SECOND_NS, 42);
        feed(&mut p, 20 * SECOND_NS, 43);
        feed(&mut p, 70 * SECOND_NS, 44);

        let got = gauge_buckets(&mut p, 120 * SECOND_NS);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].len(), 2);
        assert_eq!(got[0][0].fields[0].value, ReportValue::Long(42));
        assert_eq!(got[1].len(), 1);
        assert_eq!(got[1][0].elapsed_ts_ns, 70 * SECOND_NS);
    }

    #[test]
    fn test_sample_cap_enforced() {
        let mut p = producer(2);
        for i in 0..5 {
            feed(&mut p, (10 + i) * SECOND_NS, i);
        }
        let got = gauge_buckets(&mut p, 60 * SECOND_NS);
        assert_eq!(got[0].len(), 2);
    }

    #[test]
    fn test_field_selection() {
        let mut p = producer(10);
        let event = AtomEvent::new(5, 10 * SECOND_NS)
            .with_int(1, 7)
            .with_long(2, 99)
            .with_str(3, "ignored");
        p.on_matched_event(0, &event, &NoConditions, &NoStates);

        let got = gauge_buckets(&mut p, 60 * SECOND_NS);
        assert_eq!(got[0][0].fields.len(), 1);
        assert_eq!(got[0][0].fields[0].field, 2);
        assert_eq!(got[0][0].fields[0].value, ReportValue::Long(99));
    }
}
