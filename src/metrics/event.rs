use crate::dimension::MetricDimensionKey;
use crate::event::{AtomEvent, FieldValue};
use crate::metrics::{BucketInterval, MetricProducer, ProducerCore, ProducerSpec};
use crate::report::{
    BucketInfo, BucketPayload, DimensionData, DumpReason, EventSample, MetricReport, ReportField,
    ReportValue, StringPool,
};

/// Cap on verbatim tuples retained per bucket.
pub const MAX_EVENTS_PER_BUCKET: usize = 1000;

#[derive(Debug, Clone)]
struct RawEvent {
    elapsed_ts_ns: i64,
    atom_id: u32,
    values: Vec<FieldValue>,
}

#[derive(Debug, Clone)]
struct EventBucket {
    interval: BucketInterval,
    events: Vec<RawEvent>,
}

/// Forwards each condition-true matched event tuple verbatim into the bucket.
pub struct EventMetricProducer {
    core: ProducerCore,
    current: Vec<RawEvent>,
    past: Vec<EventBucket>,
}

impl EventMetricProducer {
    pub fn new(spec: ProducerSpec, start_time_ns: i64) -> Self {
        Self {
            core: ProducerCore::new(spec, start_time_ns),
            current: Vec::new(),
            past: Vec::new(),
        }
    }

    fn render(event: &RawEvent, pool: &mut StringPool) -> EventSample {
        EventSample {
            elapsed_ts_ns: event.elapsed_ts_ns,
            atom_id: event.atom_id,
            fields: event
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

impl MetricProducer for EventMetricProducer {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProducerCore {
        &mut self.core
    }

    fn update(
        &mut self,
        _matcher_index: usize,
        _key: MetricDimensionKey,
        event: &AtomEvent,
        condition: bool,
    ) {
        if !condition || self.current.len() >= MAX_EVENTS_PER_BUCKET {
            return;
        }
        self.current.push(RawEvent {
            elapsed_ts_ns: event.elapsed_ts_ns,
            atom_id: event.atom_id,
            values: event.values.clone(),
        });
    }

    fn flush_current_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) {
        let (interval, _cond_true, _corr) =
            self.core.finish_bucket(event_ts_ns, next_bucket_start_ns);
        if !self.current.is_empty() {
            self.past.push(EventBucket {
                interval,
                events: std::mem::take(&mut self.current),
            });
        }
    }

    fn byte_size(&self) -> usize {
        self.past
            .iter()
            .map(|b| b.events.len() * std::mem::size_of::<RawEvent>())
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

        let data = if self.past.is_empty() {
            Vec::new()
        } else {
            vec![DimensionData {
                dimension: Vec::new(),
                use_nested_dimensions: false,
                state_values: Vec::new(),
                buckets: self
                    .past
                    .iter()
                    .map(|b| BucketInfo {
                        span: b.interval.span(),
                        condition_true_ns: None,
                        payload: BucketPayload::Events(
                            b.events.iter().map(|e| Self::render(e, pool)).collect(),
                        ),
                    })
                    .collect(),
            }]
        };

        let report = MetricReport {
            metric_id: self.core.metric_id,
            is_active: self.core.is_active,
            time_base_ns: self.core.time_base_ns,
            bucket_size_ns: self.core.bucket_size_ns,
            dimension_guardrail_hit: false,
            dimension_path: None,
            data,
            skipped: self.core.skipped_reports(),
        };

        if erase_data {
            self.past.clear();
            self.core.skipped_buckets.clear();
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
    fn test_events_forwarded_verbatim() {
        let mut p = EventMetricProducer::new(base_spec(1), 0);
        let event = AtomEvent::new(5, 10 * SECOND_NS)
            .with_int(1, 7)
            .with_str(2, "com.example.app");
        p.on_matched_event(0, &event, &NoConditions, &NoStates);

        let mut pool = StringPool::new();
        let report =
            p.dump_report(60 * SECOND_NS, false, false, DumpReason::Requested, &mut pool);
        assert_eq!(report.data.len(), 1);
        let BucketPayload::Events(events) = &report.data[0].buckets[0].payload else {
            panic!("events payload expected");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].atom_id, 5);
        assert_eq!(events[0].fields.len(), 2);
        assert_eq!(events[0].fields[0].value, ReportValue::Int(7));
    }

    #[test]
    fn test_per_bucket_cap() {
        let mut p = EventMetricProducer::new(base_spec(2), 0);
        for i in 0..(MAX_EVENTS_PER_BUCKET + 5) {
            let event = AtomEvent::new(5, (i as i64) * 1_000);
            p.on_matched_event(0, &event, &NoConditions, &NoStates);
        }
        assert_eq!(p.current.len(), MAX_EVENTS_PER_BUCKET);
    }

    #[test]
    fn test_empty_buckets_not_reported() {
        let mut p = EventMetricProducer::new(base_spec(3), 0);
        let event = AtomEvent::new(5, 10 * SECOND_NS);
        p.on_matched_event(0, &event, &NoConditions, &NoStates);

        let mut pool = StringPool::new();
        let report =
            p.dump_report(300 * SECOND_NS, false, false, DumpReason::Requested, &mut pool);
        assert_eq!(report.data[0].buckets.len(), 1);
    }
}
