use std::collections::BTreeMap;

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::dimension::DimensionKey;
use crate::event::Value;
use crate::guardrail::ConfigKey;

pub fn ns_to_ms(ns: i64) -> i64 {
    ns / 1_000_000
}

/// Why a dump was requested; also stamped into the active-metric snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpReason {
    Requested,
    DeviceShutdown,
    TerminationSignal,
    SupervisorDied,
    UploadFailed,
}

/// Shared string set; report dimensions reference strings by stable hash.
#[derive(Default)]
pub struct StringPool {
    entries: BTreeMap<u64, String>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> u64 {
        let hash = xxh3_64(s.as_bytes());
        self.entries.entry(hash).or_insert_with(|| s.to_string());
        hash
    }

    pub fn into_entries(self) -> Vec<StringEntry> {
        self.entries
            .into_iter()
            .map(|(hash, value)| StringEntry { hash, value })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StringEntry {
    pub hash: u64,
    pub value: String,
}

/// A value as it appears in a report; strings are pool references.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReportValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
    StrHash(u64),
}

/// One dimension or payload field in a report: innermost field number plus
/// its value.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportField {
    pub field: u32,
    pub value: ReportValue,
}

/// Renders a dimension key for a report, interning strings into the pool.
pub fn render_dimension(key: &DimensionKey, pool: &mut StringPool) -> Vec<ReportField> {
    key.values()
        .iter()
        .map(|fv| ReportField {
            field: fv.field.last_field().unwrap_or(0),
            value: match &fv.value {
                Value::Int(v) => ReportValue::Int(*v),
                Value::Long(v) => ReportValue::Long(*v),
                Value::Float(v) => ReportValue::Float(*v),
                Value::Bool(v) => ReportValue::Bool(*v),
                Value::Str(s) => ReportValue::StrHash(pool.intern(s)),
            },
        })
        .collect()
}

/// Identifies a closed bucket: a full bucket by number, a partial bucket by
/// its explicit bounds in elapsed millis.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BucketSpan {
    Num(i64),
    Range {
        start_elapsed_ms: i64,
        end_elapsed_ms: i64,
    },
}

/// Per-field aggregate emitted by value metrics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValueSummary {
    pub field: u32,
    pub aggregate: f64,
    pub sample_size: u64,
}

/// One sampled gauge tuple.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GaugeSample {
    pub elapsed_ts_ns: i64,
    pub fields: Vec<ReportField>,
}

/// One verbatim event tuple.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventSample {
    pub elapsed_ts_ns: i64,
    pub atom_id: u32,
    pub fields: Vec<ReportField>,
}

/// Variant-specific bucket payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BucketPayload {
    Count(u64),
    DurationNs(i64),
    Values(Vec<ValueSummary>),
    GaugeAtoms(Vec<GaugeSample>),
    Events(Vec<EventSample>),
    Histogram(Vec<u64>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BucketInfo {
    pub span: BucketSpan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_true_ns: Option<i64>,
    pub payload: BucketPayload,
}

/// All buckets for one `(dimension, state values)` slice.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DimensionData {
    pub dimension: Vec<ReportField>,
    /// Set when the dimension holds a nested repeated-field sequence
    /// (position ALL), so the consumer reconstructs structure.
    pub use_nested_dimensions: bool,
    pub state_values: Vec<ReportField>,
    pub buckets: Vec<BucketInfo>,
}

/// Why events or buckets were discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketDropReason {
    DimensionGuardrailReached,
    PullFailed,
    EventBufferOverflow,
    DataDropped,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct DropEventReport {
    pub reason: BucketDropReason,
    pub drop_time_ms: i64,
}

/// A bucket that produced no data but recorded drops.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SkippedBucketReport {
    pub start_elapsed_ms: i64,
    pub end_elapsed_ms: i64,
    pub drop_events: Vec<DropEventReport>,
}

/// One metric's section of a report.
#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub is_active: bool,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub dimension_guardrail_hit: bool,
    /// Field numbers of the dimension path, filled when dimensions are flat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension_path: Option<Vec<u32>>,
    pub data: Vec<DimensionData>,
    pub skipped: Vec<SkippedBucketReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub key: ConfigKey,
    pub metrics: Vec<MetricReport>,
}

/// The full report tree produced by a dump.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub dump_elapsed_ns: i64,
    pub reason: DumpReason,
    pub configs: Vec<ConfigReport>,
    pub strings: Vec<StringEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Field, FieldValue};

    #[test]
    fn test_string_pool_dedups_by_hash() {
        let mut pool = StringPool::new();
        let a = pool.intern("com.example.app");
        let b = pool.intern("com.example.app");
        let c = pool.intern("com.other.app");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let entries = pool.into_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.value == "com.example.app"));
    }

    #[test]
    fn test_string_pool_hash_is_stable() {
        let mut p1 = StringPool::new();
        let mut p2 = StringPool::new();
        assert_eq!(p1.intern("stable"), p2.intern("stable"));
    }

    #[test]
    fn test_render_dimension_interns_strings() {
        let mut key = DimensionKey::default();
        key.add_value(FieldValue::new(Field::leaf(10, 1), Value::Int(1000)));
        key.add_value(FieldValue::new(
            Field::leaf(10, 2),
            Value::Str("pkg".to_string()),
        ));

        let mut pool = StringPool::new();
        let fields = render_dimension(&key, &mut pool);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].value, ReportValue::Int(1000));
        let ReportValue::StrHash(hash) = fields[1].value else {
            panic!("expected interned string");
        };
        assert!(pool.into_entries().iter().any(|e| e.hash == hash));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = Report {
            dump_elapsed_ns: 123,
            reason: DumpReason::Requested,
            configs: vec![ConfigReport {
                key: ConfigKey::new(0, 1),
                metrics: vec![MetricReport {
                    metric_id: 1,
                    is_active: true,
                    time_base_ns: 0,
                    bucket_size_ns: 60_000_000_000,
                    dimension_guardrail_hit: false,
                    dimension_path: None,
                    data: vec![DimensionData {
                        dimension: vec![],
                        use_nested_dimensions: false,
                        state_values: vec![],
                        buckets: vec![BucketInfo {
                            span: BucketSpan::Num(0),
                            condition_true_ns: None,
                            payload: BucketPayload::Count(2),
                        }],
                    }],
                    skipped: vec![],
                }],
            }],
            strings: vec![],
        };

        let json = serde_json::to_string(&report).expect("serializes");
        assert!(json.contains("\"count\":2"));
        assert!(json.contains("\"metric_id\":1"));
    }
}
