use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::dimension::{DimensionPath, DimensionSpec};
use crate::event::Value;

const NS_PER_MINUTE: i64 = 60 * 1_000_000_000;

/// Top-level configuration for the metricoor engine.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Health/metrics HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Where the active-metric snapshot is persisted across restarts.
    #[serde(default)]
    pub snapshot_path: Option<std::path::PathBuf>,

    /// Capacity of the ingest queue; overflow drops events. Default: 65536.
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,

    /// How often the engine checks bucket expiry and activation TTLs.
    /// Default: 60s.
    #[serde(default = "default_flush_check_interval", with = "humantime_serde")]
    pub flush_check_interval: Duration,

    /// Metric configurations, one per owner.
    #[serde(default)]
    pub configs: Vec<TelemetryConfig>,
}

/// Health/metrics HTTP server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: "127.0.0.1:9464".
    #[serde(default = "default_health_addr")]
    pub addr: String,

    /// Enable the endpoint. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One owner's metric configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub uid: u32,
    pub id: i64,

    /// Byte budget for retained data across this config's metrics.
    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,

    #[serde(default)]
    pub matchers: Vec<MatcherConfig>,

    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,

    #[serde(default)]
    pub states: Vec<StateConfig>,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub alerts: Vec<AlertConfig>,

    #[serde(default)]
    pub pulls: Vec<PullConfig>,
}

/// Classifies events into a logical stream by atom id and optional field
/// equality checks.
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    pub id: i64,
    pub atom_id: u32,
    #[serde(default)]
    pub field_eq: Vec<FieldEq>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldEq {
    pub field: u32,
    pub value: Value,
}

/// A condition node: either a simple start/stop predicate or a boolean
/// combination of previously defined conditions.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionConfig {
    pub id: i64,

    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub stop: Option<i64>,
    #[serde(default)]
    pub stop_all: Option<i64>,
    #[serde(default)]
    pub count_nesting: bool,
    /// Initial value before any matcher fires is unknown instead of false.
    #[serde(default)]
    pub initial_value_unknown: bool,
    /// Slicing dimensions; present makes this a sliced condition.
    #[serde(default)]
    pub dimensions: Option<DimensionSpec>,

    /// A combination node instead of a simple one.
    #[serde(default)]
    pub combination: Option<CombinationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CombinationConfig {
    pub op: crate::condition::LogicalOp,
    pub children: Vec<i64>,
}

/// Declares a state atom with its primary key and value fields.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub atom_id: u32,
    #[serde(default)]
    pub primary_fields: Vec<u32>,
    pub value_field: u32,
    /// Raw state value to group id; values outside map to unknown.
    #[serde(default)]
    pub group_map: HashMap<i32, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Count,
    Duration,
    Value,
    Gauge,
    Event,
    Histogram,
}

/// One metric definition; variant-specific fields are optional and checked
/// while the engine is built.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: MetricKind,

    /// The matcher feeding this metric (the start matcher for durations).
    pub what: i64,

    /// Bucket length; rounded to whole minutes, minimum one minute.
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,

    #[serde(default)]
    pub condition: Option<i64>,

    #[serde(default)]
    pub dimensions: Option<DimensionSpec>,

    #[serde(default)]
    pub links: Vec<LinkConfig>,

    #[serde(default)]
    pub slice_by_state: Vec<u32>,

    #[serde(default)]
    pub state_links: Vec<StateLinkConfig>,

    #[serde(default)]
    pub threshold: Option<crate::metrics::UploadThreshold>,

    #[serde(default)]
    pub activations: Vec<ActivationConfig>,

    #[serde(default)]
    pub deactivations: Vec<DeactivationConfig>,

    #[serde(default = "default_true")]
    pub split_bucket_for_app_upgrade: bool,

    #[serde(default)]
    pub max_dimensions_per_bucket: Option<i64>,

    #[serde(default)]
    pub sampling: Option<SamplingConfig>,

    // --- duration ---
    #[serde(default)]
    pub stop: Option<i64>,
    #[serde(default)]
    pub stop_all: Option<i64>,
    #[serde(default)]
    pub nested: bool,
    #[serde(default)]
    pub aggregation: crate::metrics::duration::DurationAggregation,

    // --- value ---
    #[serde(default)]
    pub value_fields: Vec<ValueFieldConfig>,
    #[serde(default)]
    pub pulled_atom: Option<u32>,
    #[serde(default)]
    pub use_diff: bool,
    #[serde(default)]
    pub skip_new_keys_after_condition_change: bool,

    // --- gauge ---
    #[serde(default)]
    pub gauge_fields: Vec<DimensionPath>,
    #[serde(default = "default_max_gauge_samples")]
    pub max_samples_per_bucket: usize,

    // --- histogram ---
    #[serde(default)]
    pub histogram_field: Option<DimensionPath>,
    #[serde(default)]
    pub histogram_bins: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub condition: i64,
    pub fields_in_what: Vec<DimensionPath>,
    pub fields_in_condition: Vec<DimensionPath>,
    /// Set when the link covers every dimension of the condition.
    #[serde(default)]
    pub all_condition_dimensions: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateLinkConfig {
    pub state_atom_id: u32,
    pub fields_in_what: Vec<DimensionPath>,
    pub fields_in_state: Vec<DimensionPath>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationConfig {
    pub matcher: i64,
    #[serde(default = "default_activation_kind")]
    pub kind: crate::metrics::activation::ActivationKind,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeactivationConfig {
    pub matcher: i64,
    /// Activation matcher ids cleared when this matcher fires.
    pub activations: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    pub field: DimensionPath,
    pub shard_count: u32,
    #[serde(default)]
    pub shard_offset: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueFieldConfig {
    pub path: DimensionPath,
    #[serde(default)]
    pub aggregation: crate::metrics::value::ValueAggregation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    pub id: i64,
    pub metric: i64,
    #[serde(default = "default_alert_buckets")]
    pub num_buckets: usize,
    pub trigger_if_sum_gt: i64,
    #[serde(default = "default_refractory", with = "humantime_serde")]
    pub refractory: Duration,
}

/// Registers a pulled atom's cadence for this config.
#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    pub atom_id: u32,
    #[serde(default = "default_pull_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_cool_down", with = "humantime_serde")]
    pub cool_down: Duration,
    #[serde(default = "default_pull_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_addr() -> String {
    "127.0.0.1:9464".to_string()
}

fn default_true() -> bool {
    true
}

fn default_event_queue_size() -> usize {
    65536
}

fn default_flush_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_byte_budget() -> usize {
    crate::guardrail::DEFAULT_CONFIG_BYTE_BUDGET
}

fn default_bucket() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_gauge_samples() -> usize {
    crate::metrics::gauge::DEFAULT_MAX_SAMPLES_PER_BUCKET
}

fn default_activation_kind() -> crate::metrics::activation::ActivationKind {
    crate::metrics::activation::ActivationKind::Immediate
}

fn default_alert_buckets() -> usize {
    1
}

fn default_refractory() -> Duration {
    Duration::from_secs(10)
}

fn default_pull_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_cool_down() -> Duration {
    Duration::from_secs(1)
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(10)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            health: HealthConfig::default(),
            snapshot_path: None,
            event_queue_size: default_event_queue_size(),
            flush_check_interval: default_flush_check_interval(),
            configs: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
            enabled: true,
        }
    }
}

/// Rounds a bucket duration to a whole number of minutes, minimum one.
pub fn bucket_size_ns(bucket: Duration) -> i64 {
    let minutes = (bucket.as_nanos() as i64 / NS_PER_MINUTE).max(1);
    minutes * NS_PER_MINUTE
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Structural validation; per-metric semantic validation happens while
    /// building the engine and yields `InvalidConfigReason`s instead.
    pub fn validate(&self) -> Result<()> {
        if self.event_queue_size == 0 {
            bail!("event_queue_size must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for cfg in &self.configs {
            if !seen.insert((cfg.uid, cfg.id)) {
                bail!("duplicate config key {}/{}", cfg.uid, cfg.id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_rounding() {
        assert_eq!(bucket_size_ns(Duration::from_secs(60)), NS_PER_MINUTE);
        assert_eq!(bucket_size_ns(Duration::from_secs(59)), NS_PER_MINUTE);
        assert_eq!(bucket_size_ns(Duration::from_secs(1)), NS_PER_MINUTE);
        assert_eq!(bucket_size_ns(Duration::from_secs(150)), 2 * NS_PER_MINUTE);
        assert_eq!(
            bucket_size_ns(Duration::from_secs(3600)),
            60 * NS_PER_MINUTE
        );
    }

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
configs:
  - uid: 1000
    id: 1
    matchers:
      - { id: 10, atom_id: 5 }
    metrics:
      - { id: 1, type: count, what: 10, bucket: 1m }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(cfg.configs.len(), 1);
        let metric = &cfg.configs[0].metrics[0];
        assert_eq!(metric.kind, MetricKind::Count);
        assert_eq!(metric.what, 10);
        assert!(metric.split_bucket_for_app_upgrade);
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_parse_full_metric() {
        let yaml = r#"
configs:
  - uid: 1000
    id: 7
    matchers:
      - { id: 10, atom_id: 5 }
      - { id: 11, atom_id: 29, field_eq: [{field: 1, value: {int: 2}}] }
      - { id: 12, atom_id: 29, field_eq: [{field: 1, value: {int: 1}}] }
    conditions:
      - { id: 20, start: 11, stop: 12 }
    states:
      - { atom_id: 47, primary_fields: [1], value_field: 2, group_map: {2: 100, 3: 100} }
    metrics:
      - id: 1
        type: count
        what: 10
        bucket: 5m
        condition: 20
        dimensions: { paths: [{steps: [{field: 1}]}] }
        slice_by_state: [47]
        state_links:
          - state_atom_id: 47
            fields_in_what: [{steps: [{field: 1}]}]
            fields_in_state: [{steps: [{field: 1}]}]
        threshold: { gt_int: 1 }
        activations:
          - { matcher: 10, kind: immediate, ttl: 100s }
    alerts:
      - { id: 100, metric: 1, num_buckets: 2, trigger_if_sum_gt: 5 }
    pulls:
      - { atom_id: 10019, interval: 2m }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        let tc = &cfg.configs[0];
        assert_eq!(tc.conditions.len(), 1);
        assert_eq!(tc.states[0].group_map.get(&2), Some(&100));
        assert_eq!(tc.metrics[0].slice_by_state, vec![47]);
        assert_eq!(tc.alerts[0].num_buckets, 2);
        assert_eq!(tc.pulls[0].interval, Duration::from_secs(120));
    }

    #[test]
    fn test_duplicate_config_key_rejected() {
        let yaml = r#"
configs:
  - { uid: 1000, id: 1 }
  - { uid: 1000, id: 1 }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        let err = cfg.validate().expect_err("duplicate rejected");
        assert!(err.to_string().contains("duplicate config key"));
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.event_queue_size, 65536);
        assert_eq!(cfg.flush_check_interval, Duration::from_secs(60));
        assert!(cfg.health.enabled);
    }
}
