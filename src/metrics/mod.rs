pub mod activation;
pub mod anomaly;
pub mod count;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod histogram;
pub mod value;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::condition::timer::ConditionTimer;
use crate::condition::{ConditionLookup, ConditionState};
use crate::dimension::{
    extract_dimension_keys, filter_first, should_keep_sample, DimensionKey, DimensionPath,
    DimensionSpec, MetricDimensionKey,
};
use crate::event::{AtomEvent, Field, FieldValue, PathElem, Value};
use crate::guardrail::{
    ConfigKey, EngineStats, DIMENSION_KEY_SOFT_LIMIT, MAX_LOGGED_BUCKET_DROP_EVENTS,
};
use crate::metrics::activation::{
    ActivationKind, ActivationSnapshot, ActivationState, Activation, ActiveMetricSnapshot,
};
use crate::report::{
    ns_to_ms, BucketDropReason, BucketSpan, DropEventReport, DumpReason, MetricReport,
    SkippedBucketReport, StringPool,
};
use crate::state::{StateLookup, STATE_UNKNOWN};

/// Joins metric fields to a sliced condition's dimensions.
#[derive(Debug, Clone)]
pub struct MetricConditionLink {
    pub metric_fields: Vec<DimensionPath>,
    pub condition_fields: Vec<DimensionPath>,
}

/// Joins metric fields to a state atom's primary key.
#[derive(Debug, Clone)]
pub struct MetricStateLink {
    pub state_atom_id: u32,
    pub metric_fields: Vec<DimensionPath>,
    pub state_fields: Vec<DimensionPath>,
}

/// Gate on whether a closed bucket's value is worth uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadThreshold {
    LtInt(i64),
    LteInt(i64),
    GtInt(i64),
    GteInt(i64),
}

impl UploadThreshold {
    pub fn passes(self, value: i64) -> bool {
        match self {
            UploadThreshold::LtInt(t) => value < t,
            UploadThreshold::LteInt(t) => value <= t,
            UploadThreshold::GtInt(t) => value > t,
            UploadThreshold::GteInt(t) => value >= t,
        }
    }
}

/// The closed bucket's bounds as computed at flush time.
#[derive(Debug, Clone, Copy)]
pub struct BucketInterval {
    pub start_ns: i64,
    pub end_ns: i64,
    pub bucket_num: i64,
    pub is_partial: bool,
}

impl BucketInterval {
    pub fn span(&self) -> BucketSpan {
        if self.is_partial {
            BucketSpan::Range {
                start_elapsed_ms: ns_to_ms(self.start_ns),
                end_elapsed_ms: ns_to_ms(self.end_ns),
            }
        } else {
            BucketSpan::Num(self.bucket_num)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DropEvent {
    pub reason: BucketDropReason,
    pub drop_time_ns: i64,
}

#[derive(Debug, Clone)]
pub struct SkippedBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub drop_events: Vec<DropEvent>,
}

impl SkippedBucket {
    pub fn to_report(&self) -> SkippedBucketReport {
        SkippedBucketReport {
            start_elapsed_ms: ns_to_ms(self.start_ns),
            end_elapsed_ms: ns_to_ms(self.end_ns),
            drop_events: self
                .drop_events
                .iter()
                .map(|d| DropEventReport {
                    reason: d.reason,
                    drop_time_ms: ns_to_ms(d.drop_time_ns),
                })
                .collect(),
        }
    }
}

/// Builds a link key from event values, re-tagged with the target side's
/// field paths so the key compares equal to keys built by the target.
pub fn build_link_key(
    metric_fields: &[DimensionPath],
    target_fields: &[DimensionPath],
    target_atom: u32,
    values: &[FieldValue],
) -> DimensionKey {
    let mut key = DimensionKey::default();
    for (mpath, tpath) in metric_fields.iter().zip(target_fields.iter()) {
        if let Some(fv) = filter_first(mpath, values) {
            let path: Vec<PathElem> = tpath
                .steps
                .iter()
                .map(|s| PathElem {
                    field: s.field,
                    index: 0,
                })
                .collect();
            key.add_value(FieldValue::new(
                Field {
                    atom_id: target_atom,
                    path,
                },
                fv.value,
            ));
        }
    }
    key
}

/// Everything a producer needs at construction, shared by all variants.
pub struct ProducerSpec {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub condition_index: Option<usize>,
    pub initial_condition: ConditionState,
    pub condition_links: Vec<MetricConditionLink>,
    /// True when the link fields cover every dimension of the condition;
    /// partial-match queries are then disallowed.
    pub has_links_to_all_condition_dimensions: bool,
    pub state_links: Vec<MetricStateLink>,
    pub sliced_state_atoms: Vec<u32>,
    pub state_group_map: HashMap<u32, HashMap<i32, i64>>,
    pub dimensions_in_what: DimensionSpec,
    pub activations: HashMap<usize, Activation>,
    /// Deactivation matcher index to the activation matcher indices it clears.
    pub deactivations: HashMap<usize, Vec<usize>>,
    pub split_bucket_on_app_upgrade: bool,
    pub dimension_hard_limit: usize,
    pub sampled_what_field: Option<DimensionPath>,
    pub shard_count: u32,
    pub shard_offset: u32,
    pub upload_threshold: Option<UploadThreshold>,
    pub stats: Arc<EngineStats>,
}

/// Per-metric state common to every producer variant: bucket clock,
/// condition cache, activation lifecycle, guardrails.
pub struct ProducerCore {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub current_bucket_start_ns: i64,
    pub current_bucket_num: i64,
    pub condition_index: Option<usize>,
    pub condition: ConditionState,
    pub condition_sliced: bool,
    pub condition_links: Vec<MetricConditionLink>,
    pub has_links_to_all_condition_dimensions: bool,
    pub state_links: Vec<MetricStateLink>,
    pub sliced_state_atoms: Vec<u32>,
    pub state_group_map: HashMap<u32, HashMap<i32, i64>>,
    pub dimensions_in_what: DimensionSpec,
    pub use_nested_dimensions: bool,
    pub activations: HashMap<usize, Activation>,
    pub deactivations: HashMap<usize, Vec<usize>>,
    pub is_active: bool,
    pub split_bucket_on_app_upgrade: bool,
    pub condition_timer: ConditionTimer,
    pub dimension_soft_limit: usize,
    pub dimension_hard_limit: usize,
    pub dimension_guardrail_hit: bool,
    has_hit_guardrail: bool,
    pub upload_threshold: Option<UploadThreshold>,
    pub sampled_what_field: Option<DimensionPath>,
    pub shard_count: u32,
    pub shard_offset: u32,
    current_drop_events: Vec<DropEvent>,
    pub skipped_buckets: Vec<SkippedBucket>,
    pub stats: Arc<EngineStats>,
}

impl ProducerCore {
    /// `start_time_ns` may lie past `time_base_ns` (late creation): the first
    /// bucket is then a partial one starting at creation.
    pub fn new(spec: ProducerSpec, start_time_ns: i64) -> Self {
        let condition_sliced = !spec.condition_links.is_empty();
        let is_active = spec.activations.is_empty();
        let elapsed = (start_time_ns - spec.time_base_ns).max(0);
        let current_bucket_num = elapsed / spec.bucket_size_ns;
        let condition_true = is_active
            && spec.condition_index.is_some()
            && spec.initial_condition == ConditionState::True;
        let use_nested_dimensions = spec.dimensions_in_what.has_all_position();

        Self {
            metric_id: spec.metric_id,
            config_key: spec.config_key,
            time_base_ns: spec.time_base_ns,
            bucket_size_ns: spec.bucket_size_ns,
            current_bucket_start_ns: start_time_ns,
            current_bucket_num,
            condition_index: spec.condition_index,
            condition: spec.initial_condition,
            condition_sliced,
            condition_links: spec.condition_links,
            has_links_to_all_condition_dimensions: spec.has_links_to_all_condition_dimensions,
            state_links: spec.state_links,
            sliced_state_atoms: spec.sliced_state_atoms,
            state_group_map: spec.state_group_map,
            dimensions_in_what: spec.dimensions_in_what,
            use_nested_dimensions,
            activations: spec.activations,
            deactivations: spec.deactivations,
            is_active,
            split_bucket_on_app_upgrade: spec.split_bucket_on_app_upgrade,
            condition_timer: ConditionTimer::new(condition_true, start_time_ns),
            dimension_soft_limit: DIMENSION_KEY_SOFT_LIMIT,
            dimension_hard_limit: spec.dimension_hard_limit,
            dimension_guardrail_hit: false,
            has_hit_guardrail: false,
            upload_threshold: spec.upload_threshold,
            sampled_what_field: spec.sampled_what_field,
            shard_count: spec.shard_count,
            shard_offset: spec.shard_offset,
            current_drop_events: Vec::new(),
            skipped_buckets: Vec::new(),
            stats: spec.stats,
        }
    }

    /// End of the current bucket on the time-base grid, regardless of any
    /// mid-bucket split that moved the start.
    pub fn current_bucket_end_ns(&self) -> i64 {
        self.time_base_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
    }

    /// Decays expired activations and reports whether any keeps the metric
    /// active. A metric without activations is always active.
    pub fn evaluate_active_state(&mut self, now_ns: i64) -> bool {
        let mut is_active = self.activations.is_empty();
        for activation in self.activations.values_mut() {
            if activation.state == ActivationState::Active
                && now_ns > activation.start_ns + activation.ttl_ns
            {
                activation.state = ActivationState::NotActive;
            }
            is_active |= activation.state == ActivationState::Active;
        }
        is_active
    }

    /// Field numbers of the flat dimension path, for the report header.
    pub fn dimension_path_fields(&self) -> Option<Vec<u32>> {
        if self.use_nested_dimensions || self.dimensions_in_what.is_empty() {
            return None;
        }
        Some(
            self.dimensions_in_what
                .paths
                .iter()
                .filter_map(|p| p.steps.last().map(|s| s.field))
                .collect(),
        )
    }

    /// Applies the atom's group map to a raw state value. Values outside the
    /// map collapse to `STATE_UNKNOWN`.
    pub fn map_state_value(&self, atom_id: u32, value: Value) -> Value {
        let Some(groups) = self.state_group_map.get(&atom_id) else {
            return value;
        };
        match value.int_value().and_then(|v| groups.get(&v)) {
            Some(group_id) => Value::Long(*group_id),
            None => Value::Int(STATE_UNKNOWN),
        }
    }

    /// Guardrail check before inserting `current_size + 1`-th dimension key.
    /// Returns true when the event must be dropped.
    pub fn hit_dimension_guardrail(&mut self, current_size: usize, drop_time_ns: i64) -> bool {
        if current_size < self.dimension_soft_limit {
            return false;
        }
        let new_count = current_size + 1;
        self.stats
            .note_metric_dimension_size(self.metric_id, new_count);
        if new_count <= self.dimension_hard_limit {
            return false;
        }
        if !self.has_hit_guardrail {
            error!(
                metric_id = self.metric_id,
                limit = self.dimension_hard_limit,
                "dimension hard limit reached, dropping data",
            );
            self.has_hit_guardrail = true;
            self.stats.note_hard_dimension_limit_reached(self.metric_id);
        }
        self.dimension_guardrail_hit = true;
        self.add_drop_event(BucketDropReason::DimensionGuardrailReached, drop_time_ns);
        true
    }

    pub fn add_drop_event(&mut self, reason: BucketDropReason, drop_time_ns: i64) {
        if self.current_drop_events.len() < MAX_LOGGED_BUCKET_DROP_EVENTS {
            self.current_drop_events.push(DropEvent {
                reason,
                drop_time_ns,
            });
        }
    }

    /// Closes the current bucket: computes its bounds, rolls the condition
    /// timer, archives drop events, and moves the bucket start forward.
    /// The bucket number is advanced separately by `flush_if_needed`.
    pub fn finish_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) -> (BucketInterval, i64, i64) {
        let full_end = self.current_bucket_end_ns();
        let end_ns = event_ts_ns.min(full_end);
        let interval = BucketInterval {
            start_ns: self.current_bucket_start_ns,
            end_ns,
            bucket_num: self.current_bucket_num,
            is_partial: end_ns - self.current_bucket_start_ns != self.bucket_size_ns,
        };

        let (condition_true_ns, correction_ns) = self
            .condition_timer
            .new_bucket_start(event_ts_ns, next_bucket_start_ns);

        if !self.current_drop_events.is_empty() {
            self.skipped_buckets.push(SkippedBucket {
                start_ns: interval.start_ns,
                end_ns: interval.end_ns,
                drop_events: std::mem::take(&mut self.current_drop_events),
            });
        }

        self.stats.note_bucket_count(self.metric_id);
        self.current_bucket_start_ns = next_bucket_start_ns;
        self.has_hit_guardrail = false;
        (interval, condition_true_ns, correction_ns)
    }

    /// Whether this metric reports per-bucket condition-true time. Per-slice
    /// condition timing has no defined semantics, so state- or
    /// condition-sliced metrics do not report it.
    pub fn reports_condition_true_ns(&self) -> bool {
        self.condition_index.is_some()
            && !self.condition_sliced
            && self.sliced_state_atoms.is_empty()
    }

    /// Persists still-live activations, or None when there is nothing to save.
    pub fn write_activation_snapshot(
        &self,
        now_ns: i64,
        reason: DumpReason,
    ) -> Option<ActiveMetricSnapshot> {
        if self.activations.is_empty() {
            return None;
        }
        let mut activations = Vec::new();
        for (&matcher_index, activation) in &self.activations {
            match activation.state {
                ActivationState::NotActive => continue,
                ActivationState::Active => {
                    let remaining = activation.start_ns + activation.ttl_ns - now_ns;
                    if remaining < 0 {
                        continue;
                    }
                    activations.push(ActivationSnapshot {
                        matcher_index,
                        remaining_ttl_ns: remaining,
                        state: ActivationState::Active,
                    });
                }
                ActivationState::ActiveOnBoot => match reason {
                    DumpReason::DeviceShutdown | DumpReason::TerminationSignal => {
                        activations.push(ActivationSnapshot {
                            matcher_index,
                            remaining_ttl_ns: activation.ttl_ns,
                            state: ActivationState::Active,
                        });
                    }
                    DumpReason::SupervisorDied => {
                        // Saved because the supervisor died, not a reboot: do
                        // not promote on next load.
                        activations.push(ActivationSnapshot {
                            matcher_index,
                            remaining_ttl_ns: 0,
                            state: ActivationState::ActiveOnBoot,
                        });
                    }
                    _ => {}
                },
            }
        }
        if activations.is_empty() {
            return None;
        }
        activations.sort_by_key(|a| a.matcher_index);
        Some(ActiveMetricSnapshot {
            metric_id: self.metric_id,
            activations,
        })
    }

    /// Restores activations from a snapshot, arranging
    /// `start + ttl == now + remaining_ttl`.
    pub fn load_activation_snapshot(&mut self, snapshot: &ActiveMetricSnapshot, now_ns: i64) {
        if self.activations.is_empty() {
            if !snapshot.activations.is_empty() {
                warn!(
                    metric_id = self.metric_id,
                    "snapshot carries activations for a metric with none configured, ignoring",
                );
            }
            return;
        }
        for saved in &snapshot.activations {
            let Some(activation) = self.activations.get_mut(&saved.matcher_index) else {
                warn!(
                    metric_id = self.metric_id,
                    matcher_index = saved.matcher_index,
                    "saved activation not found",
                );
                continue;
            };
            match saved.state {
                ActivationState::Active => {
                    activation.start_ns = now_ns + saved.remaining_ttl_ns - activation.ttl_ns;
                    activation.state = ActivationState::Active;
                    self.is_active = true;
                }
                ActivationState::ActiveOnBoot => {
                    activation.state = ActivationState::ActiveOnBoot;
                }
                ActivationState::NotActive => {}
            }
        }
    }

    pub fn skipped_reports(&self) -> Vec<SkippedBucketReport> {
        self.skipped_buckets.iter().map(SkippedBucket::to_report).collect()
    }
}

/// One metric's aggregation pipeline. Variants implement the aggregation
/// hooks; the per-event pipeline, bucket rotation, and activation lifecycle
/// are shared provided methods over `ProducerCore`.
pub trait MetricProducer: Send {
    fn core(&self) -> &ProducerCore;
    fn core_mut(&mut self) -> &mut ProducerCore;

    /// Variant aggregation for one matched event on one dimension key.
    fn update(
        &mut self,
        matcher_index: usize,
        key: MetricDimensionKey,
        event: &AtomEvent,
        condition: bool,
    );

    /// Closes the current bucket into the past-bucket store.
    fn flush_current_bucket(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64);

    /// Conservative upper bound on retained bytes.
    fn byte_size(&self) -> usize;

    /// Produces this metric's report section, optionally erasing past data.
    fn dump_report(
        &mut self,
        dump_ts_ns: i64,
        include_partial: bool,
        erase_data: bool,
        reason: DumpReason,
        pool: &mut StringPool,
    ) -> MetricReport;

    /// Advances buckets then discards past buckets (failed upload path).
    fn drop_data(&mut self, drop_ts_ns: i64);

    /// A subscribed state atom changed for `primary_key`.
    fn on_state_changed(
        &mut self,
        event_ts_ns: i64,
        atom_id: u32,
        primary_key: &DimensionKey,
        old: &Value,
        new: &Value,
    ) {
        trace!(
            metric_id = self.core().metric_id,
            atom_id,
            key = %primary_key,
            %old,
            %new,
            ts = event_ts_ns,
            "state changed",
        );
    }

    /// A subscribed unsliced condition flipped.
    fn on_condition_changed(&mut self, new_state: ConditionState, event_ts_ns: i64) {
        self.flush_if_needed(event_ts_ns);
        let core = self.core_mut();
        core.condition = new_state;
        if !core.is_active {
            return;
        }
        core.condition_timer
            .on_condition_changed(new_state.is_true(), event_ts_ns);
    }

    /// A subscribed sliced condition may have changed for some keys; the
    /// producer re-queries per slice as needed.
    fn on_sliced_condition_may_change(&mut self, event_ts_ns: i64, _conditions: &dyn ConditionLookup) {
        let _ = event_ts_ns;
    }

    /// Active state flipped; splits the current bucket at the transition.
    fn on_active_state_changed(&mut self, event_ts_ns: i64, is_active: bool) {
        self.split_bucket(event_ts_ns);
        let core = self.core_mut();
        if core.condition.is_true() {
            core.condition_timer.on_condition_changed(is_active, event_ts_ns);
        }
    }

    fn is_active(&self) -> bool {
        self.core().is_active
    }

    /// Splits the current bucket at `ts` without advancing the bucket grid.
    /// A split point past the bucket end is an ordinary rotation.
    fn split_bucket(&mut self, event_ts_ns: i64) {
        if event_ts_ns <= self.core().current_bucket_start_ns {
            return;
        }
        if event_ts_ns >= self.core().current_bucket_end_ns() {
            self.flush_if_needed(event_ts_ns);
            return;
        }
        self.flush_current_bucket(event_ts_ns, event_ts_ns);
    }

    /// Rotates buckets when `ts` crosses the current bucket end.
    fn flush_if_needed(&mut self, event_ts_ns: i64) {
        let end = self.core().current_bucket_end_ns();
        if event_ts_ns < end {
            return;
        }
        let size = self.core().bucket_size_ns;
        let num_buckets_forward = 1 + (event_ts_ns - end) / size;
        let next_bucket_start = end + (num_buckets_forward - 1) * size;
        self.flush_current_bucket(event_ts_ns, next_bucket_start);
        self.core_mut().current_bucket_num += num_buckets_forward;
    }

    /// External rotation/TTL kick, e.g. from a periodic alarm.
    fn flush_if_expired(&mut self, now_ns: i64) {
        if self.core().is_active && !self.core().activations.is_empty() {
            let still_active = self.core_mut().evaluate_active_state(now_ns);
            if !still_active {
                self.on_active_state_changed(now_ns, false);
                self.core_mut().is_active = false;
                return;
            }
        }
        self.flush_if_needed(now_ns);
    }

    /// An activation matcher fired.
    fn activate(&mut self, activation_matcher_index: usize, now_ns: i64) {
        let core = self.core_mut();
        let Some(activation) = core.activations.get_mut(&activation_matcher_index) else {
            return;
        };
        if activation.kind == ActivationKind::OnBoot {
            if activation.state == ActivationState::NotActive {
                activation.state = ActivationState::ActiveOnBoot;
            }
            return;
        }
        activation.start_ns = now_ns;
        activation.state = ActivationState::Active;
        if !core.is_active {
            // Flip before the hook so pulls triggered by the transition land
            // inside the active window.
            core.is_active = true;
            self.on_active_state_changed(now_ns, true);
        }
    }

    /// A deactivation matcher fired: clears the listed activations.
    fn cancel_activations(&mut self, deactivation_matcher_index: usize, now_ns: i64) {
        let core = self.core_mut();
        let Some(targets) = core.deactivations.get(&deactivation_matcher_index).cloned() else {
            return;
        };
        for idx in targets {
            if let Some(activation) = core.activations.get_mut(&idx) {
                activation.state = ActivationState::NotActive;
            }
        }
        if core.is_active && !core.evaluate_active_state(now_ns) {
            self.on_active_state_changed(now_ns, false);
            self.core_mut().is_active = false;
        }
    }

    /// App upgrade notification; splits the bucket when configured to.
    fn notify_app_upgrade(&mut self, event_ts_ns: i64) {
        if self.core().split_bucket_on_app_upgrade {
            self.split_bucket(event_ts_ns);
        }
    }

    /// The common per-event pipeline: activity, clock sanity, sampling,
    /// condition and state resolution, dimension extraction, rotation, then
    /// the variant `update` per extracted key.
    fn on_matched_event(
        &mut self,
        matcher_index: usize,
        event: &AtomEvent,
        conditions: &dyn ConditionLookup,
        states: &dyn StateLookup,
    ) {
        let ts = event.elapsed_ts_ns;

        if self.core().is_active && !self.core().activations.is_empty() {
            let still_active = self.core_mut().evaluate_active_state(ts);
            if !still_active {
                self.on_active_state_changed(ts, false);
                self.core_mut().is_active = false;
            }
        }
        if !self.core().is_active {
            return;
        }
        // Pre-epoch event: the clock was reset or this is replayed history.
        if ts < self.core().time_base_ns {
            return;
        }

        let (condition, state_key, dim_keys) = {
            let core = self.core();

            if core.shard_count > 1 {
                if let Some(path) = &core.sampled_what_field {
                    if let Some(sampled) = filter_first(path, &event.values) {
                        if !should_keep_sample(&sampled, core.shard_offset, core.shard_count) {
                            return;
                        }
                    }
                }
            }

            let condition = if core.condition_sliced {
                let mut link_key = DimensionKey::default();
                for link in &core.condition_links {
                    let partial =
                        build_link_key(&link.metric_fields, &link.condition_fields, 0, &event.values);
                    for v in partial.values() {
                        link_key.add_value(v.clone());
                    }
                }
                let index = core.condition_index.unwrap_or(0);
                conditions
                    .query(
                        index,
                        &link_key,
                        !core.has_links_to_all_condition_dimensions,
                    )
                    .is_true()
            } else {
                core.condition.is_true()
            };

            let mut state_key = DimensionKey::default();
            for &atom_id in &core.sliced_state_atoms {
                let query_key = core
                    .state_links
                    .iter()
                    .find(|l| l.state_atom_id == atom_id)
                    .map(|l| build_link_key(&l.metric_fields, &l.state_fields, atom_id, &event.values))
                    .unwrap_or_default();
                let raw = states
                    .state_value(atom_id, &query_key)
                    .unwrap_or(Value::Int(STATE_UNKNOWN));
                let mapped = core.map_state_value(atom_id, raw);
                state_key.add_value(FieldValue::new(
                    Field {
                        atom_id,
                        path: Vec::new(),
                    },
                    mapped,
                ));
            }

            let dim_keys = extract_dimension_keys(&core.dimensions_in_what, &event.values);
            (condition, state_key, dim_keys)
        };

        self.flush_if_needed(ts);

        for dim_key in dim_keys {
            let key = MetricDimensionKey::new(dim_key, state_key.clone());
            self.update(matcher_index, key, event, condition);
        }
    }

    /// Persisted activation state, when any activation is live.
    fn write_activation_snapshot(
        &self,
        now_ns: i64,
        reason: DumpReason,
    ) -> Option<ActiveMetricSnapshot> {
        self.core().write_activation_snapshot(now_ns, reason)
    }

    fn load_activation_snapshot(&mut self, snapshot: &ActiveMetricSnapshot, now_ns: i64) {
        self.core_mut().load_activation_snapshot(snapshot, now_ns);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub const SECOND_NS: i64 = 1_000_000_000;
    pub const MINUTE_NS: i64 = 60 * SECOND_NS;

    /// A minimal spec: one-minute buckets from time base zero, no condition
    /// (which means condition-true), no states, no activations.
    pub fn base_spec(metric_id: i64) -> ProducerSpec {
        ProducerSpec {
            metric_id,
            config_key: ConfigKey::new(0, 1),
            time_base_ns: 0,
            bucket_size_ns: MINUTE_NS,
            condition_index: None,
            initial_condition: ConditionState::True,
            condition_links: Vec::new(),
            has_links_to_all_condition_dimensions: false,
            state_links: Vec::new(),
            sliced_state_atoms: Vec::new(),
            state_group_map: HashMap::new(),
            dimensions_in_what: DimensionSpec::default(),
            activations: HashMap::new(),
            deactivations: HashMap::new(),
            split_bucket_on_app_upgrade: true,
            dimension_hard_limit: crate::guardrail::DIMENSION_HARD_LIMIT_MIN,
            sampled_what_field: None,
            shard_count: 0,
            shard_offset: 0,
            upload_threshold: None,
            stats: Arc::new(EngineStats::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_bucket_end_stays_on_grid_after_split() {
        let mut core = ProducerCore::new(base_spec(1), 0);
        assert_eq!(core.current_bucket_end_ns(), MINUTE_NS);

        // Mid-bucket split at 30s: start moves, end does not.
        core.finish_bucket(30 * SECOND_NS, 30 * SECOND_NS);
        assert_eq!(core.current_bucket_start_ns, 30 * SECOND_NS);
        assert_eq!(core.current_bucket_end_ns(), MINUTE_NS);
    }

    #[test]
    fn test_finish_bucket_marks_partial() {
        let mut core = ProducerCore::new(base_spec(1), 0);
        let (interval, _, _) = core.finish_bucket(30 * SECOND_NS, 30 * SECOND_NS);
        assert!(interval.is_partial);
        assert_eq!(interval.start_ns, 0);
        assert_eq!(interval.end_ns, 30 * SECOND_NS);

        let (interval, _, _) = core.finish_bucket(70 * SECOND_NS, MINUTE_NS);
        assert!(interval.is_partial);
        assert_eq!(interval.end_ns, MINUTE_NS);
    }

    #[test]
    fn test_full_bucket_interval() {
        let mut core = ProducerCore::new(base_spec(1), 0);
        let (interval, _, _) = core.finish_bucket(MINUTE_NS, MINUTE_NS);
        assert!(!interval.is_partial);
        assert_eq!(interval.span(), BucketSpan::Num(0));
    }

    #[test]
    fn test_late_creation_starts_partial_bucket() {
        let core = ProducerCore::new(base_spec(1), 90 * SECOND_NS);
        assert_eq!(core.current_bucket_num, 1);
        assert_eq!(core.current_bucket_start_ns, 90 * SECOND_NS);
        assert_eq!(core.current_bucket_end_ns(), 2 * MINUTE_NS);
    }

    #[test]
    fn test_activation_ttl_decay() {
        let mut spec = base_spec(1);
        spec.activations.insert(
            0,
            Activation::new(ActivationKind::Immediate, 100 * SECOND_NS),
        );
        let mut core = ProducerCore::new(spec, 0);
        assert!(!core.is_active);

        core.activations.get_mut(&0).expect("slot").state = ActivationState::Active;
        core.activations.get_mut(&0).expect("slot").start_ns = 10 * SECOND_NS;
        assert!(core.evaluate_active_state(50 * SECOND_NS));
        assert!(!core.evaluate_active_state(111 * SECOND_NS));
        // Decay is sticky.
        assert_eq!(
            core.activations.get(&0).expect("slot").state,
            ActivationState::NotActive
        );
    }

    #[test]
    fn test_guardrail_drop_and_latch() {
        let mut spec = base_spec(42);
        spec.dimension_hard_limit = 800;
        let stats = Arc::clone(&spec.stats);
        let mut core = ProducerCore::new(spec, 0);

        // Below the soft limit nothing happens.
        assert!(!core.hit_dimension_guardrail(10, 0));
        // Past the soft limit, still under hard: tracked but not dropped.
        assert!(!core.hit_dimension_guardrail(600, 0));
        // At the hard limit the insertion is refused.
        assert!(core.hit_dimension_guardrail(800, 5));
        assert!(core.dimension_guardrail_hit);
        assert_eq!(stats.hard_dimension_limit_count(42), 1);
        // Latch: counted once per bucket.
        assert!(core.hit_dimension_guardrail(800, 6));
        assert_eq!(stats.hard_dimension_limit_count(42), 1);

        // Rotation resets the latch.
        core.finish_bucket(MINUTE_NS, MINUTE_NS);
        assert!(core.hit_dimension_guardrail(800, 7));
        assert_eq!(stats.hard_dimension_limit_count(42), 2);
        // Drop events archived with the closed bucket, capped later.
        assert_eq!(core.skipped_buckets.len(), 1);
        assert_eq!(core.skipped_buckets[0].drop_events.len(), 2);
    }

    #[test]
    fn test_state_group_mapping() {
        let mut spec = base_spec(1);
        let mut groups = HashMap::new();
        groups.insert(2, 100i64);
        groups.insert(3, 100i64);
        spec.state_group_map.insert(29, groups);
        let core = ProducerCore::new(spec, 0);

        assert_eq!(core.map_state_value(29, Value::Int(2)), Value::Long(100));
        assert_eq!(core.map_state_value(29, Value::Int(3)), Value::Long(100));
        assert_eq!(
            core.map_state_value(29, Value::Int(9)),
            Value::Int(STATE_UNKNOWN)
        );
        // No map for the atom: value passes through.
        assert_eq!(core.map_state_value(30, Value::Int(9)), Value::Int(9));
    }

    #[test]
    fn test_snapshot_skips_dead_activations() {
        let mut spec = base_spec(1);
        spec.activations
            .insert(0, Activation::new(ActivationKind::Immediate, 100));
        spec.activations
            .insert(1, Activation::new(ActivationKind::Immediate, 100));
        let mut core = ProducerCore::new(spec, 0);
        core.activations.get_mut(&0).expect("slot").state = ActivationState::Active;
        core.activations.get_mut(&0).expect("slot").start_ns = 50;

        let snap = core
            .write_activation_snapshot(100, DumpReason::DeviceShutdown)
            .expect("live activation saved");
        assert_eq!(snap.activations.len(), 1);
        assert_eq!(snap.activations[0].matcher_index, 0);
        assert_eq!(snap.activations[0].remaining_ttl_ns, 50);
    }

    #[test]
    fn test_snapshot_on_boot_depends_on_reason() {
        let mut spec = base_spec(1);
        spec.activations
            .insert(0, Activation::new(ActivationKind::OnBoot, 100));
        let mut core = ProducerCore::new(spec, 0);
        core.activations.get_mut(&0).expect("slot").state = ActivationState::ActiveOnBoot;

        let snap = core
            .write_activation_snapshot(10, DumpReason::DeviceShutdown)
            .expect("saved");
        assert_eq!(snap.activations[0].state, ActivationState::Active);
        assert_eq!(snap.activations[0].remaining_ttl_ns, 100);

        let snap = core
            .write_activation_snapshot(10, DumpReason::SupervisorDied)
            .expect("saved");
        assert_eq!(snap.activations[0].state, ActivationState::ActiveOnBoot);
    }

    #[test]
    fn test_load_snapshot_restores_ttl_arithmetic() {
        let mut spec = base_spec(1);
        spec.activations
            .insert(0, Activation::new(ActivationKind::Immediate, 100));
        let mut core = ProducerCore::new(spec, 0);

        core.load_activation_snapshot(
            &ActiveMetricSnapshot {
                metric_id: 1,
                activations: vec![ActivationSnapshot {
                    matcher_index: 0,
                    remaining_ttl_ns: 40,
                    state: ActivationState::Active,
                }],
            },
            1_000,
        );
        assert!(core.is_active);
        let a = core.activations.get(&0).expect("slot");
        // start + ttl == now + remaining.
        assert_eq!(a.start_ns + a.ttl_ns, 1_040);
    }

    #[test]
    fn test_load_snapshot_into_unconfigured_metric_is_ignored() {
        let mut core = ProducerCore::new(base_spec(1), 0);
        assert!(core.is_active);
        core.load_activation_snapshot(
            &ActiveMetricSnapshot {
                metric_id: 1,
                activations: vec![ActivationSnapshot {
                    matcher_index: 0,
                    remaining_ttl_ns: 40,
                    state: ActivationState::Active,
                }],
            },
            1_000,
        );
        assert!(core.activations.is_empty());
        assert!(core.is_active);
    }
}
