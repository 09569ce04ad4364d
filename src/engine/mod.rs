use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::condition::{ConditionGraph, ConditionState, SimpleConditionSpec};
use crate::config::{MetricKind, TelemetryConfig};
use crate::event::{AtomEvent, Value};
use crate::guardrail::{
    clamp_dimension_hard_limit, ConfigKey, EngineStats, InvalidConfigCode, InvalidConfigReason,
};
use crate::metrics::activation::{Activation, ActiveMetricSnapshot};
use crate::metrics::anomaly::{AlertSpec, AnomalyTracker};
use crate::metrics::count::CountMetricProducer;
use crate::metrics::duration::DurationMetricProducer;
use crate::metrics::event::EventMetricProducer;
use crate::metrics::gauge::GaugeMetricProducer;
use crate::metrics::histogram::HistogramMetricProducer;
use crate::metrics::value::{ValueField, ValueMetricProducer};
use crate::metrics::{MetricConditionLink, MetricProducer, MetricStateLink, ProducerSpec};
use crate::pull::{PullDataReceiver, PullResult, PullScheduler};
use crate::report::{BucketDropReason, ConfigReport, DumpReason, Report, StringPool};
use crate::state::{StateAtomSpec, StateChange, StateManager};
use crate::uid::UidMap;

/// How many events pass between byte-budget checks per config.
const BYTE_BUDGET_CHECK_EVERY: u64 = 128;

/// Reference front-end matcher: atom id plus optional field equalities.
/// The real classification front end is out of scope; this is the interface
/// the engine consumes.
#[derive(Debug, Clone)]
pub struct SimpleAtomMatcher {
    pub id: i64,
    pub atom_id: u32,
    pub field_eq: Vec<(u32, Value)>,
}

impl SimpleAtomMatcher {
    pub fn matches(&self, event: &AtomEvent) -> bool {
        event.atom_id == self.atom_id
            && self
                .field_eq
                .iter()
                .all(|(field, want)| event.value_at(*field) == Some(want))
    }
}

/// All metric machinery belonging to one config: matchers, the condition
/// graph, and the producers with their routing tables.
pub struct MetricsManager {
    pub config_key: ConfigKey,
    byte_budget: usize,
    matchers: Vec<SimpleAtomMatcher>,
    conditions: Arc<Mutex<ConditionGraph>>,
    producers: Vec<Arc<Mutex<dyn MetricProducer>>>,
    metric_ids: Vec<i64>,
    tracker_to_metrics: HashMap<usize, Vec<usize>>,
    condition_to_metrics: HashMap<usize, Vec<usize>>,
    activation_tracker_to_metrics: HashMap<usize, Vec<usize>>,
    deactivation_tracker_to_metrics: HashMap<usize, Vec<usize>>,
    state_atom_to_metrics: HashMap<u32, Vec<usize>>,
    /// Keeps pull receiver adapters alive; the scheduler holds weak refs.
    #[allow(dead_code)]
    pull_receivers: Vec<Arc<dyn PullDataReceiver>>,
    events_seen: AtomicU64,
    stats: Arc<EngineStats>,
}

impl MetricsManager {
    /// Routes one event through conditions, states, activations, and the
    /// subscribed producers. Lock order: StateManager (held by the caller) →
    /// ConditionGraph → each MetricProducer.
    pub fn handle_event(
        &self,
        event: &AtomEvent,
        states: &StateManager,
        state_change: Option<&StateChange>,
    ) {
        let ts = event.elapsed_ts_ns;
        let matched: Vec<bool> = self.matchers.iter().map(|m| m.matches(event)).collect();

        let mut conditions = self.conditions.lock();

        if let Some(change) = state_change {
            if let Some(metrics) = self.state_atom_to_metrics.get(&change.atom_id) {
                for &mi in metrics {
                    self.producers[mi].lock().on_state_changed(
                        ts,
                        change.atom_id,
                        &change.primary_key,
                        &change.old,
                        &change.new,
                    );
                }
            }
        }

        // Condition propagation strictly precedes the metric updates the
        // same event fires.
        let changes = conditions.evaluate_event(&matched, event);
        for change in &changes {
            let Some(metrics) = self.condition_to_metrics.get(&change.index) else {
                continue;
            };
            for &mi in metrics {
                let mut producer = self.producers[mi].lock();
                if change.sliced {
                    producer.on_sliced_condition_may_change(ts, &*conditions);
                } else {
                    producer.on_condition_changed(change.new_state, ts);
                }
            }
        }

        for (idx, hit) in matched.iter().copied().enumerate() {
            if !hit {
                continue;
            }
            if let Some(metrics) = self.activation_tracker_to_metrics.get(&idx) {
                for &mi in metrics {
                    self.producers[mi].lock().activate(idx, ts);
                }
            }
            if let Some(metrics) = self.deactivation_tracker_to_metrics.get(&idx) {
                for &mi in metrics {
                    self.producers[mi].lock().cancel_activations(idx, ts);
                }
            }
            if let Some(metrics) = self.tracker_to_metrics.get(&idx) {
                for &mi in metrics {
                    self.producers[mi]
                        .lock()
                        .on_matched_event(idx, event, &*conditions, states);
                }
            }
        }
        drop(conditions);

        if self.events_seen.fetch_add(1, Ordering::Relaxed) % BYTE_BUDGET_CHECK_EVERY == 0 {
            self.enforce_byte_budget(ts);
        }
    }

    /// Drops retained data when the config exceeds its byte budget.
    fn enforce_byte_budget(&self, now_ns: i64) {
        if self.byte_size() <= self.byte_budget {
            return;
        }
        warn!(
            config = %self.config_key,
            budget = self.byte_budget,
            "byte budget exceeded, dropping retained data",
        );
        self.stats.note_data_dropped(self.config_key);
        for producer in &self.producers {
            let mut producer = producer.lock();
            producer
                .core_mut()
                .add_drop_event(BucketDropReason::DataDropped, now_ns);
            producer.drop_data(now_ns);
        }
    }

    pub fn byte_size(&self) -> usize {
        self.producers.iter().map(|p| p.lock().byte_size()).sum()
    }

    pub fn flush_if_expired(&self, now_ns: i64) {
        for producer in &self.producers {
            producer.lock().flush_if_expired(now_ns);
        }
    }

    pub fn notify_app_upgrade(&self, event_ts_ns: i64) {
        for producer in &self.producers {
            producer.lock().notify_app_upgrade(event_ts_ns);
        }
    }

    pub fn dump_report(
        &self,
        dump_ts_ns: i64,
        include_partial: bool,
        erase_data: bool,
        reason: DumpReason,
        pool: &mut StringPool,
    ) -> ConfigReport {
        ConfigReport {
            key: self.config_key,
            metrics: self
                .producers
                .iter()
                .map(|p| {
                    p.lock()
                        .dump_report(dump_ts_ns, include_partial, erase_data, reason, pool)
                })
                .collect(),
        }
    }

    pub fn drop_data(&self, drop_ts_ns: i64) {
        for producer in &self.producers {
            producer.lock().drop_data(drop_ts_ns);
        }
    }

    fn write_active_snapshots(&self, now_ns: i64, reason: DumpReason) -> Vec<ActiveMetricSnapshot> {
        self.producers
            .iter()
            .filter_map(|p| p.lock().write_activation_snapshot(now_ns, reason))
            .collect()
    }

    fn load_active_snapshots(&self, snapshots: &[ActiveMetricSnapshot], now_ns: i64) {
        for snapshot in snapshots {
            let Some(idx) = self.metric_ids.iter().position(|&id| id == snapshot.metric_id)
            else {
                warn!(
                    config = %self.config_key,
                    metric_id = snapshot.metric_id,
                    "snapshot references an unknown metric",
                );
                continue;
            };
            self.producers[idx]
                .lock()
                .load_activation_snapshot(snapshot, now_ns);
        }
    }
}

/// Feeds pulled atoms into one producer through the ordinary matched-event
/// path, re-stamping event times to the pull time.
struct PullReceiverAdapter {
    matcher_index: usize,
    producer: Weak<Mutex<dyn MetricProducer>>,
    conditions: Weak<Mutex<ConditionGraph>>,
    states: Weak<Mutex<StateManager>>,
}

impl PullDataReceiver for PullReceiverAdapter {
    fn is_pull_needed(&self) -> bool {
        let Some(producer) = self.producer.upgrade() else {
            return false;
        };
        let producer = producer.lock();
        producer.is_active() && producer.core().condition.is_true()
    }

    fn on_data_pulled(&self, events: &[AtomEvent], result: PullResult, elapsed_ts_ns: i64) {
        let Some(producer) = self.producer.upgrade() else {
            return;
        };
        if result != PullResult::Success {
            if result != PullResult::NotNeeded {
                producer
                    .lock()
                    .core_mut()
                    .add_drop_event(BucketDropReason::PullFailed, elapsed_ts_ns);
            }
            return;
        }
        let (Some(states), Some(conditions)) = (self.states.upgrade(), self.conditions.upgrade())
        else {
            return;
        };
        // Same order as the event path: states, conditions, producer.
        let states = states.lock();
        let conditions = conditions.lock();
        let mut producer = producer.lock();
        for event in events {
            let mut event = event.clone();
            event.elapsed_ts_ns = elapsed_ts_ns;
            producer.on_matched_event(self.matcher_index, &event, &*conditions, &*states);
        }
    }
}

/// Persisted activation state across the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub saved_elapsed_ns: i64,
    pub reason: DumpReason,
    pub configs: Vec<ConfigActiveSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigActiveSnapshot {
    pub uid: u32,
    pub id: i64,
    pub metrics: Vec<ActiveMetricSnapshot>,
}

/// The top of the pipeline: owns the global state manager, the uid map, the
/// pull scheduler, and one `MetricsManager` per config.
pub struct TelemetryEngine {
    state_manager: Arc<Mutex<StateManager>>,
    managers: Mutex<BTreeMap<ConfigKey, Arc<MetricsManager>>>,
    uid_map: Arc<UidMap>,
    pull_scheduler: Arc<PullScheduler>,
    stats: Arc<EngineStats>,
}

impl TelemetryEngine {
    pub fn new(stats: Arc<EngineStats>, pull_scheduler: Arc<PullScheduler>) -> Self {
        Self {
            state_manager: Arc::new(Mutex::new(StateManager::new())),
            managers: Mutex::new(BTreeMap::new()),
            uid_map: Arc::new(UidMap::new()),
            pull_scheduler,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn uid_map(&self) -> &Arc<UidMap> {
        &self.uid_map
    }

    pub fn pull_scheduler(&self) -> &Arc<PullScheduler> {
        &self.pull_scheduler
    }

    /// Builds and installs a config. Invalid metrics are discarded
    /// individually; the first rejection reason is recorded with the config
    /// stats and returned.
    pub fn add_config(
        &self,
        config: &TelemetryConfig,
        now_ns: i64,
    ) -> Option<InvalidConfigReason> {
        let key = ConfigKey::new(config.uid, config.id);
        let (manager, rejections) = self.build_manager(config, key, now_ns);
        let first_rejection = rejections.into_iter().next();

        self.stats.note_config_received(
            key,
            now_ns,
            config.metrics.len(),
            config.conditions.len(),
            config.matchers.len(),
            config.alerts.len(),
            first_rejection.clone(),
        );
        info!(
            config = %key,
            metrics = manager.producers.len(),
            matchers = manager.matchers.len(),
            "config installed",
        );
        self.managers.lock().insert(key, Arc::new(manager));
        first_rejection
    }

    pub fn remove_config(&self, key: ConfigKey) {
        if self.managers.lock().remove(&key).is_some() {
            self.stats.note_config_removed(key);
            info!(config = %key, "config removed");
        }
    }

    /// Processes one event through every config. Returns false when nothing
    /// consumed it (advisory, mirrors the ingestion interface).
    pub fn process_event(&self, event: &AtomEvent) -> bool {
        self.stats.note_event_processed();
        let managers: Vec<Arc<MetricsManager>> =
            self.managers.lock().values().cloned().collect();
        if managers.is_empty() {
            return false;
        }
        let mut state_guard = self.state_manager.lock();
        let state_change = state_guard.on_event(event);
        for manager in &managers {
            manager.handle_event(event, &state_guard, state_change.as_ref());
        }
        true
    }

    /// Periodic kick: bucket expiry and activation TTL decay.
    pub fn flush_if_expired(&self, now_ns: i64) {
        for manager in self.managers.lock().values() {
            manager.flush_if_expired(now_ns);
        }
    }

    /// App installed or upgraded: updates the uid map and splits buckets on
    /// upgrades.
    #[allow(clippy::too_many_arguments)]
    pub fn on_app_updated(
        &self,
        ts_ns: i64,
        package: &str,
        uid: i32,
        version: i64,
        version_string: &str,
        installer: &str,
        certificate_hash: &[u8],
    ) {
        let upgraded = self.uid_map.update_app(
            ts_ns,
            package,
            uid,
            version,
            version_string,
            installer,
            certificate_hash,
        );
        if upgraded {
            for manager in self.managers.lock().values() {
                manager.notify_app_upgrade(ts_ns);
            }
        }
    }

    pub fn on_app_removed(&self, ts_ns: i64, package: &str, uid: i32) {
        self.uid_map.remove_app(ts_ns, package, uid);
    }

    /// Assembles the full report tree across configs.
    pub fn dump_report(
        &self,
        dump_ts_ns: i64,
        include_partial: bool,
        erase_data: bool,
        reason: DumpReason,
    ) -> Report {
        let mut pool = StringPool::new();
        let configs: Vec<ConfigReport> = self
            .managers
            .lock()
            .values()
            .map(|m| m.dump_report(dump_ts_ns, include_partial, erase_data, reason, &mut pool))
            .collect();
        Report {
            dump_elapsed_ns: dump_ts_ns,
            reason,
            configs,
            strings: pool.into_entries(),
        }
    }

    /// Discards past buckets everywhere after a failed upload, advancing
    /// bucket clocks first.
    pub fn drop_data(&self, drop_ts_ns: i64) {
        for manager in self.managers.lock().values() {
            manager.drop_data(drop_ts_ns);
        }
    }

    /// Captures the activation state of every config for persistence.
    pub fn save_active_snapshot(&self, now_ns: i64, reason: DumpReason) -> EngineSnapshot {
        let configs = self
            .managers
            .lock()
            .values()
            .filter_map(|m| {
                let metrics = m.write_active_snapshots(now_ns, reason);
                if metrics.is_empty() {
                    None
                } else {
                    Some(ConfigActiveSnapshot {
                        uid: m.config_key.uid,
                        id: m.config_key.id,
                        metrics,
                    })
                }
            })
            .collect();
        EngineSnapshot {
            saved_elapsed_ns: now_ns,
            reason,
            configs,
        }
    }

    /// Restores activation state saved by a previous run.
    pub fn load_active_snapshot(&self, snapshot: &EngineSnapshot, now_ns: i64) {
        let managers = self.managers.lock();
        for config in &snapshot.configs {
            let key = ConfigKey::new(config.uid, config.id);
            let Some(manager) = managers.get(&key) else {
                debug!(config = %key, "snapshot for an unknown config, skipping");
                continue;
            };
            manager.load_active_snapshots(&config.metrics, now_ns);
        }
    }

    pub fn byte_size(&self) -> usize {
        self.managers.lock().values().map(|m| m.byte_size()).sum()
    }

    fn build_manager(
        &self,
        config: &TelemetryConfig,
        key: ConfigKey,
        now_ns: i64,
    ) -> (MetricsManager, Vec<InvalidConfigReason>) {
        let mut rejections = Vec::new();

        let matchers: Vec<SimpleAtomMatcher> = config
            .matchers
            .iter()
            .map(|m| SimpleAtomMatcher {
                id: m.id,
                atom_id: m.atom_id,
                field_eq: m.field_eq.iter().map(|f| (f.field, f.value.clone())).collect(),
            })
            .collect();
        let matcher_index: HashMap<i64, usize> =
            matchers.iter().enumerate().map(|(i, m)| (m.id, i)).collect();

        // Simple conditions first, combinations appended after, children
        // resolved against everything already placed.
        let mut condition_index: HashMap<i64, usize> = HashMap::new();
        let mut simples: Vec<SimpleConditionSpec> = Vec::new();
        for cond in config.conditions.iter().filter(|c| c.combination.is_none()) {
            let resolve = |id: Option<i64>| id.and_then(|id| matcher_index.get(&id).copied());
            simples.push(SimpleConditionSpec {
                start_matcher: resolve(cond.start),
                stop_matcher: resolve(cond.stop),
                stop_all_matcher: resolve(cond.stop_all),
                count_nesting: cond.count_nesting,
                output_dimensions: cond.dimensions.clone(),
                initial_value: if cond.initial_value_unknown {
                    ConditionState::Unknown
                } else {
                    ConditionState::False
                },
            });
            condition_index.insert(cond.id, simples.len() - 1);
        }
        let mut combinations = Vec::new();
        for cond in config.conditions.iter().filter(|c| c.combination.is_some()) {
            let combo = cond.combination.as_ref().unwrap_or_else(|| unreachable!());
            let mut children = Vec::new();
            let mut missing = false;
            for child_id in &combo.children {
                match condition_index.get(child_id) {
                    Some(&idx) => children.push(idx),
                    None => {
                        rejections.push(
                            InvalidConfigReason::new(InvalidConfigCode::ConditionChildNotDefined)
                                .with_condition(cond.id)
                                .with_condition(*child_id),
                        );
                        missing = true;
                    }
                }
            }
            if missing {
                continue;
            }
            condition_index.insert(cond.id, simples.len() + combinations.len());
            combinations.push((combo.op, children));
        }
        let conditions = Arc::new(Mutex::new(ConditionGraph::new(simples, combinations)));

        // States register globally so one tracker serves every config.
        {
            let mut state_manager = self.state_manager.lock();
            for state in &config.states {
                state_manager.register(StateAtomSpec {
                    atom_id: state.atom_id,
                    primary_fields: state.primary_fields.clone(),
                    value_field: state.value_field,
                });
            }
        }
        let state_atoms: HashMap<u32, &crate::config::StateConfig> =
            config.states.iter().map(|s| (s.atom_id, s)).collect();

        let mut producers: Vec<Arc<Mutex<dyn MetricProducer>>> = Vec::new();
        let mut metric_ids: Vec<i64> = Vec::new();
        let mut tracker_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut condition_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut activation_tracker_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut deactivation_tracker_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut state_atom_to_metrics: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut pull_receivers: Vec<Arc<dyn PullDataReceiver>> = Vec::new();

        'metric: for metric in &config.metrics {
            if metric_ids.contains(&metric.id) {
                rejections.push(InvalidConfigReason::for_metric(
                    InvalidConfigCode::DuplicateMetricId,
                    metric.id,
                ));
                continue;
            }
            let Some(&what_index) = matcher_index.get(&metric.what) else {
                rejections.push(
                    InvalidConfigReason::for_metric(InvalidConfigCode::MetricMissingWhat, metric.id)
                        .with_matcher(metric.what),
                );
                continue;
            };
            let what_atom = matchers[what_index].atom_id;

            let cond_idx = match metric.condition {
                None => None,
                Some(id) => match condition_index.get(&id) {
                    Some(&idx) => Some(idx),
                    None => {
                        rejections.push(
                            InvalidConfigReason::for_metric(
                                InvalidConfigCode::ConditionNotFound,
                                metric.id,
                            )
                            .with_condition(id),
                        );
                        continue;
                    }
                },
            };

            let mut condition_links = Vec::new();
            for link in &metric.links {
                if !condition_index.contains_key(&link.condition) {
                    rejections.push(
                        InvalidConfigReason::for_metric(
                            InvalidConfigCode::ConditionNotFound,
                            metric.id,
                        )
                        .with_condition(link.condition),
                    );
                    continue 'metric;
                }
                condition_links.push(MetricConditionLink {
                    metric_fields: link.fields_in_what.clone(),
                    condition_fields: link.fields_in_condition.clone(),
                });
            }
            let has_all_links = !metric.links.is_empty()
                && metric.links.iter().all(|l| l.all_condition_dimensions);

            let mut state_group_map = HashMap::new();
            for &atom_id in &metric.slice_by_state {
                let Some(state) = state_atoms.get(&atom_id) else {
                    rejections.push(
                        InvalidConfigReason::for_metric(InvalidConfigCode::StateNotFound, metric.id)
                            .with_state(atom_id),
                    );
                    continue 'metric;
                };
                if !state.group_map.is_empty() {
                    state_group_map.insert(atom_id, state.group_map.clone());
                }
            }
            let state_links: Vec<MetricStateLink> = metric
                .state_links
                .iter()
                .map(|l| MetricStateLink {
                    state_atom_id: l.state_atom_id,
                    metric_fields: l.fields_in_what.clone(),
                    state_fields: l.fields_in_state.clone(),
                })
                .collect();

            if let Some(sampling) = &metric.sampling {
                if sampling.shard_count > 1 && sampling.shard_offset >= sampling.shard_count {
                    rejections.push(InvalidConfigReason::for_metric(
                        InvalidConfigCode::BadSampling,
                        metric.id,
                    ));
                    continue;
                }
            }

            let mut activations = HashMap::new();
            for activation in &metric.activations {
                let Some(&idx) = matcher_index.get(&activation.matcher) else {
                    rejections.push(
                        InvalidConfigReason::for_metric(
                            InvalidConfigCode::ActivationMatcherNotFound,
                            metric.id,
                        )
                        .with_matcher(activation.matcher),
                    );
                    continue 'metric;
                };
                activations.insert(
                    idx,
                    Activation::new(activation.kind, activation.ttl.as_nanos() as i64),
                );
            }
            let mut deactivations: HashMap<usize, Vec<usize>> = HashMap::new();
            for deactivation in &metric.deactivations {
                let Some(&idx) = matcher_index.get(&deactivation.matcher) else {
                    rejections.push(
                        InvalidConfigReason::for_metric(
                            InvalidConfigCode::ActivationMatcherNotFound,
                            metric.id,
                        )
                        .with_matcher(deactivation.matcher),
                    );
                    continue 'metric;
                };
                let mut targets = Vec::new();
                for target_id in &deactivation.activations {
                    match matcher_index.get(target_id) {
                        Some(&t) if activations.contains_key(&t) => targets.push(t),
                        _ => {
                            rejections.push(
                                InvalidConfigReason::for_metric(
                                    InvalidConfigCode::ActivationMatcherNotFound,
                                    metric.id,
                                )
                                .with_matcher(*target_id),
                            );
                            continue 'metric;
                        }
                    }
                }
                deactivations.insert(idx, targets);
            }

            let spec = ProducerSpec {
                metric_id: metric.id,
                config_key: key,
                time_base_ns: now_ns,
                bucket_size_ns: crate::config::bucket_size_ns(metric.bucket),
                condition_index: cond_idx,
                initial_condition: match cond_idx {
                    // No condition configured means always-true.
                    None => ConditionState::True,
                    Some(idx) => conditions.lock().state(idx),
                },
                condition_links,
                has_links_to_all_condition_dimensions: has_all_links,
                state_links,
                sliced_state_atoms: metric.slice_by_state.clone(),
                state_group_map,
                dimensions_in_what: metric.dimensions.clone().unwrap_or_default(),
                activations,
                deactivations,
                split_bucket_on_app_upgrade: metric.split_bucket_for_app_upgrade,
                dimension_hard_limit: clamp_dimension_hard_limit(
                    what_atom,
                    metric.max_dimensions_per_bucket,
                ),
                sampled_what_field: metric.sampling.as_ref().map(|s| s.field.clone()),
                shard_count: metric.sampling.as_ref().map(|s| s.shard_count).unwrap_or(0),
                shard_offset: metric.sampling.as_ref().map(|s| s.shard_offset).unwrap_or(0),
                upload_threshold: metric.threshold,
                stats: Arc::clone(&self.stats),
            };

            let producer: Arc<Mutex<dyn MetricProducer>> = match metric.kind {
                MetricKind::Count => {
                    let mut producer = CountMetricProducer::new(spec, now_ns);
                    for alert in config.alerts.iter().filter(|a| a.metric == metric.id) {
                        producer.add_anomaly_tracker(AnomalyTracker::new(
                            AlertSpec {
                                alert_id: alert.id,
                                metric_id: metric.id,
                                num_buckets: alert.num_buckets,
                                trigger_if_sum_gt: alert.trigger_if_sum_gt,
                                refractory_period_ns: alert.refractory.as_nanos() as i64,
                            },
                            Arc::clone(&self.stats),
                        ));
                    }
                    Arc::new(Mutex::new(producer))
                }
                MetricKind::Duration => {
                    let Some(stop_id) = metric.stop else {
                        rejections.push(InvalidConfigReason::for_metric(
                            InvalidConfigCode::DurationMatcherPairIncomplete,
                            metric.id,
                        ));
                        continue;
                    };
                    let Some(&stop_index) = matcher_index.get(&stop_id) else {
                        rejections.push(
                            InvalidConfigReason::for_metric(
                                InvalidConfigCode::MatcherNotFound,
                                metric.id,
                            )
                            .with_matcher(stop_id),
                        );
                        continue;
                    };
                    let stop_all_index =
                        metric.stop_all.and_then(|id| matcher_index.get(&id).copied());
                    let producer = DurationMetricProducer::new(
                        spec,
                        now_ns,
                        what_index,
                        stop_index,
                        stop_all_index,
                        metric.nested,
                        metric.aggregation,
                    );
                    let arc: Arc<Mutex<dyn MetricProducer>> = Arc::new(Mutex::new(producer));
                    let idx = producers.len();
                    tracker_to_metrics.entry(stop_index).or_default().push(idx);
                    if let Some(stop_all) = stop_all_index {
                        tracker_to_metrics.entry(stop_all).or_default().push(idx);
                    }
                    arc
                }
                MetricKind::Value => {
                    if metric.value_fields.is_empty() {
                        rejections.push(InvalidConfigReason::for_metric(
                            InvalidConfigCode::BadValueFields,
                            metric.id,
                        ));
                        continue;
                    }
                    let fields = metric
                        .value_fields
                        .iter()
                        .map(|f| ValueField {
                            path: f.path.clone(),
                            aggregation: f.aggregation,
                        })
                        .collect();
                    Arc::new(Mutex::new(ValueMetricProducer::new(
                        spec,
                        now_ns,
                        fields,
                        metric.pulled_atom,
                        metric.use_diff,
                        metric.skip_new_keys_after_condition_change,
                    )))
                }
                MetricKind::Gauge => Arc::new(Mutex::new(GaugeMetricProducer::new(
                    spec,
                    now_ns,
                    metric.gauge_fields.clone(),
                    metric.pulled_atom,
                    metric.max_samples_per_bucket,
                ))),
                MetricKind::Event => Arc::new(Mutex::new(EventMetricProducer::new(spec, now_ns))),
                MetricKind::Histogram => {
                    let Some(field) = metric.histogram_field.clone() else {
                        rejections.push(InvalidConfigReason::for_metric(
                            InvalidConfigCode::BadHistogramBins,
                            metric.id,
                        ));
                        continue;
                    };
                    if metric.histogram_bins.is_empty()
                        || metric.histogram_bins.windows(2).any(|w| w[0] >= w[1])
                    {
                        rejections.push(InvalidConfigReason::for_metric(
                            InvalidConfigCode::BadHistogramBins,
                            metric.id,
                        ));
                        continue;
                    }
                    Arc::new(Mutex::new(HistogramMetricProducer::new(
                        spec,
                        now_ns,
                        field,
                        metric.histogram_bins.clone(),
                    )))
                }
            };

            let producer_index = producers.len();
            metric_ids.push(metric.id);
            tracker_to_metrics
                .entry(what_index)
                .or_default()
                .push(producer_index);
            if let Some(idx) = cond_idx {
                condition_to_metrics.entry(idx).or_default().push(producer_index);
            }
            for &atom_id in &metric.slice_by_state {
                state_atom_to_metrics
                    .entry(atom_id)
                    .or_default()
                    .push(producer_index);
            }
            for activation in &metric.activations {
                if let Some(&idx) = matcher_index.get(&activation.matcher) {
                    activation_tracker_to_metrics
                        .entry(idx)
                        .or_default()
                        .push(producer_index);
                }
            }
            for deactivation in &metric.deactivations {
                if let Some(&idx) = matcher_index.get(&deactivation.matcher) {
                    deactivation_tracker_to_metrics
                        .entry(idx)
                        .or_default()
                        .push(producer_index);
                }
            }

            // Pull-driven metrics register a weak receiver with the
            // scheduler; the manager keeps the adapter alive.
            if let Some(pulled_atom) = match metric.kind {
                MetricKind::Value | MetricKind::Gauge => metric.pulled_atom,
                _ => None,
            } {
                let pull = config.pulls.iter().find(|p| p.atom_id == pulled_atom);
                if pull.is_none() {
                    rejections.push(InvalidConfigReason::for_metric(
                        InvalidConfigCode::PullAtomMissing,
                        metric.id,
                    ));
                }
                let interval_ns = pull
                    .map(|p| p.interval.as_nanos() as i64)
                    .unwrap_or(spec_interval_fallback());
                let adapter: Arc<dyn PullDataReceiver> = Arc::new(PullReceiverAdapter {
                    matcher_index: what_index,
                    producer: Arc::downgrade(&producer),
                    conditions: Arc::downgrade(&conditions),
                    states: Arc::downgrade(&self.state_manager),
                });
                self.pull_scheduler.register_receiver(
                    pulled_atom,
                    key,
                    &adapter,
                    now_ns + interval_ns,
                    interval_ns,
                );
                pull_receivers.push(adapter);
            }

            producers.push(producer);
        }

        for alert in &config.alerts {
            if !metric_ids.contains(&alert.metric) {
                rejections.push(InvalidConfigReason {
                    alert_id: Some(alert.id),
                    ..InvalidConfigReason::new(InvalidConfigCode::AlertMetricNotFound)
                });
            }
        }

        (
            MetricsManager {
                config_key: key,
                byte_budget: config.byte_budget,
                matchers,
                conditions,
                producers,
                metric_ids,
                tracker_to_metrics,
                condition_to_metrics,
                activation_tracker_to_metrics,
                deactivation_tracker_to_metrics,
                state_atom_to_metrics,
                pull_receivers,
                events_seen: AtomicU64::new(0),
                stats: Arc::clone(&self.stats),
            },
            rejections,
        )
    }
}

fn spec_interval_fallback() -> i64 {
    60 * 1_000_000_000
}
