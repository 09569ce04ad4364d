use std::collections::HashMap;

use tracing::trace;

use crate::dimension::{extract_link_key, DimensionKey, DimensionPath};
use crate::event::{AtomEvent, Value};

/// Sentinel state value for untracked or unmapped states.
pub const STATE_UNKNOWN: i32 = -1;

/// Describes one state atom: which fields form the primary key and which
/// field carries the state value. Group remapping lives in the consumer so a
/// single tracker serves metrics with different groupings.
#[derive(Debug, Clone)]
pub struct StateAtomSpec {
    pub atom_id: u32,
    pub primary_fields: Vec<u32>,
    pub value_field: u32,
}

/// A diff produced by a state atom overwriting a tracked value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub atom_id: u32,
    pub primary_key: DimensionKey,
    pub old: Value,
    pub new: Value,
}

/// Tracks the latest state value per primary key for one atom.
pub struct StateTracker {
    spec: StateAtomSpec,
    values: HashMap<DimensionKey, Value>,
}

impl StateTracker {
    pub fn new(spec: StateAtomSpec) -> Self {
        Self {
            spec,
            values: HashMap::new(),
        }
    }

    /// Overwrites the state for the event's primary key and returns the diff
    /// if the value actually changed.
    pub fn handle_event(&mut self, event: &AtomEvent) -> Option<StateChange> {
        let new = event.value_at(self.spec.value_field)?.clone();
        let paths: Vec<DimensionPath> = self
            .spec
            .primary_fields
            .iter()
            .map(|&f| DimensionPath::leaf(f))
            .collect();
        let primary_key = extract_link_key(&paths, &event.values);

        let old = self
            .values
            .insert(primary_key.clone(), new.clone())
            .unwrap_or(Value::Int(STATE_UNKNOWN));
        if old == new {
            return None;
        }
        trace!(
            atom_id = self.spec.atom_id,
            key = %primary_key,
            %old,
            %new,
            "state changed",
        );
        Some(StateChange {
            atom_id: self.spec.atom_id,
            primary_key,
            old,
            new,
        })
    }

    pub fn value(&self, key: &DimensionKey) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn byte_size(&self) -> usize {
        self.values
            .iter()
            .map(|(k, _)| k.byte_size() + std::mem::size_of::<Value>())
            .sum()
    }
}

/// Read-only state query interface handed to producers on each event.
pub trait StateLookup {
    /// Latest value for `(atom_id, key)`; None when the atom is untracked or
    /// the key has never been seen. Consumers map None to `STATE_UNKNOWN`.
    fn state_value(&self, atom_id: u32, key: &DimensionKey) -> Option<Value>;
}

/// Owns one tracker per state atom referenced by any metric.
#[derive(Default)]
pub struct StateManager {
    trackers: HashMap<u32, StateTracker>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tracker for an atom; idempotent for the same atom id.
    pub fn register(&mut self, spec: StateAtomSpec) {
        self.trackers
            .entry(spec.atom_id)
            .or_insert_with(|| StateTracker::new(spec));
    }

    pub fn is_tracked(&self, atom_id: u32) -> bool {
        self.trackers.contains_key(&atom_id)
    }

    /// Routes one event to its tracker, if any.
    pub fn on_event(&mut self, event: &AtomEvent) -> Option<StateChange> {
        self.trackers.get_mut(&event.atom_id)?.handle_event(event)
    }

    pub fn byte_size(&self) -> usize {
        self.trackers.values().map(StateTracker::byte_size).sum()
    }
}

impl StateLookup for StateManager {
    fn state_value(&self, atom_id: u32, key: &DimensionKey) -> Option<Value> {
        self.trackers.get(&atom_id)?.value(key).cloned()
    }
}

/// The empty lookup, used where a metric has no sliced states.
pub struct NoStates;

impl StateLookup for NoStates {
    fn state_value(&self, _atom_id: u32, _key: &DimensionKey) -> Option<Value> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCREEN_STATE: u32 = 29;

    fn screen_spec() -> StateAtomSpec {
        StateAtomSpec {
            atom_id: SCREEN_STATE,
            primary_fields: vec![],
            value_field: 1,
        }
    }

    fn per_uid_spec() -> StateAtomSpec {
        StateAtomSpec {
            atom_id: 47,
            primary_fields: vec![1],
            value_field: 2,
        }
    }

    #[test]
    fn test_overwrite_and_diff() {
        let mut mgr = StateManager::new();
        mgr.register(screen_spec());

        let on = AtomEvent::new(SCREEN_STATE, 10).with_int(1, 2);
        let change = mgr.on_event(&on).expect("first write is a change");
        assert_eq!(change.old, Value::Int(STATE_UNKNOWN));
        assert_eq!(change.new, Value::Int(2));

        // Same value again: no diff.
        assert!(mgr.on_event(&on).is_none());

        let off = AtomEvent::new(SCREEN_STATE, 20).with_int(1, 1);
        let change = mgr.on_event(&off).expect("flip is a change");
        assert_eq!(change.old, Value::Int(2));
        assert_eq!(change.new, Value::Int(1));
    }

    #[test]
    fn test_primary_key_joins() {
        let mut mgr = StateManager::new();
        mgr.register(per_uid_spec());

        let a = AtomEvent::new(47, 10).with_int(1, 1000).with_int(2, 3);
        let b = AtomEvent::new(47, 11).with_int(1, 2000).with_int(2, 5);
        mgr.on_event(&a);
        mgr.on_event(&b);

        let key_a = extract_link_key(&[DimensionPath::leaf(1)], &a.values);
        let key_b = extract_link_key(&[DimensionPath::leaf(1)], &b.values);
        assert_eq!(mgr.state_value(47, &key_a), Some(Value::Int(3)));
        assert_eq!(mgr.state_value(47, &key_b), Some(Value::Int(5)));
    }

    #[test]
    fn test_query_miss_returns_none() {
        let mut mgr = StateManager::new();
        mgr.register(per_uid_spec());
        assert_eq!(mgr.state_value(47, &DimensionKey::default()), None);
        assert_eq!(mgr.state_value(999, &DimensionKey::default()), None);
    }

    #[test]
    fn test_untracked_atom_is_ignored() {
        let mut mgr = StateManager::new();
        mgr.register(screen_spec());
        let event = AtomEvent::new(999, 10).with_int(1, 2);
        assert!(mgr.on_event(&event).is_none());
    }

    #[test]
    fn test_event_without_value_field_is_ignored() {
        let mut mgr = StateManager::new();
        mgr.register(screen_spec());
        let event = AtomEvent::new(SCREEN_STATE, 10).with_int(9, 2);
        assert!(mgr.on_event(&event).is_none());
    }
}
