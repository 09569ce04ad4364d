use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::event::{FieldValue, Value};

/// How a path step selects occurrences of a repeated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// Scalar selection: the single (first) occurrence.
    #[default]
    Exact,
    /// One dimension key per present occurrence.
    Any,
    /// A single key holding every occurrence as a nested sequence.
    All,
}

/// One step of a field-matcher path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherStep {
    pub field: u32,
    #[serde(default)]
    pub position: Position,
}

/// A path expression selecting one field (or repeated-field family) of an
/// atom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionPath {
    pub steps: Vec<MatcherStep>,
}

impl DimensionPath {
    /// A top-level scalar path.
    pub fn leaf(field: u32) -> Self {
        Self {
            steps: vec![MatcherStep {
                field,
                position: Position::Exact,
            }],
        }
    }

    /// A top-level path with the given position semantics.
    pub fn repeated(field: u32, position: Position) -> Self {
        Self {
            steps: vec![MatcherStep { field, position }],
        }
    }

    fn matches(&self, value: &FieldValue) -> bool {
        let path = &value.field.path;
        if path.len() != self.steps.len() {
            return false;
        }
        self.steps.iter().zip(path.iter()).all(|(step, elem)| {
            step.field == elem.field
                && match step.position {
                    Position::Exact => elem.index == 0,
                    Position::Any | Position::All => true,
                }
        })
    }

    /// Occurrence index at the first wildcard step, if this path has one and
    /// the value matches.
    fn wildcard_index(&self, value: &FieldValue) -> Option<u32> {
        if !self.matches(value) {
            return None;
        }
        self.steps
            .iter()
            .zip(value.field.path.iter())
            .find(|(step, _)| step.position != Position::Exact)
            .map(|(_, elem)| elem.index)
    }

    fn has_wildcard(&self, position: Position) -> bool {
        self.steps.iter().any(|s| s.position == position)
    }
}

/// An ordered set of paths extracted from an event to form a dimension key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DimensionSpec {
    pub paths: Vec<DimensionPath>,
}

impl DimensionSpec {
    pub fn new(paths: Vec<DimensionPath>) -> Self {
        Self { paths }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// True when any path enumerates occurrences into separate keys.
    pub fn has_any_position(&self) -> bool {
        self.paths.iter().any(|p| p.has_wildcard(Position::Any))
    }

    /// True when any path collapses occurrences into a nested sequence, which
    /// the report marks with `use_nested_dimensions`.
    pub fn has_all_position(&self) -> bool {
        self.paths.iter().any(|p| p.has_wildcard(Position::All))
    }
}

/// An ordered tuple of field values identifying one slice of an aggregate.
///
/// The empty key is the default key used by unsliced metrics and state
/// queries without a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DimensionKey {
    values: Vec<FieldValue>,
}

impl DimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn add_value(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Hash that is stable across process runs for a fixed input.
    pub fn stable_hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(self.values.len() * 16);
        for v in &self.values {
            v.encode_into(&mut buf);
        }
        xxh3_64(&buf)
    }

    /// True when `other`'s values appear in order within this key, compared
    /// by value. Used for partial condition-key matching, where the link
    /// fields come from a different atom than the condition's dimensions.
    pub fn contains_values(&self, other: &DimensionKey) -> bool {
        let mut iter = self.values.iter();
        other
            .values
            .iter()
            .all(|needle| iter.any(|have| have.value == needle.value))
    }

    /// Rough in-memory footprint for byte accounting.
    pub fn byte_size(&self) -> usize {
        self.values
            .iter()
            .map(|fv| {
                std::mem::size_of::<FieldValue>()
                    + match &fv.value {
                        Value::Str(s) => s.len(),
                        _ => 0,
                    }
            })
            .sum()
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, fv) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}:{}", fv.field.last_field().unwrap_or(0), fv.value)?;
        }
        Ok(())
    }
}

/// The full aggregate key: the what-dimension joined with the state slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MetricDimensionKey {
    dimension_in_what: DimensionKey,
    state_values: DimensionKey,
}

impl MetricDimensionKey {
    pub fn new(dimension_in_what: DimensionKey, state_values: DimensionKey) -> Self {
        Self {
            dimension_in_what,
            state_values,
        }
    }

    pub fn dimension_in_what(&self) -> &DimensionKey {
        &self.dimension_in_what
    }

    pub fn state_values(&self) -> &DimensionKey {
        &self.state_values
    }

    pub fn byte_size(&self) -> usize {
        self.dimension_in_what.byte_size() + self.state_values.byte_size()
    }
}

impl fmt::Display for MetricDimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})({})", self.dimension_in_what, self.state_values)
    }
}

/// Extracts the dimension keys selected by `spec` from an event's values.
///
/// Without an ANY position this yields exactly one key (possibly empty).
/// With ANY, one key per occurrence index present at the wildcard step;
/// occurrences are correlated across paths by index.
pub fn extract_dimension_keys(spec: &DimensionSpec, values: &[FieldValue]) -> Vec<DimensionKey> {
    if !spec.has_any_position() {
        return vec![extract_single_key(spec, values, None)];
    }

    let mut indices: Vec<u32> = Vec::new();
    for path in &spec.paths {
        if !path.has_wildcard(Position::Any) {
            continue;
        }
        for v in values {
            if let Some(idx) = path.wildcard_index(v) {
                if !indices.contains(&idx) {
                    indices.push(idx);
                }
            }
        }
    }
    indices.sort_unstable();

    if indices.is_empty() {
        return vec![extract_single_key(spec, values, None)];
    }

    indices
        .into_iter()
        .map(|idx| extract_single_key(spec, values, Some(idx)))
        .collect()
}

fn extract_single_key(
    spec: &DimensionSpec,
    values: &[FieldValue],
    any_index: Option<u32>,
) -> DimensionKey {
    let mut key = DimensionKey::default();
    for path in &spec.paths {
        if path.has_wildcard(Position::All) {
            // Nested sequence: every occurrence, in event order.
            for v in values {
                if path.matches(v) {
                    key.add_value(v.clone());
                }
            }
        } else if path.has_wildcard(Position::Any) {
            let want = any_index.unwrap_or(0);
            if let Some(v) = values
                .iter()
                .find(|v| path.wildcard_index(v) == Some(want))
            {
                key.add_value(v.clone());
            }
        } else if let Some(v) = values.iter().find(|v| path.matches(v)) {
            key.add_value(v.clone());
        }
    }
    key
}

/// Selects the first value matching `path`, for links and sampling.
pub fn filter_first(path: &DimensionPath, values: &[FieldValue]) -> Option<FieldValue> {
    values.iter().find(|v| path.matches(v)).cloned()
}

/// Builds a link key from an ordered list of paths, first match per path.
pub fn extract_link_key(paths: &[DimensionPath], values: &[FieldValue]) -> DimensionKey {
    let mut key = DimensionKey::default();
    for path in paths {
        if let Some(v) = filter_first(path, values) {
            key.add_value(v);
        }
    }
    key
}

/// Shard-consistent sampling decision: the event is kept iff the stable hash
/// of the sampled field lands on this instance's shard.
pub fn should_keep_sample(value: &FieldValue, shard_offset: u32, shard_count: u32) -> bool {
    if shard_count <= 1 {
        return true;
    }
    let mut buf = Vec::with_capacity(16);
    value.value.encode_into(&mut buf);
    xxh3_64(&buf) % u64::from(shard_count) == u64::from(shard_offset)
}
