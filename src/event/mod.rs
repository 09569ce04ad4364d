use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single typed value carried by an atom field.
///
/// `Float` compares and hashes by bit pattern so values can participate in
/// dimension keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Str(String),
    Bool(bool),
}

impl Value {
    /// Returns the contained integer for `Int` values.
    pub fn int_value(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens integral values to i64. None for floats and strings.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Canonical byte encoding used for stable hashing and shard sampling.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Long(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                out.push(4);
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bool(v) => {
                out.push(5);
                out.push(u8::from(*v));
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => {
                state.write_u8(1);
                v.hash(state);
            }
            Value::Long(v) => {
                state.write_u8(2);
                v.hash(state);
            }
            Value::Float(v) => {
                state.write_u8(3);
                v.to_bits().hash(state);
            }
            Value::Str(v) => {
                state.write_u8(4);
                v.hash(state);
            }
            Value::Bool(v) => {
                state.write_u8(5);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// One step of a field path: field number within the message, plus the
/// occurrence index for repeated fields (0 for scalars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathElem {
    pub field: u32,
    pub index: u32,
}

/// Identifies a field within an atom: the atom id plus the position path
/// into nested/repeated fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub atom_id: u32,
    pub path: Vec<PathElem>,
}

impl Field {
    /// A top-level scalar field of the given atom.
    pub fn leaf(atom_id: u32, field: u32) -> Self {
        Self {
            atom_id,
            path: vec![PathElem { field, index: 0 }],
        }
    }

    /// A top-level repeated field occurrence.
    pub fn repeated(atom_id: u32, field: u32, index: u32) -> Self {
        Self {
            atom_id,
            path: vec![PathElem { field, index }],
        }
    }

    /// The field number of the innermost path element.
    pub fn last_field(&self) -> Option<u32> {
        self.path.last().map(|e| e.field)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.atom_id.to_le_bytes());
        out.push(self.path.len() as u8);
        for elem in &self.path {
            out.extend_from_slice(&elem.field.to_le_bytes());
            out.extend_from_slice(&elem.index.to_le_bytes());
        }
    }
}

/// A field together with its value, the unit every event carries a tuple of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: Field,
    pub value: Value,
}

impl FieldValue {
    pub fn new(field: Field, value: Value) -> Self {
        Self { field, value }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.field.encode_into(out);
        self.value.encode_into(out);
    }
}

/// A typed event: atom id, elapsed/wall timestamps, and an ordered tuple of
/// field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomEvent {
    pub atom_id: u32,
    pub elapsed_ts_ns: i64,
    #[serde(default)]
    pub wall_ts_ns: i64,
    #[serde(default)]
    pub values: Vec<FieldValue>,
}

impl AtomEvent {
    pub fn new(atom_id: u32, elapsed_ts_ns: i64) -> Self {
        Self {
            atom_id,
            elapsed_ts_ns,
            wall_ts_ns: 0,
            values: Vec::new(),
        }
    }

    pub fn with_wall(mut self, wall_ts_ns: i64) -> Self {
        self.wall_ts_ns = wall_ts_ns;
        self
    }

    /// Appends a top-level scalar int field.
    pub fn with_int(mut self, field: u32, v: i32) -> Self {
        self.values
            .push(FieldValue::new(Field::leaf(self.atom_id, field), Value::Int(v)));
        self
    }

    /// Appends a top-level scalar long field.
    pub fn with_long(mut self, field: u32, v: i64) -> Self {
        self.values
            .push(FieldValue::new(Field::leaf(self.atom_id, field), Value::Long(v)));
        self
    }

    /// Appends a top-level scalar string field.
    pub fn with_str(mut self, field: u32, v: impl Into<String>) -> Self {
        self.values.push(FieldValue::new(
            Field::leaf(self.atom_id, field),
            Value::Str(v.into()),
        ));
        self
    }

    /// Appends a top-level scalar bool field.
    pub fn with_bool(mut self, field: u32, v: bool) -> Self {
        self.values
            .push(FieldValue::new(Field::leaf(self.atom_id, field), Value::Bool(v)));
        self
    }

    /// Appends one occurrence of a top-level repeated int field.
    pub fn with_repeated_int(mut self, field: u32, index: u32, v: i32) -> Self {
        self.values.push(FieldValue::new(
            Field::repeated(self.atom_id, field, index),
            Value::Int(v),
        ));
        self
    }

    /// Returns the value at the given top-level scalar field, if present.
    pub fn value_at(&self, field: u32) -> Option<&Value> {
        let want = Field::leaf(self.atom_id, field);
        self.values
            .iter()
            .find(|fv| fv.field == want)
            .map(|fv| &fv.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_float_value_equality_by_bits() {
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
        assert_ne!(Value::Float(1.5), Value::Float(1.6));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_value_as_map_key() {
        let mut map: HashMap<Value, u32> = HashMap::new();
        map.insert(Value::Str("pkg".to_string()), 1);
        map.insert(Value::Int(42), 2);
        assert_eq!(map.get(&Value::Str("pkg".to_string())), Some(&1));
        assert_eq!(map.get(&Value::Int(42)), Some(&2));
    }

    #[test]
    fn test_value_as_long_widens_integrals() {
        assert_eq!(Value::Int(-5).as_long(), Some(-5));
        assert_eq!(Value::Long(1 << 40).as_long(), Some(1 << 40));
        assert_eq!(Value::Bool(true).as_long(), Some(1));
        assert_eq!(Value::Float(1.0).as_long(), None);
        assert_eq!(Value::Str("x".to_string()).as_long(), None);
    }

    #[test]
    fn test_event_builder_and_value_at() {
        let event = AtomEvent::new(29, 1_000)
            .with_int(1, 10001)
            .with_str(2, "com.example.app")
            .with_bool(3, true);

        assert_eq!(event.values.len(), 3);
        assert_eq!(event.value_at(1), Some(&Value::Int(10001)));
        assert_eq!(
            event.value_at(2),
            Some(&Value::Str("com.example.app".to_string()))
        );
        assert_eq!(event.value_at(4), None);
    }

    #[test]
    fn test_repeated_field_occurrences_are_distinct() {
        let event = AtomEvent::new(7, 0)
            .with_repeated_int(1, 0, 100)
            .with_repeated_int(1, 1, 200);

        assert_ne!(event.values[0].field, event.values[1].field);
        assert_eq!(event.values[0].field.last_field(), Some(1));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let fv = FieldValue::new(Field::leaf(10, 2), Value::Str("a".to_string()));
        let mut a = Vec::new();
        let mut b = Vec::new();
        fv.encode_into(&mut a);
        fv.encode_into(&mut b);
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
