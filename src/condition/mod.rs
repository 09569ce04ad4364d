pub mod timer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dimension::{extract_dimension_keys, DimensionKey, DimensionSpec};
use crate::event::AtomEvent;

/// Tri-state truth value of a condition node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionState {
    False,
    True,
    #[default]
    Unknown,
}

impl ConditionState {
    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }

    pub fn from_bool(b: bool) -> Self {
        if b {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }

    fn and(self, other: Self) -> Self {
        match (self, other) {
            (ConditionState::False, _) | (_, ConditionState::False) => ConditionState::False,
            (ConditionState::True, ConditionState::True) => ConditionState::True,
            _ => ConditionState::Unknown,
        }
    }

    fn or(self, other: Self) -> Self {
        match (self, other) {
            (ConditionState::True, _) | (_, ConditionState::True) => ConditionState::True,
            (ConditionState::False, ConditionState::False) => ConditionState::False,
            _ => ConditionState::Unknown,
        }
    }

    fn not(self) -> Self {
        match self {
            ConditionState::True => ConditionState::False,
            ConditionState::False => ConditionState::True,
            ConditionState::Unknown => ConditionState::Unknown,
        }
    }
}

/// Boolean operator for combination nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// Configuration of a predicate node driven by start/stop matchers.
#[derive(Debug, Clone)]
pub struct SimpleConditionSpec {
    pub start_matcher: Option<usize>,
    pub stop_matcher: Option<usize>,
    pub stop_all_matcher: Option<usize>,
    /// Starts nest: the condition stays true until as many stops arrive.
    pub count_nesting: bool,
    /// When set the node holds one truth value per extracted key.
    pub output_dimensions: Option<DimensionSpec>,
    /// Value reported before any matcher fires: False or Unknown.
    pub initial_value: ConditionState,
}

struct SimpleNode {
    spec: SimpleConditionSpec,
    state: ConditionState,
    nest_count: u32,
    sliced: HashMap<DimensionKey, ConditionState>,
    sliced_nest: HashMap<DimensionKey, u32>,
}

enum NodeKind {
    Simple(SimpleNode),
    Combination { op: LogicalOp, children: Vec<usize> },
}

struct Node {
    kind: NodeKind,
    cached: ConditionState,
}

/// A state change produced by one event passing through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionChange {
    pub index: usize,
    pub sliced: bool,
    pub new_state: ConditionState,
}

/// Read-only query interface handed to metric producers on each event, so
/// producers never hold a reference back into the graph.
pub trait ConditionLookup {
    /// Queries one node for the given link key.
    ///
    /// `partial_match_allowed` is set when the metric links a strict subset
    /// of the condition's dimension fields: the result is True iff every
    /// expansion matches true, False iff every matches false, else Unknown.
    fn query(&self, index: usize, key: &DimensionKey, partial_match_allowed: bool)
        -> ConditionState;
}

/// Dependency graph of condition nodes, evaluated bottom-up.
///
/// Children of a combination node always precede it in the node list, which
/// config validation guarantees, so a single forward pass recomputes parents
/// from cached child states.
pub struct ConditionGraph {
    nodes: Vec<Node>,
}

impl ConditionGraph {
    pub fn new(simples: Vec<SimpleConditionSpec>, combinations: Vec<(LogicalOp, Vec<usize>)>) -> Self {
        let mut nodes: Vec<Node> = simples
            .into_iter()
            .map(|spec| {
                let initial = spec.initial_value;
                Node {
                    kind: NodeKind::Simple(SimpleNode {
                        spec,
                        state: initial,
                        nest_count: 0,
                        sliced: HashMap::new(),
                        sliced_nest: HashMap::new(),
                    }),
                    cached: initial,
                }
            })
            .collect();

        for (op, children) in combinations {
            let cached = Self::combine(op, &children, &nodes);
            nodes.push(Node {
                kind: NodeKind::Combination { op, children },
                cached,
            });
        }

        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_sliced(&self, index: usize) -> bool {
        matches!(
            self.nodes.get(index),
            Some(Node {
                kind: NodeKind::Simple(s),
                ..
            }) if s.spec.output_dimensions.is_some()
        )
    }

    /// Current unsliced truth value of a node.
    pub fn state(&self, index: usize) -> ConditionState {
        self.nodes
            .get(index)
            .map(|n| n.cached)
            .unwrap_or(ConditionState::Unknown)
    }

    fn combine(op: LogicalOp, children: &[usize], nodes: &[Node]) -> ConditionState {
        let mut states = children.iter().map(|&c| nodes[c].cached);
        match op {
            LogicalOp::And => states.fold(ConditionState::True, ConditionState::and),
            LogicalOp::Or => states.fold(ConditionState::False, ConditionState::or),
            LogicalOp::Not => states
                .next()
                .map(ConditionState::not)
                .unwrap_or(ConditionState::Unknown),
        }
    }

    /// Applies one event to every predicate node and propagates changes to
    /// combination parents. Returns the nodes whose value changed (for
    /// sliced nodes, whose per-key map changed), in index order.
    pub fn evaluate_event(&mut self, matched: &[bool], event: &AtomEvent) -> Vec<ConditionChange> {
        let mut changes = Vec::new();
        let mut simple_changed = vec![false; self.nodes.len()];

        for (idx, node) in self.nodes.iter_mut().enumerate() {
            let NodeKind::Simple(simple) = &mut node.kind else {
                continue;
            };
            if Self::apply_to_simple(simple, matched, event) {
                simple_changed[idx] = true;
                node.cached = simple.state;
                changes.push(ConditionChange {
                    index: idx,
                    sliced: simple.spec.output_dimensions.is_some(),
                    new_state: node.cached,
                });
            }
        }

        // Recompute combinations in index order; children precede parents.
        for idx in 0..self.nodes.len() {
            let NodeKind::Combination { op, children } = &self.nodes[idx].kind else {
                continue;
            };
            let dirty = children
                .iter()
                .any(|&c| simple_changed[c] || changes.iter().any(|ch| ch.index == c));
            if !dirty {
                continue;
            }
            let new_state = Self::combine(*op, &children.clone(), &self.nodes);
            if new_state != self.nodes[idx].cached {
                self.nodes[idx].cached = new_state;
                changes.push(ConditionChange {
                    index: idx,
                    sliced: false,
                    new_state,
                });
            }
        }

        changes
    }

    fn apply_to_simple(simple: &mut SimpleNode, matched: &[bool], event: &AtomEvent) -> bool {
        let hit = |m: Option<usize>| m.map(|i| matched.get(i).copied().unwrap_or(false)) == Some(true);
        let started = hit(simple.spec.start_matcher);
        let stopped = hit(simple.spec.stop_matcher);
        let stop_all = hit(simple.spec.stop_all_matcher);

        if !started && !stopped && !stop_all {
            return false;
        }

        if stop_all {
            let had_true = simple.state.is_true()
                || simple.sliced.values().any(|s| s.is_true());
            simple.state = ConditionState::False;
            simple.nest_count = 0;
            simple.sliced.clear();
            simple.sliced_nest.clear();
            trace!(elapsed_ts_ns = event.elapsed_ts_ns, "condition stop-all");
            return had_true;
        }

        match &simple.spec.output_dimensions {
            None => {
                let old = simple.state;
                if started {
                    if simple.spec.count_nesting {
                        simple.nest_count += 1;
                    }
                    simple.state = ConditionState::True;
                } else if stopped {
                    if simple.spec.count_nesting {
                        simple.nest_count = simple.nest_count.saturating_sub(1);
                        if simple.nest_count == 0 {
                            simple.state = ConditionState::False;
                        }
                    } else {
                        simple.state = ConditionState::False;
                    }
                }
                old != simple.state
            }
            Some(dims) => {
                let mut changed = false;
                for key in extract_dimension_keys(dims, &event.values) {
                    let entry = simple
                        .sliced
                        .entry(key.clone())
                        .or_insert(simple.spec.initial_value);
                    let old = *entry;
                    if started {
                        if simple.spec.count_nesting {
                            *simple.sliced_nest.entry(key.clone()).or_insert(0) += 1;
                        }
                        *entry = ConditionState::True;
                    } else if stopped {
                        if simple.spec.count_nesting {
                            let nest = simple.sliced_nest.entry(key.clone()).or_insert(0);
                            *nest = nest.saturating_sub(1);
                            if *nest == 0 {
                                *entry = ConditionState::False;
                            }
                        } else {
                            *entry = ConditionState::False;
                        }
                    }
                    changed |= old != *entry;
                }
                changed
            }
        }
    }
}

impl ConditionLookup for ConditionGraph {
    fn query(
        &self,
        index: usize,
        key: &DimensionKey,
        partial_match_allowed: bool,
    ) -> ConditionState {
        let Some(node) = self.nodes.get(index) else {
            return ConditionState::Unknown;
        };
        let NodeKind::Simple(simple) = &node.kind else {
            return node.cached;
        };
        let Some(_) = &simple.spec.output_dimensions else {
            return node.cached;
        };

        if !partial_match_allowed {
            if let Some(state) = simple.sliced.get(key) {
                return *state;
            }
            // Link keys carry the querying metric's field tags; match by
            // value when the tags differ.
            for (slice_key, state) in &simple.sliced {
                if slice_key.values().len() == key.values().len()
                    && slice_key
                        .values()
                        .iter()
                        .zip(key.values())
                        .all(|(a, b)| a.value == b.value)
                {
                    return *state;
                }
            }
            return simple.spec.initial_value;
        }

        let mut any = false;
        let mut all_true = true;
        let mut all_false = true;
        for (slice_key, state) in &simple.sliced {
            if !slice_key.contains_values(key) {
                continue;
            }
            any = true;
            all_true &= state.is_true();
            all_false &= *state == ConditionState::False;
        }
        if !any {
            return simple.spec.initial_value;
        }
        if all_true {
            ConditionState::True
        } else if all_false {
            ConditionState::False
        } else {
            ConditionState::Unknown
        }
    }
}
