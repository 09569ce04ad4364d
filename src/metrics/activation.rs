use serde::{Deserialize, Serialize};

/// How an activation matcher arms the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Activates at the matching event, TTL starts immediately.
    Immediate,
    /// Armed now, becomes active at the next boot.
    OnBoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    NotActive,
    Active,
    ActiveOnBoot,
}

/// One activation slot of a metric, keyed by its activation matcher index.
#[derive(Debug, Clone)]
pub struct Activation {
    pub kind: ActivationKind,
    pub ttl_ns: i64,
    pub state: ActivationState,
    pub start_ns: i64,
}

impl Activation {
    pub fn new(kind: ActivationKind, ttl_ns: i64) -> Self {
        Self {
            kind,
            ttl_ns,
            state: ActivationState::NotActive,
            start_ns: 0,
        }
    }

    /// Whether this activation keeps the metric active at `now`.
    pub fn is_active_at(&self, now_ns: i64) -> bool {
        self.state == ActivationState::Active && now_ns <= self.start_ns + self.ttl_ns
    }
}

/// Persisted form of one still-live activation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivationSnapshot {
    pub matcher_index: usize,
    #[serde(default)]
    pub remaining_ttl_ns: i64,
    pub state: ActivationState,
}

/// Persisted activations of one metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveMetricSnapshot {
    pub metric_id: i64,
    pub activations: Vec<ActivationSnapshot>,
}
