//! Retraining decision policies.
//!
//! A policy is a pure function over a snapshot of an application's
//! [`RetrainRecord`]; it never mutates state and never blocks. The trigger
//! checker consults the policy on every data arrival and on every retrain
//! completion, and uses [`RetrainPolicy::calc_timeout`] to arm a deferred
//! re-evaluation when nothing triggers.

mod cost_aware;
mod manual;
mod naive;
mod speculative;

pub use cost_aware::CostAwarePolicy;
pub use manual::ManualPolicy;
pub use naive::NaiveBestEffortPolicy;
pub use speculative::SpeculativeBestEffortPolicy;

use std::collections::HashMap;
use std::sync::Arc;

/// One uploaded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Microseconds since epoch at which the upload arrived.
    pub arrival_us: i64,
    /// Number of samples in the upload.
    pub size: i64,
}

/// The batch currently (or most recently) dispatched for training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingBatch {
    /// Dispatch time in microseconds since epoch.
    pub dispatch_us: i64,
    /// Total samples dispatched.
    pub size: i64,
}

/// Per-application retraining state, owned by the trigger checker.
#[derive(Debug, Clone)]
pub struct RetrainRecord {
    pub alpha: f64,
    pub beta: f64,
    pub weight: f64,

    /// Arrival time of the most recent batch.
    pub last_arrival_us: i64,
    /// Inclusive window of the most recently dispatched retrain; `0,0` until
    /// the first dispatch.
    pub data_from_us: i64,
    pub data_to_us: i64,
    /// Whether the last dispatched retrain has completed.
    pub finished: bool,
    pub training_batch: TrainingBatch,
    /// Batches not yet consumed by a completed retrain, ordered by arrival.
    pub batches: Vec<Batch>,
}

impl RetrainRecord {
    pub fn new(last_arrival_us: i64, alpha: f64, beta: f64, weight: f64) -> Self {
        Self {
            alpha,
            beta,
            weight,
            last_arrival_us,
            data_from_us: 0,
            data_to_us: 0,
            finished: true,
            training_batch: TrainingBatch::default(),
            batches: Vec::new(),
        }
    }

    /// No retrain has ever been dispatched. Negative sentinels count too.
    pub fn never_trained(&self) -> bool {
        self.data_from_us <= 0
    }

    /// Total samples with arrival in `[from_us, to_us]`.
    pub fn size_in_window(&self, from_us: i64, to_us: i64) -> i64 {
        self.batches
            .iter()
            .filter(|b| b.arrival_us >= from_us && b.arrival_us <= to_us)
            .map(|b| b.size)
            .sum()
    }

    /// Total samples with arrival strictly after `ts_us`.
    pub fn size_after(&self, ts_us: i64) -> i64 {
        self.batches
            .iter()
            .filter(|b| b.arrival_us > ts_us)
            .map(|b| b.size)
            .sum()
    }

    /// Total samples with arrival at or after `ts_us`.
    pub fn size_from(&self, ts_us: i64) -> i64 {
        self.batches
            .iter()
            .filter(|b| b.arrival_us >= ts_us)
            .map(|b| b.size)
            .sum()
    }
}

/// Inclusive arrival-time window a triggered retrain should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrainWindow {
    pub from_us: i64,
    pub to_us: i64,
}

impl RetrainWindow {
    pub fn new(from_us: i64, to_us: i64) -> Self {
        Self { from_us, to_us }
    }
}

/// Decision interface implemented by every policy.
pub trait RetrainPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluated on every data arrival.
    fn ready_to_retrain(&self, record: &RetrainRecord) -> Option<RetrainWindow>;

    /// Evaluated when an in-flight retrain completes, to chain the next one.
    fn on_retrain_finished(&self, record: &RetrainRecord) -> Option<RetrainWindow>;

    /// Milliseconds until a deferred re-evaluation should run; values `<= 0`
    /// arm no timer.
    fn calc_timeout(&self, record: &RetrainRecord) -> i64;
}

/// Shared rule of the best-effort policies: once the previous retrain has
/// finished and data arrived after its dispatch, retrain everything newer
/// than the last window.
pub(crate) fn follow_up_window(record: &RetrainRecord) -> Option<RetrainWindow> {
    if record.finished && record.last_arrival_us > record.training_batch.dispatch_us {
        Some(RetrainWindow::new(
            record.data_to_us + 1,
            record.last_arrival_us,
        ))
    } else {
        None
    }
}

/// Name-keyed policy registry with the naive policy as the fallback.
pub struct PolicyRegistry {
    policies: HashMap<&'static str, Arc<dyn RetrainPolicy>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub const DEFAULT_POLICY: &'static str = "NaiveBestEffortPolicy";

    pub fn new() -> Self {
        let mut policies: HashMap<&'static str, Arc<dyn RetrainPolicy>> = HashMap::new();
        for policy in [
            Arc::new(NaiveBestEffortPolicy) as Arc<dyn RetrainPolicy>,
            Arc::new(SpeculativeBestEffortPolicy),
            Arc::new(CostAwarePolicy),
            Arc::new(ManualPolicy),
        ] {
            policies.insert(policy.name(), policy);
        }
        Self { policies }
    }

    /// The registered name for `requested`, falling back to the default
    /// policy for unknown names.
    pub fn resolve_name(&self, requested: &str) -> &'static str {
        self.policies
            .get_key_value(requested)
            .map(|(name, _)| *name)
            .unwrap_or(Self::DEFAULT_POLICY)
    }

    pub fn get(&self, name: &str) -> Arc<dyn RetrainPolicy> {
        self.policies
            .get(name)
            .or_else(|| self.policies.get(Self::DEFAULT_POLICY))
            .cloned()
            .unwrap_or_else(|| Arc::new(NaiveBestEffortPolicy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_names() {
        let registry = PolicyRegistry::new();
        assert_eq!(
            registry.resolve_name("CostAwarePolicy"),
            "CostAwarePolicy"
        );
        assert_eq!(
            registry.resolve_name("SpeculativeBestEffortPolicy"),
            "SpeculativeBestEffortPolicy"
        );
        assert_eq!(registry.resolve_name("ManualPolicy"), "ManualPolicy");
    }

    #[test]
    fn unknown_names_fall_back_to_naive() {
        let registry = PolicyRegistry::new();
        assert_eq!(registry.resolve_name("no-such-policy"), "NaiveBestEffortPolicy");
        assert_eq!(registry.get("no-such-policy").name(), "NaiveBestEffortPolicy");
    }

    #[test]
    fn window_sums_are_inclusive() {
        let mut record = RetrainRecord::new(3, 1.0, 1.0, 10.0);
        record.batches = vec![
            Batch { arrival_us: 1, size: 10 },
            Batch { arrival_us: 2, size: 20 },
            Batch { arrival_us: 3, size: 30 },
        ];
        assert_eq!(record.size_in_window(1, 2), 30);
        assert_eq!(record.size_after(1), 50);
        assert_eq!(record.size_from(2), 50);
    }
}
