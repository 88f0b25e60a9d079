//! Cost model driven policy.
//!
//! Compares the cost of retraining all pending data in one pass against the
//! cheapest two-pass split, and retrains only when the single pass is worse
//! by more than the weighted setup cost.

use tracing::debug;

use super::{Batch, RetrainPolicy, RetrainRecord, RetrainWindow};

pub struct CostAwarePolicy;

/// `all_cost`: one pass over everything pending.
/// `min_cost`: the cheapest split into two consecutive passes.
#[derive(Debug, Clone, Copy)]
struct CostInfo {
    all_cost: f64,
    min_cost: f64,
}

impl RetrainPolicy for CostAwarePolicy {
    fn name(&self) -> &'static str {
        "CostAwarePolicy"
    }

    fn ready_to_retrain(&self, record: &RetrainRecord) -> Option<RetrainWindow> {
        if !record.finished {
            return None;
        }
        if record.batches.len() <= 1 {
            return None;
        }

        let costs = cost_info(record);
        debug!(
            "Cost-aware evaluation. all_cost:{} min_cost:{} gap_objective:{} weight:{} alpha:{} beta:{}",
            costs.all_cost,
            costs.min_cost,
            record.weight * record.beta,
            record.weight,
            record.alpha,
            record.beta
        );

        if costs.all_cost - costs.min_cost > record.weight * record.beta {
            Some(RetrainWindow::new(
                record.data_to_us + 1,
                record.last_arrival_us,
            ))
        } else {
            None
        }
    }

    fn on_retrain_finished(&self, record: &RetrainRecord) -> Option<RetrainWindow> {
        self.ready_to_retrain(record)
    }

    fn calc_timeout(&self, record: &RetrainRecord) -> i64 {
        let costs = cost_info(record);
        let untrained: i64 = record
            .batches
            .iter()
            .filter(|b| record.finished || b.arrival_us > record.data_to_us)
            .map(|b| b.size)
            .sum();
        if untrained == 0 {
            return 0;
        }
        ((record.weight * record.beta - (costs.all_cost - costs.min_cost)) / untrained as f64)
            as i64
    }
}

/// Projected cost of one retrain pass over `batches` holding `data_size`
/// samples: weighted training time plus the serving-staleness latency every
/// batch accumulates until the pass completes.
fn calc_cost(batches: &[Batch], data_size: i64, alpha: f64, beta: f64, weight: f64) -> f64 {
    let Some(last) = batches.last() else {
        return 0.0;
    };
    let retrain_time_ms = (alpha * data_size as f64 + beta) as i64;
    let end_time_us = retrain_time_ms * 1000 + last.arrival_us;
    let latency_us: i64 = batches.iter().map(|b| end_time_us - b.arrival_us).sum();
    weight * retrain_time_ms as f64 + (latency_us / 1000) as f64
}

fn cost_info(record: &RetrainRecord) -> CostInfo {
    // Exclude data belonging to a still-running retrain.
    let begin = if record.finished {
        0
    } else {
        record
            .batches
            .iter()
            .position(|b| b.arrival_us > record.data_to_us)
            .unwrap_or(record.batches.len())
    };
    let pending = &record.batches[begin..];
    let data_size: i64 = pending.iter().map(|b| b.size).sum();

    // Walk forward until the remainder would no longer dominate twice the
    // accumulated prefix; that batch starts the second pass.
    let mut split = pending.len();
    let mut partial_size: i64 = 0;
    for (i, batch) in pending.iter().enumerate() {
        if data_size - batch.size > 2 * partial_size {
            partial_size += batch.size;
        } else {
            split = i;
            break;
        }
    }

    let all_cost = calc_cost(pending, data_size, record.alpha, record.beta, record.weight);
    let min_cost = calc_cost(
        &pending[..split],
        partial_size,
        record.alpha,
        record.beta,
        record.weight,
    ) + calc_cost(
        &pending[split..],
        data_size - partial_size,
        record.alpha,
        record.beta,
        record.weight,
    );
    CostInfo { all_cost, min_cost }
}
