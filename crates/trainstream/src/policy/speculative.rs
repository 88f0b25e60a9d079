//! Best-effort policy that may retrain on top of a running retrain.
//!
//! While a retrain is in flight it weighs the cost of waiting against the
//! cost of restarting with the data that has arrived since dispatch, and
//! fires an overlapping retrain when restarting wins.

use tracing::debug;

use super::{follow_up_window, RetrainPolicy, RetrainRecord, RetrainWindow};

pub struct SpeculativeBestEffortPolicy;

impl RetrainPolicy for SpeculativeBestEffortPolicy {
    fn name(&self) -> &'static str {
        "SpeculativeBestEffortPolicy"
    }

    fn ready_to_retrain(&self, record: &RetrainRecord) -> Option<RetrainWindow> {
        if record.never_trained() {
            return Some(RetrainWindow::new(
                record.last_arrival_us,
                record.last_arrival_us,
            ));
        }
        if let Some(window) = follow_up_window(record) {
            return Some(window);
        }

        // B: data that arrived after the running retrain's window.
        let new_data = record.size_after(record.data_to_us);
        // D: data the running retrain was dispatched with.
        let dispatched = record.training_batch.size;
        // delta: milliseconds since dispatch.
        let interval_ms = (record.last_arrival_us - record.training_batch.dispatch_us) / 1000;

        let left = new_data as f64 * record.beta;
        let right = 2.0
            * (record.alpha * dispatched as f64 * new_data as f64
                + interval_ms as f64 * (dispatched + new_data) as f64);

        debug!(
            "Speculative evaluation. B:{new_data} D:{dispatched} delta_ms:{interval_ms} \
             alpha:{} beta:{} left:{left} right:{right}",
            record.alpha, record.beta
        );

        if left >= right {
            Some(RetrainWindow::new(
                record.data_from_us,
                record.last_arrival_us,
            ))
        } else {
            None
        }
    }

    fn on_retrain_finished(&self, record: &RetrainRecord) -> Option<RetrainWindow> {
        follow_up_window(record)
    }

    fn calc_timeout(&self, _record: &RetrainRecord) -> i64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Batch, NaiveBestEffortPolicy, TrainingBatch};

    /// A retrain of 1000 samples dispatched at t=0, with 1000 new samples
    /// arriving by t=500ms.
    fn inflight_record(beta: f64) -> RetrainRecord {
        let mut record = RetrainRecord::new(500_000, 0.001, beta, 10.0);
        record.data_from_us = 1;
        record.data_to_us = 1;
        record.finished = false;
        record.training_batch = TrainingBatch {
            dispatch_us: 0,
            size: 1000,
        };
        record.batches = vec![
            Batch {
                arrival_us: 200_000,
                size: 500,
            },
            Batch {
                arrival_us: 500_000,
                size: 500,
            },
        ];
        record
    }

    #[test]
    fn first_retrain_window_is_last_arrival_only() {
        let record = RetrainRecord::new(1_000_000, 1.0, 1.0, 10.0);
        assert_eq!(
            SpeculativeBestEffortPolicy.ready_to_retrain(&record),
            Some(RetrainWindow::new(1_000_000, 1_000_000))
        );
    }

    #[test]
    fn cheap_restart_does_not_fire_speculatively() {
        // left = 1000 * 100 = 1e5, right = 2*(1e3 + 5e5*2) well above it.
        let record = inflight_record(100.0);
        assert_eq!(SpeculativeBestEffortPolicy.ready_to_retrain(&record), None);
    }

    #[test]
    fn expensive_setup_fires_overlapping_retrain() {
        // left = 1000 * 20000 = 2e7 dominates right = 2_002_000.
        let record = inflight_record(20_000.0);
        assert_eq!(
            SpeculativeBestEffortPolicy.ready_to_retrain(&record),
            Some(RetrainWindow::new(1, 500_000))
        );
    }

    #[test]
    fn naive_trigger_implies_speculative_trigger() {
        let naive = NaiveBestEffortPolicy;
        let speculative = SpeculativeBestEffortPolicy;

        let mut records = vec![
            RetrainRecord::new(1_000_000, 1.0, 1.0, 10.0),
            inflight_record(100.0),
            inflight_record(20_000.0),
        ];
        // Finished with new data after dispatch.
        let mut chained = RetrainRecord::new(2_000_000, 1.0, 1.0, 10.0);
        chained.data_from_us = 1;
        chained.data_to_us = 1_000_000;
        chained.training_batch = TrainingBatch {
            dispatch_us: 1_100_000,
            size: 5,
        };
        records.push(chained);

        for record in &records {
            if naive.ready_to_retrain(record).is_some() {
                assert!(
                    speculative.ready_to_retrain(record).is_some(),
                    "naive triggered but speculative did not: {record:?}"
                );
            }
        }
    }
}
