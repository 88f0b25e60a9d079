//! Retrain as soon as any untrained data exists.

use super::{follow_up_window, RetrainPolicy, RetrainRecord, RetrainWindow};

pub struct NaiveBestEffortPolicy;

impl RetrainPolicy for NaiveBestEffortPolicy {
    fn name(&self) -> &'static str {
        "NaiveBestEffortPolicy"
    }

    fn ready_to_retrain(&self, record: &RetrainRecord) -> Option<RetrainWindow> {
        if record.never_trained() {
            return Some(RetrainWindow::new(1, record.last_arrival_us));
        }
        follow_up_window(record)
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
    use crate::policy::{Batch, TrainingBatch};

    fn trained_record() -> RetrainRecord {
        let mut record = RetrainRecord::new(1_000_000, 1.0, 1.0, 10.0);
        record.data_from_us = 1;
        record.data_to_us = 1_000_000;
        record.training_batch = TrainingBatch {
            dispatch_us: 1_100_000,
            size: 5,
        };
        record
    }

    #[test]
    fn first_retrain_covers_from_one() {
        let record = RetrainRecord::new(1_000_000, 1.0, 1.0, 10.0);
        assert_eq!(
            NaiveBestEffortPolicy.ready_to_retrain(&record),
            Some(RetrainWindow::new(1, 1_000_000))
        );
    }

    #[test]
    fn negative_data_from_counts_as_never_trained() {
        let mut record = RetrainRecord::new(2_000_000, 1.0, 1.0, 10.0);
        record.data_from_us = -5;
        assert_eq!(
            NaiveBestEffortPolicy.ready_to_retrain(&record),
            Some(RetrainWindow::new(1, 2_000_000))
        );
    }

    #[test]
    fn new_data_after_finish_chains_from_window_end() {
        let mut record = trained_record();
        record.last_arrival_us = 2_000_000;
        record.batches = vec![Batch {
            arrival_us: 2_000_000,
            size: 3,
        }];
        let expected = Some(RetrainWindow::new(1_000_001, 2_000_000));
        assert_eq!(NaiveBestEffortPolicy.ready_to_retrain(&record), expected);
        assert_eq!(NaiveBestEffortPolicy.on_retrain_finished(&record), expected);
    }

    #[test]
    fn no_trigger_without_new_data_or_while_running() {
        let record = trained_record();
        assert_eq!(NaiveBestEffortPolicy.ready_to_retrain(&record), None);

        let mut running = trained_record();
        running.finished = false;
        running.last_arrival_us = 2_000_000;
        assert_eq!(NaiveBestEffortPolicy.ready_to_retrain(&running), None);
    }

    #[test]
    fn never_arms_a_timer() {
        assert_eq!(NaiveBestEffortPolicy.calc_timeout(&trained_record()), 0);
    }
}
