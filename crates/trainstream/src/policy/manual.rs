//! Policy that never triggers on its own; retrains fire only through the
//! explicit manual-trigger endpoint.

use super::{RetrainPolicy, RetrainRecord, RetrainWindow};

pub struct ManualPolicy;

impl RetrainPolicy for ManualPolicy {
    fn name(&self) -> &'static str {
        "ManualPolicy"
    }

    fn ready_to_retrain(&self, _record: &RetrainRecord) -> Option<RetrainWindow> {
        None
    }

    fn on_retrain_finished(&self, _record: &RetrainRecord) -> Option<RetrainWindow> {
        None
    }

    fn calc_timeout(&self, _record: &RetrainRecord) -> i64 {
        0
    }
}
