pub mod scheduler_service;
pub mod server;

use crate::proto;
use crate::scheduler::job::{AttemptOutcome, JobPhase};

pub fn outcome_to_proto(outcome: AttemptOutcome) -> proto::AttemptOutcome {
    match outcome {
        AttemptOutcome::Success => proto::AttemptOutcome::Success,
        AttemptOutcome::Error => proto::AttemptOutcome::Error,
        AttemptOutcome::Cancelled => proto::AttemptOutcome::Cancelled,
        AttemptOutcome::TimedOut => proto::AttemptOutcome::TimedOut,
        AttemptOutcome::InFlight => proto::AttemptOutcome::Unspecified,
    }
}

pub fn outcome_from_proto(outcome: proto::AttemptOutcome) -> AttemptOutcome {
    match outcome {
        proto::AttemptOutcome::Success => AttemptOutcome::Success,
        proto::AttemptOutcome::Error | proto::AttemptOutcome::Unspecified => AttemptOutcome::Error,
        proto::AttemptOutcome::Cancelled => AttemptOutcome::Cancelled,
        proto::AttemptOutcome::TimedOut => AttemptOutcome::TimedOut,
    }
}

pub fn phase_to_proto(phase: JobPhase) -> proto::JobPhase {
    match phase {
        JobPhase::Map => proto::JobPhase::Map,
        JobPhase::Reduce => proto::JobPhase::Reduce,
        JobPhase::Completed => proto::JobPhase::Completed,
        JobPhase::Failed => proto::JobPhase::Failed,
    }
}
