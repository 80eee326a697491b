//! Job state machine
//!
//! A fixed table of legal `JobStatus` transitions. Every status change the
//! orchestrator makes is checked against it. Terminal states accept no
//! further transitions, and `rollingBack` can only end in a terminal state.

use crate::error::EngineError;
use crate::types::JobStatus;

/// Validates a job status transition.
///
/// The orchestrator is the only caller that mutates job status; every
/// mutation goes through here.
///
/// # Errors
/// Returns `EngineError::IllegalStateTransition` when `to` is not reachable
/// from `from`.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), EngineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::IllegalStateTransition { from, to })
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: JobStatus) -> Vec<JobStatus> {
    use JobStatus::*;
    match from {
        // abort before validation starts: nothing touched, no-op plan
        Pending => vec![Validating, RolledBack],
        Validating => vec![Running, Rejected, RollingBack],
        Running => vec![PausedManual, PausedDegraded, Completing, RollingBack],
        PausedManual => vec![Running, RollingBack],
        PausedDegraded => vec![Running, RollingBack],
        Completing => vec![Completed, RollingBack],
        RollingBack => vec![RolledBack, RollbackFailed],
        Completed => vec![],
        RolledBack => vec![],
        RollbackFailed => vec![],
        Rejected => vec![],
    }
}

fn allowed(from: JobStatus, to: JobStatus) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pause_resume_cycle() {
        assert!(validate_transition(JobStatus::Running, JobStatus::PausedManual).is_ok());
        assert!(validate_transition(JobStatus::PausedManual, JobStatus::Running).is_ok());
        assert!(validate_transition(JobStatus::Running, JobStatus::PausedDegraded).is_ok());
        assert!(validate_transition(JobStatus::PausedDegraded, JobStatus::Running).is_ok());

        // Invalid
        assert!(validate_transition(JobStatus::PausedManual, JobStatus::PausedDegraded).is_err());
        assert!(validate_transition(JobStatus::Validating, JobStatus::PausedManual).is_err());
    }

    #[test]
    fn rollback_always_ends_terminal() {
        let next = allowed_transitions(JobStatus::RollingBack);
        assert!(next.iter().all(|s| s.is_terminal()));
        assert!(!next.contains(&JobStatus::Running));
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for status in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(allowed_transitions(status).is_empty(), "{status} has exits");
        }
    }

    #[test]
    fn every_non_terminal_state_can_reach_a_rollback() {
        for status in JobStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            let next = allowed_transitions(status);
            assert!(
                next.contains(&JobStatus::RollingBack) || next.contains(&JobStatus::RolledBack),
                "{status} cannot be aborted"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_validate_matches_table(
            from in prop::sample::select(JobStatus::ALL.to_vec()),
            to in prop::sample::select(JobStatus::ALL.to_vec()),
        ) {
            let res = validate_transition(from, to);
            let allowed = allowed_transitions(from);

            if res.is_ok() {
                prop_assert!(allowed.contains(&to));
            } else {
                prop_assert!(!allowed.contains(&to));
            }
        }
    }
}
