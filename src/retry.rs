use chrono::TimeDelta;

use crate::model::ExecStatus;

/// Failed attempts are retried after a short fixed pause rather than at
/// the next cadence instant.
pub const RETRY_DELAY_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resume the normal cadence and reset the failure counter.
    Proceed,
    /// Try again after the given delay, holding the cadence.
    RetryIn(TimeDelta),
    /// The budget is spent. Reset the counter, go back to the cadence
    /// and treat this attempt as the terminal failure.
    GiveUp,
}

/// `retry_count` is the number of consecutive failures recorded before
/// this attempt. Persisting the updated counter is the caller's job.
pub fn decide(status: ExecStatus, retry_count: u32, retry_budget: u32) -> RetryDecision {
    match status {
        ExecStatus::Success => RetryDecision::Proceed,
        ExecStatus::Failure | ExecStatus::Timeout => {
            if retry_count < retry_budget {
                RetryDecision::RetryIn(TimeDelta::minutes(RETRY_DELAY_MINUTES))
            } else {
                RetryDecision::GiveUp
            }
        }
    }
}
