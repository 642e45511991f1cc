//! Decision model: what the executor does with an outcome.
//!
//! The Decider is a pure function: given the claimed task and the outcome of
//! the attempt, it returns the next action without side effects. The executor
//! applies the decision through the store.

use std::time::Duration;

use super::outcome::ExecutionOutcome;
use super::retry::RetryPolicy;
use super::task::Task;

/// The next action to take for a claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Record `SUCCEEDED` with the result.
    Succeed { result: serde_json::Value },

    /// Release the lease and redeliver after `delay`.
    Retry { delay: Duration, reason: String },

    /// Record terminal `FAILED`.
    Fail { error: String },

    /// Move to `WAITING_APPROVAL` for a sub-action.
    AwaitApproval { sub_scope: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, outcome: ExecutionOutcome) -> Decision;
}

/// Attempt-bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            retry_policy,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, outcome: ExecutionOutcome) -> Decision {
        match outcome {
            ExecutionOutcome::Succeeded { result } => Decision::Succeed { result },
            ExecutionOutcome::NeedsApproval { sub_scope } => Decision::AwaitApproval { sub_scope },
            ExecutionOutcome::Failed { error, retryable: false } => Decision::Fail { error },
            ExecutionOutcome::Failed { error, retryable: true } => {
                if task.attempts >= self.max_attempts {
                    Decision::Fail {
                        error: format!(
                            "{error} (max attempts reached: {}/{})",
                            task.attempts, self.max_attempts
                        ),
                    }
                } else {
                    let delay = self.retry_policy.next_delay(task.attempts);
                    Decision::Retry {
                        delay,
                        reason: format!(
                            "{error} (retry {}/{} after {:?})",
                            task.attempts + 1,
                            self.max_attempts,
                            delay
                        ),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RiskTier;
    use crate::domain::task::fixtures;
    use chrono::Utc;

    fn task_with_attempts(attempts: u32) -> Task {
        let mut task = fixtures::new_task(RiskTier::ReadOnly).into_task(Utc::now());
        task.attempts = attempts;
        task
    }

    #[test]
    fn retryable_failure_retries_while_attempts_remain() {
        let decider = DefaultDecider::new(RetryPolicy::default(), 3);
        let decision = decider.decide(&task_with_attempts(1), ExecutionOutcome::retryable("flaky"));
        assert!(matches!(decision, Decision::Retry { delay, .. } if delay == Duration::from_secs(2)));
    }

    #[test]
    fn retryable_failure_fails_at_max_attempts() {
        let decider = DefaultDecider::new(RetryPolicy::default(), 3);
        let decision = decider.decide(&task_with_attempts(3), ExecutionOutcome::retryable("flaky"));
        assert!(matches!(decision, Decision::Fail { error } if error.contains("max attempts")));
    }

    #[test]
    fn permanent_failure_never_retries() {
        let decider = DefaultDecider::new(RetryPolicy::default(), 3);
        let decision = decider.decide(&task_with_attempts(1), ExecutionOutcome::failed("bad input"));
        assert_eq!(
            decision,
            Decision::Fail {
                error: "bad input".to_string()
            }
        );
    }

    #[test]
    fn success_and_approval_pass_through() {
        let decider = DefaultDecider::new(RetryPolicy::default(), 3);
        let task = task_with_attempts(1);
        assert!(matches!(
            decider.decide(&task, ExecutionOutcome::succeeded(serde_json::json!(1))),
            Decision::Succeed { .. }
        ));
        assert_eq!(
            decider.decide(&task, ExecutionOutcome::needs_approval("rm")),
            Decision::AwaitApproval {
                sub_scope: "rm".to_string()
            }
        );
    }
}
