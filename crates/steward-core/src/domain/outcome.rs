//! Outcome model: what an execution backend reports back.
//!
//! The core never inspects `result` or `error` beyond storing them on the task.

use serde::{Deserialize, Serialize};

/// Result of one call into the execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Work finished; `result` is stored on the task.
    Succeeded { result: serde_json::Value },

    /// Work failed. `retryable` failures are retried while attempts remain.
    Failed { error: String, retryable: bool },

    /// A sub-action needs a human decision before the task may continue.
    NeedsApproval { sub_scope: String },
}

impl ExecutionOutcome {
    pub fn succeeded(result: serde_json::Value) -> Self {
        Self::Succeeded { result }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn needs_approval(sub_scope: impl Into<String>) -> Self {
        Self::NeedsApproval {
            sub_scope: sub_scope.into(),
        }
    }
}
