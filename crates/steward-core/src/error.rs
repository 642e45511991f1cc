//! StewardError - エンジン全体のエラー
//!
//! 各層のエラー（`ValidationError`, `StoreError`, `BusError`, `ConfigError`）を
//! 呼び出し側に見せる 1 つの enum にまとめます。

use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{
    ApprovalDecision, ApprovalId, ErrorKind, IllegalTransition, TaskId, TaskStatus,
    ValidationError,
};
use crate::ports::{BusError, StoreError};

#[derive(Debug, Error)]
pub enum StewardError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("illegal transition for {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("approval {approval_id} already resolved as {decision}")]
    AlreadyResolved {
        approval_id: ApprovalId,
        decision: ApprovalDecision,
    },

    #[error("approval {0} expired before a decision was recorded")]
    ApprovalExpired(ApprovalId),

    #[error("delivery failed: {0}")]
    Delivery(#[from] BusError),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StewardError {
    pub fn illegal(task_id: TaskId, err: IllegalTransition) -> Self {
        StewardError::IllegalTransition {
            task_id,
            from: err.from,
            to: err.to,
        }
    }

    pub fn task_not_found(id: TaskId) -> Self {
        StewardError::NotFound {
            entity: "task",
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StewardError::Validation(_) => ErrorKind::Validation,
            StewardError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            StewardError::NotFound { .. } => ErrorKind::NotFound,
            StewardError::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            StewardError::AlreadyResolved { .. } => ErrorKind::Conflict,
            StewardError::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            StewardError::ApprovalExpired(_) => ErrorKind::Expired,
            StewardError::Delivery(_) => ErrorKind::Delivery,
            StewardError::Execution(_) => ErrorKind::Execution,
            StewardError::Store(_) | StewardError::Config(_) => ErrorKind::Infrastructure,
        }
    }
}
