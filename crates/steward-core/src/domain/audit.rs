//! Audit - 追記専用の監査ログ
//!
//! ビジネスロジックからは参照しない書き込み専用のシンク。
//! エラー経路でも書き込みを省略しません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AuditId, TaskId};
use super::principal::TenantId;

/// 監査アクション名
pub mod actions {
    pub const TASK_SUBMITTED: &str = "task.submitted";
    pub const TASK_DUPLICATE_OBSERVED: &str = "task.duplicate_observed";
    pub const TASK_DELIVERY_FAILED: &str = "task.delivery_failed";
    pub const TASK_ILLEGAL_TRANSITION: &str = "task.illegal_transition";
    pub const TASK_EXECUTION_STARTED: &str = "task.execution.started";
    pub const TASK_RETRY_SCHEDULED: &str = "task.execution.retry_scheduled";
    pub const TASK_RECLAIMED: &str = "task.reclaimed";
    pub const TASK_REPUBLISHED: &str = "task.republished";
    pub const POLICY_BYPASS_APPLIED: &str = "policy.bypass.applied";
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    pub const APPROVAL_DECIDED: &str = "approval.decided";
    pub const APPROVAL_ALREADY_RESOLVED: &str = "approval.already_resolved";
    pub const APPROVAL_EXPIRED: &str = "approval.expired";
    pub const GRANT_ISSUED: &str = "grant.issued";
    pub const GRANT_REVOKED: &str = "grant.revoked";

    /// `task.lifecycle.<status>`（例: `task.lifecycle.running`）
    pub fn lifecycle(status: crate::domain::TaskStatus) -> String {
        format!("task.lifecycle.{}", status.as_str().to_ascii_lowercase())
    }
}

/// 監査エントリを書き込むプロセス内の主体
pub mod actors {
    pub const COORDINATOR: &str = "system:coordinator";
    pub const EXECUTOR: &str = "system:executor";
    pub const RECONCILER: &str = "system:reconciler";
    pub const REAPER: &str = "system:reaper";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditId,
    pub tenant: TenantId,
    pub actor: String,
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// 採番前の監査エントリ
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub tenant: TenantId,
    pub actor: String,
    pub action: String,
    pub task_id: Option<TaskId>,
    pub details: serde_json::Value,
}

impl AuditRecord {
    pub fn new(tenant: &TenantId, actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            tenant: tenant.clone(),
            actor: actor.into(),
            action: action.into(),
            task_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn into_entry(self, id: AuditId, at: DateTime<Utc>) -> AuditLogEntry {
        AuditLogEntry {
            id,
            tenant: self.tenant,
            actor: self.actor,
            action: self.action,
            task_id: self.task_id,
            details: self.details,
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;

    #[test]
    fn lifecycle_action_names() {
        assert_eq!(actions::lifecycle(TaskStatus::Running), "task.lifecycle.running");
        assert_eq!(
            actions::lifecycle(TaskStatus::WaitingApproval),
            "task.lifecycle.waiting_approval"
        );
    }
}
