//! ApprovalNotifier port - 外部の判断チャネルへの通知
//!
//! チャット・Webhook などへの配信は core の外側にあります。
//! core は承認が必要になった・解決した・期限切れになったことを知らせるだけです。

use async_trait::async_trait;
use tracing::info;

use crate::domain::{Approval, Task};

#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn approval_requested(&self, task: &Task, approval: &Approval);

    async fn approval_resolved(&self, approval: &Approval);

    /// 期限切れ。要求者への通知に使う
    async fn approval_expired(&self, task: &Task, approval: &Approval);
}

/// ログに出すだけの既定実装
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl ApprovalNotifier for LoggingNotifier {
    async fn approval_requested(&self, task: &Task, approval: &Approval) {
        info!(
            task_id = %task.id,
            approval_id = %approval.id,
            tenant = %task.tenant,
            requester = %task.requester,
            risk_tier = %task.risk_tier,
            sub_scope = approval.sub_scope.as_deref().unwrap_or(""),
            expires_at = %approval.expires_at,
            "approval requested"
        );
    }

    async fn approval_resolved(&self, approval: &Approval) {
        info!(
            task_id = %approval.task_id,
            approval_id = %approval.id,
            decision = %approval.decision,
            decided_by = approval.decided_by.as_deref().unwrap_or(""),
            "approval resolved"
        );
    }

    async fn approval_expired(&self, task: &Task, approval: &Approval) {
        info!(
            task_id = %task.id,
            approval_id = %approval.id,
            requester = %task.requester,
            "approval expired; requester should be notified"
        );
    }
}
