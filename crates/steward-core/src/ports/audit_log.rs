//! AuditLog port - 追記専用の監査シンク
//!
//! 更新・削除のメソッドは持ちません。読み出しは運用とテストのためだけに提供します。

use async_trait::async_trait;

use crate::domain::{AuditLogEntry, TaskId, TenantId};
use crate::ports::StoreError;

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError>;

    /// テナントの監査ログ（新しい順、最大 `limit` 件）
    async fn recent(&self, tenant: &TenantId, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError>;

    /// タスクに紐づく監査ログ（古い順）
    async fn for_task(&self, task_id: TaskId) -> Result<Vec<AuditLogEntry>, StoreError>;
}
