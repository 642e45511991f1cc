//! TaskStore port - 永続状態の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスク（状態・結果・attempts・lease）
//! - TaskEvent（追記専用）
//! - Approval / ApprovalGrant
//!
//! # 設計原則
//! - ステータスの書き込みはすべて条件付き更新（compare-and-swap）
//! - CAS に負けた更新は `Ok(None)` / `Ok(false)` を返す。エラーではない
//! - 状態遷移と TaskEvent の挿入は同一トランザクション
//! - TaskEvent に更新・削除の経路は用意しない
//!
//! # 実装
//! - `impls::memory_store::InMemoryTaskStore`（テスト・単一プロセス用）
//! - `impls::sqlite_store::SqliteTaskStore`（永続化）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::{
    Approval, ApprovalGrant, ApprovalId, GrantId, Resolution, Task, TaskEvent, TaskId,
    TaskStatus, TenantId, UserId,
};

/// StoreError はストア操作のエラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// 一意制約違反（冪等キーの重複、PENDING approval の重複など）
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// CAS の期待値
///
/// `attempts` を指定すると、claim したワーカー以外の書き込みを弾くフェンスになる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expect {
    pub status: TaskStatus,
    pub attempts: Option<u32>,
}

impl Expect {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            attempts: None,
        }
    }

    pub fn fenced(status: TaskStatus, attempts: u32) -> Self {
        Self {
            status,
            attempts: Some(attempts),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        task.status == self.status && self.attempts.is_none_or(|a| a == task.attempts)
    }
}

/// ステータス遷移と同時に書き込む内容
///
/// lease は遷移のたびに解放される。
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub to: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub event: TaskEvent,
}

/// claim（実行権の取得）の内容
///
/// `QUEUED` からの claim は `QUEUED → RUNNING` の遷移なので `event` を持つ。
/// lease の切れた `RUNNING` の再 claim は遷移ではないので `event` は None。
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub lease_until: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub event: Option<TaskEvent>,
}

/// TaskStore は状態・履歴・承認の正本
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ---- tasks ----

    /// タスクと作成イベントを挿入する
    ///
    /// (tenant, requester, idempotency_key) が既にあれば `StoreError::Conflict`。
    async fn insert_task(&self, task: Task, created: TaskEvent) -> Result<(), StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        requester: &UserId,
        key: &str,
    ) -> Result<Option<Task>, StoreError>;

    /// 条件付きでステータスを遷移させ、イベントを追記する
    ///
    /// 期待値に一致しなければ何もせず `Ok(None)`。
    async fn apply_transition(
        &self,
        id: TaskId,
        expect: Expect,
        change: StatusChange,
    ) -> Result<Option<Task>, StoreError>;

    /// 実行権を取得する: `RUNNING`・attempts+1・lease 設定
    ///
    /// 期待値に一致しない、または lease が生きていれば `Ok(None)`。
    async fn claim(&self, id: TaskId, expect: Expect, claim: Claim)
    -> Result<Option<Task>, StoreError>;

    /// リトライ待ちのために lease を外す（ステータスは `RUNNING` のまま）
    async fn release_lease(
        &self,
        id: TaskId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// 再 publish したタスクの updated_at を進める
    async fn touch(
        &self,
        id: TaskId,
        expect: Expect,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// 配送待ち（`QUEUED`、または lease のない `RUNNING`）で、
    /// `updated_before` 以前から動いていないタスク
    async fn list_awaiting_delivery(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// lease が `lapsed_before` 以前に切れた `RUNNING` タスク
    async fn list_lapsed_leases(
        &self,
        lapsed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// PENDING approval を持たない `WAITING_APPROVAL` タスク
    ///
    /// approval の決定とタスクの遷移の間でプロセスが落ちた場合に残る。
    async fn list_stranded_waiting(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    async fn list_children(
        &self,
        tenant: &TenantId,
        parent_id: TaskId,
    ) -> Result<Vec<Task>, StoreError>;

    async fn count_by_status(
        &self,
        tenant: Option<&TenantId>,
    ) -> Result<BTreeMap<TaskStatus, u64>, StoreError>;

    /// タスクのイベント履歴（古い順）
    async fn events_for(&self, id: TaskId) -> Result<Vec<TaskEvent>, StoreError>;

    // ---- approvals ----

    /// PENDING approval を挿入する
    ///
    /// 同じタスクに PENDING が既にあれば `StoreError::Conflict`。
    async fn insert_approval(&self, approval: Approval) -> Result<(), StoreError>;

    async fn get_approval(&self, id: ApprovalId) -> Result<Option<Approval>, StoreError>;

    async fn pending_approval_for(&self, task_id: TaskId) -> Result<Option<Approval>, StoreError>;

    /// タスクの最新の approval（決定済みを含む）
    async fn latest_approval_for(&self, task_id: TaskId) -> Result<Option<Approval>, StoreError>;

    /// PENDING の approval だけを解決する。既に解決済みなら `Ok(None)`
    async fn resolve_approval(
        &self,
        id: ApprovalId,
        resolution: Resolution,
    ) -> Result<Option<Approval>, StoreError>;

    async fn list_pending_approvals(
        &self,
        tenant: &TenantId,
        user: Option<&UserId>,
    ) -> Result<Vec<Approval>, StoreError>;

    /// `expires_at <= now` の PENDING approval
    async fn list_expired_approvals(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Approval>, StoreError>;

    // ---- grants ----

    async fn insert_grant(&self, grant: ApprovalGrant) -> Result<(), StoreError>;

    async fn get_grant(&self, id: GrantId) -> Result<Option<ApprovalGrant>, StoreError>;

    /// (tenant, user, scope) に完全一致する有効な grant
    async fn find_active_grant(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalGrant>, StoreError>;

    /// `revoked_at` が未設定なら設定する。存在しなければ `Ok(None)`
    async fn revoke_grant(
        &self,
        id: GrantId,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalGrant>, StoreError>;

    /// (tenant, user, scope) の有効な grant をすべて失効させ、失効させたものを返す
    async fn revoke_grants(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalGrant>, StoreError>;
}
