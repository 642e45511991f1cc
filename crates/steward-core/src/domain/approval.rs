//! Approval - 人間の承認判断と、ゲートを免除する grant
//!
//! # 不変条件
//! - 1 タスクにつき有効な PENDING approval は高々 1 件
//! - 一度決定された approval は変更しない
//! - grant は `revoked_at` が None かつ `now < expires_at` のときだけ有効
//! - スコープの照合は完全一致（ワイルドカードなし）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::ValidationError;
use super::ids::{ApprovalId, GrantId, TaskId};
use super::principal::{TenantId, UserId};
use super::task::Task;

/// Approval の決定状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Pending,
    Approve,
    Deny,
    Expire,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Pending => "PENDING",
            ApprovalDecision::Approve => "APPROVE",
            ApprovalDecision::Deny => "DENY",
            ApprovalDecision::Expire => "EXPIRE",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalDecision::Pending)
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ApprovalDecision::Pending),
            "APPROVE" => Ok(ApprovalDecision::Approve),
            "DENY" => Ok(ApprovalDecision::Deny),
            "EXPIRE" => Ok(ApprovalDecision::Expire),
            other => Err(ValidationError::new(format!(
                "unknown approval decision: {other}"
            ))),
        }
    }
}

/// 人間（または operator）が下せる判断
///
/// EXPIRE は sweep だけが下すので含めない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    Deny,
}

impl From<Verdict> for ApprovalDecision {
    fn from(value: Verdict) -> Self {
        match value {
            Verdict::Approve => ApprovalDecision::Approve,
            Verdict::Deny => ApprovalDecision::Deny,
        }
    }
}

/// 1 タスクに紐づく承認リクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub task_id: TaskId,
    pub tenant: TenantId,
    pub requester: UserId,

    /// 実行途中で要求されたサブアクション（None なら実行前の承認）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_scope: Option<String>,

    /// 要求時点のタスクの attempts。再開後の初回 claim をリトライと区別する
    #[serde(default)]
    pub attempt: u32,

    pub decision: ApprovalDecision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
}

impl Approval {
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        id: ApprovalId,
        task_id: TaskId,
        tenant: TenantId,
        requester: UserId,
        sub_scope: Option<String>,
        attempt: u32,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            tenant,
            requester,
            sub_scope,
            attempt,
            decision: ApprovalDecision::Pending,
            reason: None,
            requested_at,
            expires_at,
            decided_at: None,
            decided_by: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.decision == ApprovalDecision::Pending
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// APPROVE されてから、まだ誰も claim していないか
    pub fn awaits_resume(&self, task: &Task) -> bool {
        self.decision == ApprovalDecision::Approve
            && self.task_id == task.id
            && self.attempt == task.attempts
    }
}

/// approval を解決するための入力
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub decision: ApprovalDecision,
    pub actor: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// (tenant, user, scope) に対する時限付きのゲート免除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGrant {
    pub id: GrantId,
    pub tenant: TenantId,
    pub user: UserId,
    pub scope: String,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApprovalGrant {
    /// 現時点で使える grant か
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }

    /// タスクの (tenant, requester, scope) に一致するか
    pub fn matches(&self, tenant: &TenantId, user: &UserId, scope: &str) -> bool {
        &self.tenant == tenant && &self.user == user && self.scope == scope
    }
}

/// DENY をどこまで波及させるか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelScope {
    /// 対象タスクだけをキャンセルする
    #[default]
    Task,
    /// 同じ parent_id を持つ非終端の兄弟タスクもキャンセルする
    Siblings,
}
