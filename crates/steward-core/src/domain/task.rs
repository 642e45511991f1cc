//! Task - ライフサイクルを追跡される 1 単位の作業
//!
//! フィールドを直接書き換える API は提供しません。状態の変更は必ず
//! `state::transition` を通し、ストアの条件付き更新で反映します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GrantId, TaskId};
use super::principal::{TenantId, UserId};
use super::risk::RiskTier;
use super::state::TaskStatus;
use super::task_type::TaskType;

/// Task レコード（ストアが唯一の所有者）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tenant: TenantId,
    pub requester: UserId,
    pub task_type: TaskType,

    /// (tenant, requester) 内で一意。None なら重複排除しない
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub status: TaskStatus,
    pub risk_tier: RiskTier,

    /// grant 照合に使うスコープ
    pub scope: String,

    /// 実行バックエンドだけが解釈する不透明なドキュメント
    pub payload: serde_json::Value,

    /// SUCCEEDED のときだけ設定される
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// FAILED / TIMED_OUT のときだけ設定される
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 単調非減少。claim ごとに +1 され、書き込みのフェンシングトークンを兼ねる
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,

    /// 承認ゲートを免除した grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_grant: Option<GrantId>,

    /// 実行中ワーカーの lease 期限。None なら誰も実行していない
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 他のワーカーが実行中（lease が生きている）か
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|until| until > now)
    }

    /// executor が claim してよい状態か
    ///
    /// - `QUEUED`
    /// - lease のない `RUNNING`（APPROVE 後の再開、またはリトライ待ち）
    /// - lease が切れた `RUNNING`（ワーカーのクラッシュ）
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Queued => true,
            TaskStatus::Running => !self.has_live_lease(now),
            _ => false,
        }
    }
}

/// 新規タスクの生成パラメータ（Coordinator が組み立てる）
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub id: TaskId,
    pub tenant: TenantId,
    pub requester: UserId,
    pub task_type: TaskType,
    pub idempotency_key: Option<String>,
    pub risk_tier: RiskTier,
    pub scope: String,
    pub payload: serde_json::Value,
    pub parent_id: Option<TaskId>,
    pub bypass_grant: Option<GrantId>,
}

impl NewTask {
    /// `QUEUED`・attempts 0 の Task にする
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: self.id,
            tenant: self.tenant,
            requester: self.requester,
            task_type: self.task_type,
            idempotency_key: self.idempotency_key,
            status: TaskStatus::Queued,
            risk_tier: self.risk_tier,
            scope: self.scope,
            payload: self.payload,
            result: None,
            error: None,
            attempts: 0,
            parent_id: self.parent_id,
            bypass_grant: self.bypass_grant,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
