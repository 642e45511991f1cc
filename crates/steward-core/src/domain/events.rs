//! Events - TaskEvent（追記専用の遷移記録）
//!
//! 「時刻 T にタスク X がステータス S に遷移した（詳細 D）」という事実。
//! 挿入後は更新も削除もしません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EventId, TaskId};
use super::principal::TenantId;
use super::state::{TaskStatus, Transition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: EventId,
    pub task_id: TaskId,
    pub tenant: TenantId,

    /// None は作成イベント
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TaskStatus>,
    pub status: TaskStatus,
    pub reason: String,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    /// タスク作成時のイベント（QUEUED）
    pub fn created(id: EventId, task_id: TaskId, tenant: TenantId, at: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id,
            tenant,
            from: None,
            status: TaskStatus::Queued,
            reason: "created".to_string(),
            details: serde_json::Value::Null,
            at,
        }
    }

    /// 状態機械が返した遷移を記録用のイベントにする
    pub fn from_transition(
        id: EventId,
        task_id: TaskId,
        tenant: TenantId,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            tenant,
            from: Some(transition.from),
            status: transition.to,
            reason: transition.reason.clone(),
            details: transition.details.clone(),
            at,
        }
    }
}
