//! State - タスクのライフサイクル状態機械
//!
//! # 状態
//! - 初期: `QUEUED`
//! - 終端: `SUCCEEDED`, `FAILED`, `CANCELED`, `TIMED_OUT`
//!
//! # 合法な遷移
//! - `QUEUED → RUNNING`（executor が claim）
//! - `QUEUED → WAITING_APPROVAL`（実行前に承認が必要）
//! - `RUNNING → WAITING_APPROVAL`（実行途中のサブアクションに承認が必要）
//! - `RUNNING → SUCCEEDED | FAILED | TIMED_OUT | CANCELED`
//! - `WAITING_APPROVAL → RUNNING`（APPROVE）
//! - `WAITING_APPROVAL → CANCELED`（DENY）
//! - `WAITING_APPROVAL → TIMED_OUT`（approval の期限切れ）
//! - 非終端 `→ CANCELED`（明示的なキャンセル）
//!
//! # 設計原則
//! - 純粋関数: I/O なし。ストアの条件付き更新の「中」で使う
//! - 遷移表はこのファイルの `can_transition_to` だけが持つ

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::{IllegalTransition, ValidationError};

/// TaskStatus はタスクの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::WaitingApproval,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Canceled,
        TaskStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::WaitingApproval => "WAITING_APPROVAL",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::TimedOut => "TIMED_OUT",
        }
    }

    /// 終端状態かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::TimedOut
        )
    }

    /// 終端のうち「失敗」に分類されるもの（error フィールドを持つ）
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::TimedOut)
    }

    /// `self → to` が合法な辺かどうか
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, WaitingApproval)
                | (Queued, Canceled)
                | (Running, WaitingApproval)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Canceled)
                | (WaitingApproval, Running)
                | (WaitingApproval, Canceled)
                | (WaitingApproval, TimedOut)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::new(format!("unknown task status: {s}")))
    }
}

/// 合法と判定された遷移
///
/// `TaskEvent` の中身（from / to / reason / details）そのもので、
/// 呼び出し側が task_id・時刻・EventId を付けて記録します。
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
    pub details: serde_json::Value,
}

/// 状態機械の遷移関数
///
/// `(current, requested, reason)` から遷移を返すか、`IllegalTransition` を返す。
pub fn transition(
    current: TaskStatus,
    requested: TaskStatus,
    reason: impl Into<String>,
) -> Result<Transition, IllegalTransition> {
    if !current.can_transition_to(requested) {
        return Err(IllegalTransition {
            from: current,
            to: requested,
        });
    }
    Ok(Transition {
        from: current,
        to: requested,
        reason: reason.into(),
        details: serde_json::Value::Null,
    })
}

impl Transition {
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// 記録されたステータス列が合法な経路になっているか
///
/// 先頭は `QUEUED`、以降は隣り合う組がすべて合法な辺であること。
pub fn is_legal_history(statuses: &[TaskStatus]) -> bool {
    match statuses.first() {
        None => true,
        Some(TaskStatus::Queued) => statuses
            .windows(2)
            .all(|pair| pair[0].can_transition_to(pair[1])),
        Some(_) => false,
    }
}
