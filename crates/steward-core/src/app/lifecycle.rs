//! Lifecycle - 状態機械とストアの CAS をつなぐ唯一の書き込み経路
//!
//! # フロー
//! 1. `state::transition(expect.status, to)` で遷移の合法性を判定（純粋関数）
//! 2. 合法なら TaskEvent を組み立て、`TaskStore::apply_transition` で CAS
//! 3. 勝った遷移だけ `task.lifecycle.<status>` を監査に書く
//!
//! 違法な遷移は `task.illegal_transition` として監査に残し、`IllegalTransition` を返す。
//! CAS 負けは `Ok(None)`（呼び出し側にとっては成功の no-op）。

use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::domain::audit::actions;
use crate::domain::state;
use crate::domain::{AuditRecord, IllegalTransition, Task, TaskEvent, TaskStatus};
use crate::error::StewardError;
use crate::ports::{Claim, Expect, StatusChange};

use super::context::Services;

/// 要求する遷移
#[derive(Debug, Clone, PartialEq)]
pub struct Move {
    pub to: TaskStatus,
    pub reason: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub details: Map<String, Value>,
}

impl Move {
    pub fn to(to: TaskStatus, reason: impl Into<String>) -> Self {
        Self {
            to,
            reason: reason.into(),
            result: None,
            error: None,
            details: Map::new(),
        }
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    fn event_details(&self) -> Value {
        let mut details = self.details.clone();
        details.insert("reason".into(), Value::String(self.reason.clone()));
        if let Some(result) = &self.result {
            details.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            details.insert("error".into(), Value::String(error.clone()));
        }
        Value::Object(details)
    }
}

impl Services {
    /// `expect` に一致するときだけ `task` を遷移させる
    pub async fn move_task(
        &self,
        task: &Task,
        expect: Expect,
        mv: Move,
        actor: &str,
    ) -> Result<Option<Task>, StewardError> {
        let transition = match state::transition(expect.status, mv.to, mv.reason.clone()) {
            Ok(t) => t.with_details(mv.event_details()),
            Err(illegal) => {
                warn!(
                    task_id = %task.id,
                    tenant = %task.tenant,
                    from = %illegal.from,
                    to = %illegal.to,
                    actor,
                    "illegal transition rejected"
                );
                self.auditor
                    .record(
                        AuditRecord::new(&task.tenant, actor, actions::TASK_ILLEGAL_TRANSITION)
                            .task(task.id)
                            .details(json!({
                                "from": illegal.from,
                                "to": illegal.to,
                                "reason": mv.reason,
                            })),
                    )
                    .await;
                return Err(StewardError::illegal(task.id, illegal));
            }
        };

        let now = self.now();
        let event = TaskEvent::from_transition(
            self.ids.event_id(),
            task.id,
            task.tenant.clone(),
            &transition,
            now,
        );
        let change = StatusChange {
            to: mv.to,
            result: mv.result,
            error: mv.error,
            event,
        };

        let Some(updated) = self.store.apply_transition(task.id, expect, change).await? else {
            debug!(
                task_id = %task.id,
                expected = %expect.status,
                expected_attempts = ?expect.attempts,
                to = %transition.to,
                "transition lost compare-and-swap; no-op"
            );
            return Ok(None);
        };

        debug!(
            task_id = %updated.id,
            from = %transition.from,
            to = %transition.to,
            attempts = updated.attempts,
            "task transitioned"
        );
        self.auditor
            .record(
                AuditRecord::new(&updated.tenant, actor, actions::lifecycle(transition.to))
                    .task(updated.id)
                    .details(json!({
                        "from": transition.from,
                        "to": transition.to,
                        "attempts": updated.attempts,
                        "event": transition.details,
                    })),
            )
            .await;
        Ok(Some(updated))
    }

    /// 実行権を取る（`RUNNING`・attempts+1・lease 設定）
    ///
    /// 期待値は読み取った `task` の (status, attempts)。`QUEUED` からの claim だけが
    /// 遷移イベントを伴う。
    pub async fn claim_task(
        &self,
        task: &Task,
        lease: Duration,
        actor: &str,
    ) -> Result<Option<Task>, StewardError> {
        let expect = Expect::fenced(task.status, task.attempts);
        let now = self.now();
        let event = match task.status {
            TaskStatus::Queued => {
                let transition = state::transition(
                    TaskStatus::Queued,
                    TaskStatus::Running,
                    "claimed by executor",
                )
                .map_err(|e| StewardError::illegal(task.id, e))?
                .with_details(json!({ "reason": "claimed by executor", "attempt": task.attempts + 1 }));
                Some(TaskEvent::from_transition(
                    self.ids.event_id(),
                    task.id,
                    task.tenant.clone(),
                    &transition,
                    now,
                ))
            }
            TaskStatus::Running => None,
            other => {
                return Err(StewardError::illegal(
                    task.id,
                    IllegalTransition {
                        from: other,
                        to: TaskStatus::Running,
                    },
                ));
            }
        };

        let claim = Claim {
            lease_until: super::context::deadline(now, lease),
            now,
            event,
        };
        let Some(claimed) = self.store.claim(task.id, expect, claim).await? else {
            debug!(task_id = %task.id, attempts = task.attempts, "claim lost; another worker owns the task");
            return Ok(None);
        };

        if task.status == TaskStatus::Queued {
            self.auditor
                .record(
                    AuditRecord::new(&claimed.tenant, actor, actions::lifecycle(TaskStatus::Running))
                        .task(claimed.id)
                        .details(json!({
                            "from": TaskStatus::Queued,
                            "to": TaskStatus::Running,
                            "attempts": claimed.attempts,
                        })),
                )
                .await;
        }
        Ok(Some(claimed))
    }
}
