//! Idempotency layer
//!
//! 一意性はストアの UNIQUE 制約が保証します。ここでの仕事は「挿入に負けたら
//! 勝者の行を読み直す」ことだけです。

use serde::Serialize;
use tracing::debug;

use crate::domain::{NewTask, Task, TaskEvent};
use crate::error::StewardError;
use crate::ports::StoreError;

use super::context::Services;

/// submit の結果。`was_new = false` なら既存タスクで、publish してはいけない
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub task: Task,
    pub was_new: bool,
}

impl Services {
    pub async fn create_or_get(&self, new: NewTask) -> Result<Submission, StewardError> {
        if let Some(key) = &new.idempotency_key
            && let Some(existing) = self
                .store
                .find_by_idempotency_key(&new.tenant, &new.requester, key)
                .await?
        {
            return Ok(Submission {
                task: existing,
                was_new: false,
            });
        }

        let now = self.now();
        let task = new.into_task(now);
        let created = TaskEvent::created(self.ids.event_id(), task.id, task.tenant.clone(), now);

        match self.store.insert_task(task.clone(), created).await {
            Ok(()) => Ok(Submission {
                task,
                was_new: true,
            }),
            Err(StoreError::Conflict(msg)) => {
                let Some(key) = task.idempotency_key.as_deref() else {
                    return Err(StoreError::Conflict(msg).into());
                };
                // 同じキーの並行 submit に負けた
                let winner = self
                    .store
                    .find_by_idempotency_key(&task.tenant, &task.requester, key)
                    .await?
                    .ok_or(StoreError::Conflict(msg))?;
                debug!(
                    task_id = %winner.id,
                    tenant = %winner.tenant,
                    idempotency_key = key,
                    "lost idempotent insert race; returning winner"
                );
                Ok(Submission {
                    task: winner,
                    was_new: false,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}
