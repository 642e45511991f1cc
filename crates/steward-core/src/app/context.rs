//! Services - app 層のコンポーネントが共有する依存一式
//!
//! Coordinator・ApprovalGate・WorkerLoop・各 sweep はすべて同じ `Services` を
//! clone して持ちます。中身は `Arc` なので clone は安価です。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use crate::config::StewardConfig;
use crate::domain::audit::actions;
use crate::domain::{AuditRecord, Dispatch, Task, TaskEnvelope, TaskId};
use crate::error::StewardError;
use crate::ports::{ApprovalNotifier, Clock, IdGenerator, MessageId, TaskBus, TaskStore};

use super::audit::Auditor;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn TaskStore>,
    pub bus: Arc<dyn TaskBus>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub auditor: Auditor,
    pub notifier: Arc<dyn ApprovalNotifier>,
    pub config: Arc<StewardConfig>,
}

impl Services {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// `now + d`。範囲外になる値は上限に丸める
    pub fn deadline(&self, d: Duration) -> DateTime<Utc> {
        deadline(self.now(), d)
    }

    pub async fn load_task(&self, id: TaskId) -> Result<Task, StewardError> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| StewardError::task_not_found(id))
    }

    pub async fn publish(&self, task: &Task, dispatch: Dispatch) -> Result<MessageId, StewardError> {
        let envelope = TaskEnvelope::new(task.id, task.tenant.clone(), dispatch);
        let id = self
            .bus
            .publish(&self.config.bus.task_stream, envelope.to_json())
            .await?;
        Ok(id)
    }

    /// publish の失敗を呼び出し側に返さない版
    ///
    /// 失敗したタスクはストアに残っているので reconciliation sweep が拾います。
    pub async fn publish_or_record(&self, task: &Task, dispatch: Dispatch, actor: &str) -> bool {
        match self.publish(task, dispatch).await {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    task_id = %task.id,
                    tenant = %task.tenant,
                    dispatch = ?dispatch,
                    error = %err,
                    "publish failed; reconciliation will redeliver"
                );
                self.auditor
                    .record(
                        AuditRecord::new(&task.tenant, actor, actions::TASK_DELIVERY_FAILED)
                            .task(task.id)
                            .details(json!({
                                "dispatch": dispatch,
                                "status": task.status,
                                "error": err.to_string(),
                            })),
                    )
                    .await;
                false
            }
        }
    }
}

/// 9999-12-31T23:59:59Z。これより先は RFC3339 の 4 桁年に収まらず、文字列比較の順序が壊れる
const LATEST_SECS: i64 = 253_402_300_799;

/// 0001-01-01T00:00:00Z
const EARLIEST_SECS: i64 = -62_135_596_800;

fn latest() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earliest() -> DateTime<Utc> {
    DateTime::from_timestamp(EARLIEST_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn deadline(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or_else(latest, |at| at.min(latest()))
}

/// `now - d`。範囲外になる値は下限に丸める
pub(crate) fn ago(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .map_or_else(earliest, |at| at.max(earliest()))
}
