//! Auditor - 監査ログへの書き込み
//!
//! 監査の失敗で業務処理を止めません。書けなかったエントリは丸ごと `error!` に出します。

use std::sync::Arc;

use tracing::error;

use crate::domain::AuditRecord;
use crate::ports::{AuditLog, Clock, IdGenerator};

#[derive(Clone)]
pub struct Auditor {
    log: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Auditor {
    pub fn new(log: Arc<dyn AuditLog>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { log, clock, ids }
    }

    /// 読み取り用
    pub fn log(&self) -> &Arc<dyn AuditLog> {
        &self.log
    }

    pub async fn record(&self, record: AuditRecord) {
        let entry = record.into_entry(self.ids.audit_id(), self.clock.now());
        if let Err(err) = self.log.append(entry.clone()).await {
            error!(
                error = %err,
                audit_id = %entry.id,
                tenant = %entry.tenant,
                actor = %entry.actor,
                action = %entry.action,
                task_id = ?entry.task_id,
                details = %entry.details,
                at = %entry.at,
                "failed to write audit entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AuditLogEntry, TaskId, TenantId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{StoreError, SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenLog;

    #[async_trait]
    impl AuditLog for BrokenLog {
        async fn append(&self, _entry: AuditLogEntry) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }

        async fn recent(&self, _tenant: &TenantId, _limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn for_task(&self, _task_id: TaskId) -> Result<Vec<AuditLogEntry>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn auditor(log: Arc<dyn AuditLog>) -> Auditor {
        Auditor::new(log, Arc::new(SystemClock), Arc::new(UlidGenerator::new(SystemClock)))
    }

    #[tokio::test]
    async fn records_are_stamped_and_appended() {
        let store = InMemoryTaskStore::new();
        let tenant = TenantId::new("acme").unwrap();
        auditor(Arc::new(store.clone()))
            .record(AuditRecord::new(&tenant, "alice", "grant.issued").details(json!({"scope": "s"})))
            .await;

        let entries = store.recent(&tenant, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "alice");
        assert!(entries[0].id.to_string().starts_with("audit-"));
    }

    #[tokio::test]
    async fn write_failure_does_not_propagate() {
        let tenant = TenantId::new("acme").unwrap();
        auditor(Arc::new(BrokenLog))
            .record(AuditRecord::new(&tenant, "alice", "grant.issued"))
            .await;
    }
}
