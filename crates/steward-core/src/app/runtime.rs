//! Runtime - エンジンの公開 API
//!
//! AppBuilder が組み立てたコンポーネントを 1 つにまとめます。
//! 呼び出し側（CLI・API サーバー）はこの型だけを使えばよい。
//!
//! - 投入・参照・キャンセル（Coordinator）
//! - 承認の決定・一覧・grant 管理（ApprovalGate）
//! - 実行（WorkerGroup）と sweep（PublisherLoop / ReaperLoop）の起動
//!
//! テナントをまたぐ参照は NotFound として扱います。

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::StewardConfig;
use crate::domain::{
    Approval, ApprovalGrant, ApprovalId, AuditLogEntry, GrantId, Task, TaskEvent, TaskId,
    TenantId, UserId, Verdict,
};
use crate::error::StewardError;

use super::approval_gate::ApprovalGate;
use super::context::Services;
use super::coordinator::{Coordinator, SubmitRequest};
use super::idempotency::Submission;
use super::publisher_loop::PublisherLoop;
use super::reaper_loop::{ReapReport, ReaperLoop};
use super::status::StatusCounts;
use super::worker_loop::{Handled, WorkerGroup, WorkerLoop};

pub struct Runtime {
    svc: Services,
    gate: ApprovalGate,
    coordinator: Coordinator,
    worker: Arc<WorkerLoop>,
}

impl Runtime {
    pub(crate) fn new(
        svc: Services,
        gate: ApprovalGate,
        coordinator: Coordinator,
        worker: Arc<WorkerLoop>,
    ) -> Self {
        Self {
            svc,
            gate,
            coordinator,
            worker,
        }
    }

    pub fn config(&self) -> &StewardConfig {
        &self.svc.config
    }

    // ---- tasks ----

    pub async fn submit_task(&self, req: SubmitRequest) -> Result<Submission, StewardError> {
        self.coordinator.submit_task(req).await
    }

    pub async fn get_task(&self, tenant: &TenantId, id: TaskId) -> Result<Task, StewardError> {
        self.coordinator.get_task(tenant, id).await
    }

    pub async fn cancel_task(
        &self,
        tenant: &TenantId,
        id: TaskId,
        actor: &str,
    ) -> Result<Task, StewardError> {
        self.coordinator.cancel_task(tenant, id, actor).await
    }

    /// タスクの遷移履歴（古い順）
    pub async fn task_events(
        &self,
        tenant: &TenantId,
        id: TaskId,
    ) -> Result<Vec<TaskEvent>, StewardError> {
        self.get_task(tenant, id).await?;
        Ok(self.svc.store.events_for(id).await?)
    }

    pub async fn task_audit(
        &self,
        tenant: &TenantId,
        id: TaskId,
    ) -> Result<Vec<AuditLogEntry>, StewardError> {
        self.get_task(tenant, id).await?;
        Ok(self.svc.auditor.log().for_task(id).await?)
    }

    pub async fn recent_audit(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, StewardError> {
        Ok(self.svc.auditor.log().recent(tenant, limit).await?)
    }

    /// `tenant` が None なら全テナント
    pub async fn status_counts(
        &self,
        tenant: Option<&TenantId>,
    ) -> Result<StatusCounts, StewardError> {
        let counts = self.svc.store.count_by_status(tenant).await?;
        Ok(StatusCounts::from_counts(&counts))
    }

    // ---- approvals ----

    pub async fn decide_approval(
        &self,
        tenant: &TenantId,
        approval_id: ApprovalId,
        verdict: Verdict,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Approval, StewardError> {
        match self.svc.store.get_approval(approval_id).await? {
            Some(approval) if &approval.tenant == tenant => {}
            _ => {
                return Err(StewardError::NotFound {
                    entity: "approval",
                    id: approval_id.to_string(),
                });
            }
        }
        self.gate
            .decide_approval(approval_id, verdict, actor, reason)
            .await
    }

    pub async fn bulk_resolve(
        &self,
        tenant: &TenantId,
        user: Option<&UserId>,
        verdict: Verdict,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Vec<Approval>, StewardError> {
        self.gate
            .bulk_resolve(tenant, user, verdict, actor, reason)
            .await
    }

    pub async fn list_pending_approvals(
        &self,
        tenant: &TenantId,
        user: Option<&UserId>,
    ) -> Result<Vec<Approval>, StewardError> {
        self.gate.list_pending_approvals(tenant, user).await
    }

    // ---- grants ----

    pub async fn issue_grant(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        ttl: Duration,
        issued_by: &str,
    ) -> Result<ApprovalGrant, StewardError> {
        self.gate
            .issue_grant(tenant, user, scope, ttl, issued_by)
            .await
    }

    pub async fn revoke_grant(
        &self,
        tenant: &TenantId,
        grant_id: GrantId,
        actor: &str,
    ) -> Result<ApprovalGrant, StewardError> {
        match self.svc.store.get_grant(grant_id).await? {
            Some(grant) if &grant.tenant == tenant => self.gate.revoke_grant(grant_id, actor).await,
            _ => Err(StewardError::NotFound {
                entity: "grant",
                id: grant_id.to_string(),
            }),
        }
    }

    pub async fn revoke_grants(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        actor: &str,
    ) -> Result<usize, StewardError> {
        self.gate.revoke_grants(tenant, user, scope, actor).await
    }

    // ---- background work ----

    /// 1 バッチ分だけ consume して実行する（テスト・単発実行用）
    pub async fn poll_once(&self, consumer: &str) -> Result<Vec<Handled>, StewardError> {
        self.worker
            .poll_once(consumer, self.svc.config.bus.poll_interval)
            .await
    }

    pub async fn reconcile_once(&self) -> Result<usize, StewardError> {
        PublisherLoop::new(self.svc.clone()).sweep_once().await
    }

    pub async fn reap_once(&self) -> Result<ReapReport, StewardError> {
        ReaperLoop::new(self.svc.clone(), self.gate.clone())
            .sweep_once()
            .await
    }

    /// executor pool と sweep を起動する
    ///
    /// 返り値の `shutdown_and_join()` で止める。
    pub fn start(&self) -> WorkerGroup {
        let workers = self.svc.config.executor.workers;
        let prefix = format!("executor-{}", self.svc.ids.next_ulid());
        let mut group = WorkerGroup::spawn(workers, &prefix, Arc::clone(&self.worker));

        let publisher = PublisherLoop::new(self.svc.clone());
        group.attach(move |rx| publisher.run(rx));
        let reaper = ReaperLoop::new(self.svc.clone(), self.gate.clone());
        group.attach(move |rx| reaper.run(rx));

        info!(workers, consumer_prefix = %prefix, "runtime started");
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::AppBuilder;
    use crate::app::test_support::request;
    use crate::domain::{RiskTier, TaskStatus};
    use crate::typed::handler::fixtures::{EchoHandler, PurgeHandler};
    use crate::typed::task::fixtures::{Echo, PurgeCache};
    use serde_json::json;

    fn runtime() -> Runtime {
        let mut config = StewardConfig::default();
        config.bus.poll_interval = Duration::from_millis(20);
        AppBuilder::new(config)
            .register::<Echo, _>(EchoHandler)
            .unwrap()
            .register::<PurgeCache, _>(PurgeHandler)
            .unwrap()
            .build()
            .unwrap()
    }

    fn acme() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    #[tokio::test]
    async fn typed_submission_runs_through_registry() {
        let rt = runtime();
        let req = SubmitRequest::typed(
            acme(),
            UserId::new("alice").unwrap(),
            &Echo { msg: "ping".into() },
            RiskTier::ReadOnly,
        )
        .unwrap();
        let sub = rt.submit_task(req).await.unwrap();

        rt.poll_once("rt-test").await.unwrap();
        let task = rt.get_task(&acme(), sub.task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result, Some(json!({ "echo": "ping", "attempt": 1 })));

        let statuses: Vec<TaskStatus> = rt
            .task_events(&acme(), task.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Succeeded]
        );

        let counts = rt.status_counts(Some(&acme())).await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn handler_requested_approval_round_trip() {
        let rt = runtime();
        let req = SubmitRequest::typed(
            acme(),
            UserId::new("alice").unwrap(),
            &PurgeCache { prefix: "img/".into(), dry_run: false },
            RiskTier::Mutating,
        )
        .unwrap();
        let sub = rt.submit_task(req).await.unwrap();

        rt.poll_once("rt-test").await.unwrap();
        let pending = rt.list_pending_approvals(&acme(), None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sub_scope.as_deref(), Some("purge img/"));

        rt.decide_approval(&acme(), pending[0].id, Verdict::Approve, "bob", None)
            .await
            .unwrap();
        rt.poll_once("rt-test").await.unwrap();

        let task = rt.get_task(&acme(), sub.task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result, Some(json!({ "purged": "img/" })));
    }

    #[tokio::test]
    async fn cross_tenant_access_is_not_found() {
        let rt = runtime();
        let sub = rt.submit_task(request(RiskTier::Privileged)).await.unwrap();
        let other = TenantId::new("globex").unwrap();

        assert!(matches!(
            rt.get_task(&other, sub.task.id).await,
            Err(StewardError::NotFound { entity: "task", .. })
        ));
        assert!(rt.task_audit(&other, sub.task.id).await.is_err());

        let pending = rt.list_pending_approvals(&acme(), None).await.unwrap();
        assert!(matches!(
            rt.decide_approval(&other, pending[0].id, Verdict::Approve, "mallory", None).await,
            Err(StewardError::NotFound { entity: "approval", .. })
        ));
        assert!(rt.list_pending_approvals(&other, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let rt = runtime();
        let sub = rt.submit_task(request(RiskTier::ReadOnly)).await.unwrap();
        let group = rt.start();
        assert_eq!(group.len(), rt.config().executor.workers + 2);

        for _ in 0..200 {
            if rt.get_task(&acme(), sub.task.id).await.unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        group.shutdown_and_join().await;
        assert_eq!(
            rt.get_task(&acme(), sub.task.id).await.unwrap().status,
            TaskStatus::Succeeded
        );
    }
}
