//! ApprovalGate - 人間の判断でタスクを止める・進めるゲート
//!
//! # 責務
//! - `WAITING_APPROVAL` に入ったタスクに PENDING approval を作り、通知する
//! - 決定（APPROVE / DENY / EXPIRE）を approval に記録し、タスクに反映する
//! - grant の発行・失効
//!
//! # 設計原則
//! - approval の解決がタスク遷移より先。二重決定はストアの条件付き更新で 1 件だけが勝つ
//! - 決定とタスク遷移の間でプロセスが落ちた場合は reaper の `repair_stranded` が最新の
//!   決定を再適用する
//! - 待っているタスクはワーカーを占有しない。再開は bus への再 publish で行う
//! - grant はタスクが待ちに入った後には効かない（遡及的な自動承認はしない）

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::audit::{actions, actors};
use crate::domain::{
    Approval, ApprovalDecision, ApprovalGrant, ApprovalId, AuditRecord, CancelScope, Dispatch,
    GrantId, Resolution, Task, TaskStatus, TenantId, UserId, ValidationError, Verdict,
};
use crate::error::StewardError;
use crate::ports::{Expect, StoreError};

use super::context::Services;
use super::lifecycle::Move;

const CANCEL_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct ApprovalGate {
    svc: Services,
}

impl ApprovalGate {
    pub fn new(svc: Services) -> Self {
        Self { svc }
    }

    // ========================================
    // 承認の要求
    // ========================================

    /// タスクを `WAITING_APPROVAL` に移し、PENDING approval を作る
    ///
    /// CAS に負けた（タスクが既に別の状態に進んだ）場合は `Ok(None)`。
    pub async fn request_approval(
        &self,
        task: &Task,
        expect: Expect,
        sub_scope: Option<String>,
        actor: &str,
    ) -> Result<Option<(Task, Approval)>, StewardError> {
        let reason = match &sub_scope {
            Some(sub) => format!("sub-action {sub} requires approval"),
            None => format!("risk tier {} requires approval", task.risk_tier),
        };
        let mv = Move::to(TaskStatus::WaitingApproval, reason)
            .detail("risk_tier", json!(task.risk_tier))
            .detail("sub_scope", json!(sub_scope));
        let Some(waiting) = self.svc.move_task(task, expect, mv, actor).await? else {
            return Ok(None);
        };
        let approval = self.open_approval(&waiting, sub_scope, actor).await?;
        Ok(Some((waiting, approval)))
    }

    async fn open_approval(
        &self,
        task: &Task,
        sub_scope: Option<String>,
        actor: &str,
    ) -> Result<Approval, StewardError> {
        let now = self.svc.now();
        let approval = Approval::pending(
            self.svc.ids.approval_id(),
            task.id,
            task.tenant.clone(),
            task.requester.clone(),
            sub_scope,
            task.attempts,
            now,
            self.svc.deadline(self.svc.config.approval.ttl),
        );

        match self.svc.store.insert_approval(approval.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict(msg)) => {
                // 並行して同じタスクの approval が作られた
                return match self.svc.store.pending_approval_for(task.id).await? {
                    Some(existing) => Ok(existing),
                    None => Err(StoreError::Conflict(msg).into()),
                };
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            task_id = %task.id,
            approval_id = %approval.id,
            tenant = %task.tenant,
            risk_tier = %task.risk_tier,
            "approval requested"
        );
        self.svc
            .auditor
            .record(
                AuditRecord::new(&task.tenant, actor, actions::APPROVAL_REQUESTED)
                    .task(task.id)
                    .details(json!({
                        "approval_id": approval.id,
                        "requester": task.requester,
                        "risk_tier": task.risk_tier,
                        "scope": task.scope,
                        "sub_scope": approval.sub_scope,
                        "expires_at": approval.expires_at,
                    })),
            )
            .await;
        self.svc.notifier.approval_requested(task, &approval).await;
        Ok(approval)
    }

    // ========================================
    // 決定
    // ========================================

    /// 人間（または operator）の決定を記録してタスクに反映する
    pub async fn decide_approval(
        &self,
        approval_id: ApprovalId,
        verdict: Verdict,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Approval, StewardError> {
        let approval = self.load_approval(approval_id).await?;
        if approval.decision.is_resolved() {
            return Err(self.reject_second_decision(&approval, verdict, actor).await);
        }

        let now = self.svc.now();
        if approval.is_past_deadline(now) {
            self.expire(&approval).await?;
            return Err(StewardError::ApprovalExpired(approval_id));
        }

        let resolution = Resolution {
            decision: verdict.into(),
            actor: actor.to_string(),
            reason,
            at: now,
        };
        let Some(resolved) = self.svc.store.resolve_approval(approval_id, resolution).await? else {
            let current = self.load_approval(approval_id).await?;
            return Err(self.reject_second_decision(&current, verdict, actor).await);
        };

        info!(
            approval_id = %resolved.id,
            task_id = %resolved.task_id,
            decision = %resolved.decision,
            actor,
            "approval decided"
        );
        self.record_decision(&resolved, actor).await;
        self.svc.notifier.approval_resolved(&resolved).await;
        self.settle(&resolved, actor).await?;
        Ok(resolved)
    }

    async fn load_approval(&self, id: ApprovalId) -> Result<Approval, StewardError> {
        self.svc
            .store
            .get_approval(id)
            .await?
            .ok_or_else(|| StewardError::NotFound {
                entity: "approval",
                id: id.to_string(),
            })
    }

    async fn reject_second_decision(
        &self,
        approval: &Approval,
        attempted: Verdict,
        actor: &str,
    ) -> StewardError {
        warn!(
            approval_id = %approval.id,
            task_id = %approval.task_id,
            decision = %approval.decision,
            attempted = ?attempted,
            actor,
            "second decision on a resolved approval"
        );
        self.svc
            .auditor
            .record(
                AuditRecord::new(&approval.tenant, actor, actions::APPROVAL_ALREADY_RESOLVED)
                    .task(approval.task_id)
                    .details(json!({
                        "approval_id": approval.id,
                        "decision": approval.decision,
                        "decided_by": approval.decided_by,
                        "attempted": attempted,
                    })),
            )
            .await;
        StewardError::AlreadyResolved {
            approval_id: approval.id,
            decision: approval.decision,
        }
    }

    async fn record_decision(&self, approval: &Approval, actor: &str) {
        let action = match approval.decision {
            ApprovalDecision::Expire => actions::APPROVAL_EXPIRED,
            _ => actions::APPROVAL_DECIDED,
        };
        self.svc
            .auditor
            .record(
                AuditRecord::new(&approval.tenant, actor, action)
                    .task(approval.task_id)
                    .details(json!({
                        "approval_id": approval.id,
                        "decision": approval.decision,
                        "reason": approval.reason,
                        "sub_scope": approval.sub_scope,
                    })),
            )
            .await;
    }

    /// 解決済みの approval をタスクに反映する
    ///
    /// タスクが既に `WAITING_APPROVAL` でなければ決定の記録だけで終わる。
    async fn settle(&self, approval: &Approval, actor: &str) -> Result<Option<Task>, StewardError> {
        let Some(task) = self.svc.store.get_task(approval.task_id).await? else {
            warn!(approval_id = %approval.id, task_id = %approval.task_id, "approval refers to a missing task");
            return Ok(None);
        };
        if task.status != TaskStatus::WaitingApproval {
            debug!(
                task_id = %task.id,
                status = %task.status,
                decision = %approval.decision,
                "task no longer waiting; decision recorded only"
            );
            return Ok(None);
        }

        let expect = Expect::status(TaskStatus::WaitingApproval);
        let by = approval.decided_by.as_deref().unwrap_or(actor);
        match approval.decision {
            ApprovalDecision::Approve => {
                let mv = Move::to(TaskStatus::Running, format!("approved by {by}"))
                    .detail("approval_id", json!(approval.id));
                let Some(resumed) = self.svc.move_task(&task, expect, mv, actor).await? else {
                    return Ok(None);
                };
                self.svc
                    .publish_or_record(&resumed, Dispatch::Approved, actor)
                    .await;
                Ok(Some(resumed))
            }
            ApprovalDecision::Deny => {
                let reason = match &approval.reason {
                    Some(reason) => format!("denied by {by}: {reason}"),
                    None => format!("denied by {by}"),
                };
                let mv = Move::to(TaskStatus::Canceled, reason).detail("approval_id", json!(approval.id));
                let canceled = self.svc.move_task(&task, expect, mv, actor).await?;
                if canceled.is_some() && self.svc.config.approval.deny_cancel_scope == CancelScope::Siblings {
                    self.cancel_siblings(&task, actor).await?;
                }
                Ok(canceled)
            }
            ApprovalDecision::Expire => {
                let mv = Move::to(TaskStatus::TimedOut, "approval expired")
                    .error("approval expired")
                    .detail("approval_id", json!(approval.id));
                let timed_out = self.svc.move_task(&task, expect, mv, actor).await?;
                if let Some(timed_out) = &timed_out {
                    self.svc.notifier.approval_expired(timed_out, approval).await;
                }
                Ok(timed_out)
            }
            ApprovalDecision::Pending => Ok(None),
        }
    }

    async fn cancel_siblings(&self, denied: &Task, actor: &str) -> Result<usize, StewardError> {
        let Some(parent_id) = denied.parent_id else {
            return Ok(0);
        };
        let siblings = self.svc.store.list_children(&denied.tenant, parent_id).await?;
        let mut canceled = 0;
        for sibling in siblings
            .into_iter()
            .filter(|s| s.id != denied.id && !s.is_terminal())
        {
            let sibling_id = sibling.id;
            match self
                .cancel(sibling, actor, format!("sibling {} denied", denied.id))
                .await
            {
                Ok(_) => canceled += 1,
                Err(err) => warn!(task_id = %sibling_id, error = %err, "sibling cancel failed"),
            }
        }
        info!(task_id = %denied.id, parent_id = %parent_id, canceled, "denial cascaded to siblings");
        Ok(canceled)
    }

    // ========================================
    // キャンセル
    // ========================================

    /// タスクを `CANCELED` にする
    ///
    /// 承認待ちなら PENDING approval を DENY で閉じてから遷移させる。終端のタスクは
    /// `IllegalTransition`（監査に anomaly として残る）。
    pub async fn cancel(&self, mut task: Task, actor: &str, reason: String) -> Result<Task, StewardError> {
        for _ in 0..CANCEL_ATTEMPTS {
            if task.status == TaskStatus::WaitingApproval {
                self.deny_pending_for_cancel(&task, actor).await?;
            }
            let mv = Move::to(TaskStatus::Canceled, reason.clone());
            if let Some(canceled) = self
                .svc
                .move_task(&task, Expect::status(task.status), mv, actor)
                .await?
            {
                info!(task_id = %canceled.id, tenant = %canceled.tenant, actor, "task canceled");
                return Ok(canceled);
            }
            // 読み取り後に状態が変わった。読み直してやり直す
            task = self.svc.load_task(task.id).await?;
        }
        Err(StoreError::Conflict(format!("task {} kept changing while being canceled", task.id)).into())
    }

    async fn deny_pending_for_cancel(&self, task: &Task, actor: &str) -> Result<(), StewardError> {
        let Some(pending) = self.svc.store.pending_approval_for(task.id).await? else {
            return Ok(());
        };
        let resolution = Resolution {
            decision: ApprovalDecision::Deny,
            actor: actor.to_string(),
            reason: Some(format!("task canceled by {actor}")),
            at: self.svc.now(),
        };
        if let Some(resolved) = self.svc.store.resolve_approval(pending.id, resolution).await? {
            self.record_decision(&resolved, actor).await;
            self.svc.notifier.approval_resolved(&resolved).await;
        }
        Ok(())
    }

    // ========================================
    // sweep から呼ばれる処理
    // ========================================

    /// PENDING approval を EXPIRE にしてタスクを `TIMED_OUT` にする
    ///
    /// 既に解決済みなら `Ok(false)`。
    pub async fn expire(&self, approval: &Approval) -> Result<bool, StewardError> {
        let resolution = Resolution {
            decision: ApprovalDecision::Expire,
            actor: actors::REAPER.to_string(),
            reason: Some("approval expired".to_string()),
            at: self.svc.now(),
        };
        let Some(expired) = self.svc.store.resolve_approval(approval.id, resolution).await? else {
            return Ok(false);
        };
        info!(
            approval_id = %expired.id,
            task_id = %expired.task_id,
            expires_at = %expired.expires_at,
            "approval expired"
        );
        self.record_decision(&expired, actors::REAPER).await;
        self.settle(&expired, actors::REAPER).await?;
        Ok(true)
    }

    /// 期限を過ぎた PENDING approval をまとめて失効させる
    pub async fn expire_pending(&self, limit: usize) -> Result<usize, StewardError> {
        let due = self
            .svc
            .store
            .list_expired_approvals(self.svc.now(), limit)
            .await?;
        let mut expired = 0;
        for approval in &due {
            match self.expire(approval).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => warn!(approval_id = %approval.id, error = %err, "approval expiry failed"),
            }
        }
        Ok(expired)
    }

    /// PENDING approval を持たない `WAITING_APPROVAL` タスクを修復する
    ///
    /// 最新の決定を再適用する。approval が 1 件もなければ改めて要求する。
    pub async fn repair_stranded(&self, limit: usize) -> Result<usize, StewardError> {
        let stranded = self.svc.store.list_stranded_waiting(limit).await?;
        let mut repaired = 0;
        for task in &stranded {
            let latest = self.svc.store.latest_approval_for(task.id).await?;
            let outcome = match latest {
                None => self.open_approval(task, None, actors::REAPER).await.map(|_| true),
                Some(approval) if approval.is_pending() => Ok(false),
                Some(approval) => self
                    .settle(&approval, actors::REAPER)
                    .await
                    .map(|t| t.is_some()),
            };
            match outcome {
                Ok(true) => {
                    info!(task_id = %task.id, "repaired task stranded in WAITING_APPROVAL");
                    repaired += 1;
                }
                Ok(false) => {}
                Err(err) => warn!(task_id = %task.id, error = %err, "stranded task repair failed"),
            }
        }
        Ok(repaired)
    }

    // ========================================
    // 一括解決・一覧
    // ========================================

    /// operator による一括解決。1 件ずつ `decide_approval` を通す
    pub async fn bulk_resolve(
        &self,
        tenant: &TenantId,
        user: Option<&UserId>,
        verdict: Verdict,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Vec<Approval>, StewardError> {
        let pending = self.svc.store.list_pending_approvals(tenant, user).await?;
        let mut resolved = Vec::with_capacity(pending.len());
        for approval in pending {
            match self
                .decide_approval(approval.id, verdict, actor, reason.clone())
                .await
            {
                Ok(decided) => resolved.push(decided),
                Err(StewardError::AlreadyResolved { .. } | StewardError::ApprovalExpired(_)) => {
                    debug!(approval_id = %approval.id, "skipped during bulk resolution");
                }
                Err(err) => return Err(err),
            }
        }
        info!(tenant = %tenant, resolved = resolved.len(), actor, "bulk resolution finished");
        Ok(resolved)
    }

    pub async fn list_pending_approvals(
        &self,
        tenant: &TenantId,
        user: Option<&UserId>,
    ) -> Result<Vec<Approval>, StewardError> {
        Ok(self.svc.store.list_pending_approvals(tenant, user).await?)
    }

    // ========================================
    // grants
    // ========================================

    pub async fn issue_grant(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        ttl: Duration,
        issued_by: &str,
    ) -> Result<ApprovalGrant, StewardError> {
        if scope.trim().is_empty() {
            return Err(ValidationError::new("grant scope must not be empty").into());
        }
        let max_ttl = self.svc.config.grants.max_ttl;
        if ttl.is_zero() || ttl > max_ttl {
            return Err(ValidationError::new(format!(
                "grant ttl must be in (0, {}], got {}",
                humantime::format_duration(max_ttl),
                humantime::format_duration(ttl)
            ))
            .into());
        }

        let now = self.svc.now();
        let grant = ApprovalGrant {
            id: self.svc.ids.grant_id(),
            tenant: tenant.clone(),
            user: user.clone(),
            scope: scope.to_string(),
            issued_by: issued_by.to_string(),
            issued_at: now,
            expires_at: self.svc.deadline(ttl),
            revoked_at: None,
        };
        self.svc.store.insert_grant(grant.clone()).await?;

        info!(grant_id = %grant.id, tenant = %tenant, user = %user, scope, "grant issued");
        self.svc
            .auditor
            .record(
                AuditRecord::new(tenant, issued_by, actions::GRANT_ISSUED).details(json!({
                    "grant_id": grant.id,
                    "user": user,
                    "scope": scope,
                    "expires_at": grant.expires_at,
                })),
            )
            .await;
        Ok(grant)
    }

    /// grant を失効させる。失効済みならそのまま返す
    pub async fn revoke_grant(&self, grant_id: GrantId, actor: &str) -> Result<ApprovalGrant, StewardError> {
        let not_found = || StewardError::NotFound {
            entity: "grant",
            id: grant_id.to_string(),
        };
        let current = self.svc.store.get_grant(grant_id).await?.ok_or_else(not_found)?;
        if current.revoked_at.is_some() {
            debug!(grant_id = %grant_id, actor, "grant already revoked");
            return Ok(current);
        }
        let grant = self
            .svc
            .store
            .revoke_grant(grant_id, self.svc.now())
            .await?
            .ok_or_else(not_found)?;
        self.record_revocation(&grant, actor).await;
        Ok(grant)
    }

    /// (tenant, user, scope) の有効な grant をすべて失効させる
    pub async fn revoke_grants(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        actor: &str,
    ) -> Result<usize, StewardError> {
        let revoked = self
            .svc
            .store
            .revoke_grants(tenant, user, scope, self.svc.now())
            .await?;
        for grant in &revoked {
            self.record_revocation(grant, actor).await;
        }
        Ok(revoked.len())
    }

    async fn record_revocation(&self, grant: &ApprovalGrant, actor: &str) {
        info!(grant_id = %grant.id, tenant = %grant.tenant, user = %grant.user, actor, "grant revoked");
        self.svc
            .auditor
            .record(
                AuditRecord::new(&grant.tenant, actor, actions::GRANT_REVOKED).details(json!({
                    "grant_id": grant.id,
                    "user": grant.user,
                    "scope": grant.scope,
                    "revoked_at": grant.revoked_at,
                })),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::Harness;
    use crate::domain::RiskTier;
    use crate::ports::{AuditLog, TaskStore};
    use chrono::Duration as ChronoDuration;

    async fn waiting(h: &Harness) -> (Task, Approval) {
        let task = h.insert_task(RiskTier::Destructive).await;
        h.gate()
            .request_approval(&task, Expect::status(TaskStatus::Queued), None, "system:test")
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn request_creates_single_pending_approval() {
        let h = Harness::new().await;
        let (task, approval) = waiting(&h).await;
        assert_eq!(task.status, TaskStatus::WaitingApproval);
        assert!(approval.is_pending());
        assert_eq!(approval.expires_at, h.clock_now() + ChronoDuration::hours(1));
        assert_eq!(h.notifier.requested().len(), 1);

        let pending = h.gate().list_pending_approvals(&task.tenant, None).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn approve_resumes_and_republishes() {
        let h = Harness::new().await;
        let (task, approval) = waiting(&h).await;

        let decided = h
            .gate()
            .decide_approval(approval.id, Verdict::Approve, "bob", None)
            .await
            .unwrap();
        assert_eq!(decided.decision, ApprovalDecision::Approve);
        assert_eq!(decided.decided_by.as_deref(), Some("bob"));

        let resumed = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(resumed.status, TaskStatus::Running);
        assert!(resumed.lease_expires_at.is_none());
        assert_eq!(h.bus.backlog("tasks").await, 1);
    }

    #[tokio::test]
    async fn deny_cancels_with_reason() {
        let h = Harness::new().await;
        let (task, approval) = waiting(&h).await;

        h.gate()
            .decide_approval(approval.id, Verdict::Deny, "bob", Some("too risky".into()))
            .await
            .unwrap();
        let canceled = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);

        let events = h.store.events_for(task.id).await.unwrap();
        assert_eq!(events.last().unwrap().reason, "denied by bob: too risky");
        assert_eq!(h.bus.backlog("tasks").await, 0);
    }

    #[tokio::test]
    async fn second_decision_is_rejected_and_audited() {
        let h = Harness::new().await;
        let (task, approval) = waiting(&h).await;
        h.gate()
            .decide_approval(approval.id, Verdict::Approve, "bob", None)
            .await
            .unwrap();

        let err = h
            .gate()
            .decide_approval(approval.id, Verdict::Deny, "carol", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StewardError::AlreadyResolved { decision: ApprovalDecision::Approve, .. }
        ));
        assert!(
            h.audit_actions(task.id)
                .await
                .contains(&"approval.already_resolved".to_string())
        );
        assert_eq!(
            h.store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn late_decision_expires_instead() {
        let h = Harness::new().await;
        let (task, approval) = waiting(&h).await;
        h.clock.advance(ChronoDuration::hours(2));

        let err = h
            .gate()
            .decide_approval(approval.id, Verdict::Approve, "bob", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::ApprovalExpired(id) if id == approval.id));

        let task = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert_eq!(task.error.as_deref(), Some("approval expired"));
        assert_eq!(h.notifier.expired().len(), 1);
    }

    #[tokio::test]
    async fn expire_pending_sweeps_only_due_approvals() {
        let h = Harness::new().await;
        let (due_task, _) = waiting(&h).await;
        h.clock.advance(ChronoDuration::minutes(30));
        let (fresh_task, _) = waiting(&h).await;
        h.clock.advance(ChronoDuration::minutes(31));

        assert_eq!(h.gate().expire_pending(100).await.unwrap(), 1);
        assert_eq!(
            h.store.get_task(due_task.id).await.unwrap().unwrap().status,
            TaskStatus::TimedOut
        );
        assert_eq!(
            h.store.get_task(fresh_task.id).await.unwrap().unwrap().status,
            TaskStatus::WaitingApproval
        );
    }

    #[tokio::test]
    async fn cancel_while_waiting_denies_pending_approval() {
        let h = Harness::new().await;
        let (task, approval) = waiting(&h).await;

        let canceled = h
            .gate()
            .cancel(task, "alice", "canceled by alice".into())
            .await
            .unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);

        let approval = h.store.get_approval(approval.id).await.unwrap().unwrap();
        assert_eq!(approval.decision, ApprovalDecision::Deny);
        assert_eq!(approval.reason.as_deref(), Some("task canceled by alice"));
    }

    #[tokio::test]
    async fn repair_replays_latest_decision() {
        let h = Harness::new().await;
        let (task, approval) = waiting(&h).await;

        // approval だけ解決され、タスク遷移の前に落ちた状態
        h.store
            .resolve_approval(
                approval.id,
                Resolution {
                    decision: ApprovalDecision::Approve,
                    actor: "bob".into(),
                    reason: None,
                    at: h.clock_now(),
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.gate().repair_stranded(10).await.unwrap(), 1);
        assert_eq!(
            h.store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(h.gate().repair_stranded(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bulk_resolution_decides_each_pending_approval() {
        let h = Harness::new().await;
        let (a, _) = waiting(&h).await;
        let (b, _) = waiting(&h).await;

        let decided = h
            .gate()
            .bulk_resolve(&a.tenant, None, Verdict::Deny, "ops", Some("maintenance".into()))
            .await
            .unwrap();
        assert_eq!(decided.len(), 2);
        for id in [a.id, b.id] {
            assert_eq!(
                h.store.get_task(id).await.unwrap().unwrap().status,
                TaskStatus::Canceled
            );
            assert!(h.audit_actions(id).await.contains(&"approval.decided".to_string()));
        }
    }

    #[tokio::test]
    async fn grant_ttl_is_bounded() {
        let h = Harness::new().await;
        let tenant = TenantId::new("acme").unwrap();
        let user = UserId::new("alice").unwrap();

        for ttl in [Duration::ZERO, Duration::from_secs(25 * 3600)] {
            let err = h
                .gate()
                .issue_grant(&tenant, &user, "risk:destructive", ttl, "admin")
                .await
                .unwrap_err();
            assert!(matches!(err, StewardError::Validation(_)));
        }

        let grant = h
            .gate()
            .issue_grant(&tenant, &user, "risk:destructive", Duration::from_secs(600), "admin")
            .await
            .unwrap();
        assert!(grant.is_active(h.clock_now()));

        let revoked = h.gate().revoke_grant(grant.id, "admin").await.unwrap();
        assert!(revoked.revoked_at.is_some());
        assert!(matches!(
            h.gate().revoke_grant(GrantId::from_ulid(ulid::Ulid::new()), "admin").await,
            Err(StewardError::NotFound { entity: "grant", .. })
        ));
    }

    #[tokio::test]
    async fn revoking_twice_keeps_the_first_revocation() {
        let h = Harness::new().await;
        let tenant = TenantId::new("acme").unwrap();
        let user = UserId::new("alice").unwrap();
        let grant = h
            .gate()
            .issue_grant(&tenant, &user, "deploy", Duration::from_secs(600), "admin")
            .await
            .unwrap();

        let first = h.gate().revoke_grant(grant.id, "admin").await.unwrap();
        h.clock.advance(ChronoDuration::minutes(1));
        let second = h.gate().revoke_grant(grant.id, "oncall").await.unwrap();
        assert_eq!(second.id, grant.id);
        assert_eq!(second.revoked_at, first.revoked_at);

        let revocations = h
            .store
            .recent(&tenant, 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == actions::GRANT_REVOKED)
            .count();
        assert_eq!(revocations, 1);
    }

    #[tokio::test]
    async fn revoke_grants_covers_the_triple() {
        let h = Harness::new().await;
        let tenant = TenantId::new("acme").unwrap();
        let user = UserId::new("alice").unwrap();
        for _ in 0..2 {
            h.gate()
                .issue_grant(&tenant, &user, "deploy", Duration::from_secs(600), "admin")
                .await
                .unwrap();
        }
        h.gate()
            .issue_grant(&tenant, &user, "other", Duration::from_secs(600), "admin")
            .await
            .unwrap();

        assert_eq!(h.gate().revoke_grants(&tenant, &user, "deploy", "admin").await.unwrap(), 2);
        assert!(
            h.store
                .find_active_grant(&tenant, &user, "other", h.clock_now())
                .await
                .unwrap()
                .is_some()
        );
    }
}
