//! Coordinator - タスク投入の入口
//!
//! # フロー（submit_task）
//! 1. 入力検証（リスク区分がポリシー表にあるか、スコープ、親タスク）
//! 2. 冪等キーで既存タスクを探す。あればそのまま返す（publish しない）
//! 3. 承認が必要な区分なら、要求者の有効な grant を探す。なければユーザー単位の
//!    bypass モード（テナントの `allow_user_bypass` が true のときだけ有効）を見る
//! 4. `QUEUED` で永続化（同じキーの並行投入は勝者の行を返す）
//! 5. grant も bypass もなく承認が必要 → ApprovalGate へ。それ以外 → bus に publish
//!
//! # 設計原則
//! - persist-then-publish。永続化に失敗したタスクは publish しない
//! - publish の失敗は呼び出し側に返さない。reconciliation sweep が再配送する
//! - 冪等ヒットはエラーではない（`was_new = false`）

use serde_json::{Value, json};
use tracing::info;

use crate::domain::audit::{actions, actors};
use crate::domain::{
    AuditRecord, Dispatch, NewTask, RiskTier, Task, TaskId, TaskStatus, TaskType, TenantId, UserId,
    ValidationError,
};
use crate::error::StewardError;
use crate::ports::Expect;
use crate::typed::{PayloadCodec, TypedTask};

use super::approval_gate::ApprovalGate;
use super::context::Services;
use super::idempotency::Submission;

/// タスク投入リクエスト
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub tenant: TenantId,
    pub requester: UserId,
    pub task_type: TaskType,
    pub payload: Value,
    pub risk_tier: RiskTier,
    pub idempotency_key: Option<String>,
    /// grant 照合用スコープ。None ならポリシー表の既定値
    pub scope: Option<String>,
    pub parent_id: Option<TaskId>,
}

impl SubmitRequest {
    pub fn new(
        tenant: TenantId,
        requester: UserId,
        task_type: TaskType,
        payload: Value,
        risk_tier: RiskTier,
    ) -> Self {
        Self {
            tenant,
            requester,
            task_type,
            payload,
            risk_tier,
            idempotency_key: None,
            scope: None,
            parent_id: None,
        }
    }

    /// 型付きペイロードから作る。task_type は `T::TYPE`
    pub fn typed<T: TypedTask>(
        tenant: TenantId,
        requester: UserId,
        input: &T,
        risk_tier: RiskTier,
    ) -> Result<Self, StewardError> {
        let task_type = TaskType::new(T::TYPE)?;
        let payload = PayloadCodec::encode(input)
            .map_err(|e| ValidationError::new(e.to_string()))?;
        Ok(Self::new(tenant, requester, task_type, payload, risk_tier))
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

#[derive(Clone)]
pub struct Coordinator {
    svc: Services,
    gate: ApprovalGate,
}

impl Coordinator {
    pub fn new(svc: Services, gate: ApprovalGate) -> Self {
        Self { svc, gate }
    }

    pub async fn submit_task(&self, req: SubmitRequest) -> Result<Submission, StewardError> {
        // (1) 検証。ここで失敗したものは何も永続化しない
        let policy = &self.svc.config.policy;
        let requires_approval = policy.requires_approval(req.risk_tier)?;
        let scope = policy.scope_for(req.risk_tier, req.scope.as_deref())?;
        if req
            .idempotency_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            return Err(ValidationError::new("idempotency key must not be empty").into());
        }
        if let Some(parent_id) = req.parent_id {
            match self.svc.store.get_task(parent_id).await? {
                Some(parent) if parent.tenant == req.tenant => {}
                _ => {
                    return Err(ValidationError::new(format!(
                        "parent task {parent_id} does not exist in tenant {}",
                        req.tenant
                    ))
                    .into());
                }
            }
        }

        // (2) 冪等キー
        if let Some(key) = &req.idempotency_key
            && let Some(existing) = self
                .svc
                .store
                .find_by_idempotency_key(&req.tenant, &req.requester, key)
                .await?
        {
            self.observe_duplicate(&existing, key).await;
            return Ok(Submission {
                task: existing,
                was_new: false,
            });
        }

        // (3) grant、なければ bypass モード
        let grant = if requires_approval {
            self.svc
                .store
                .find_active_grant(&req.tenant, &req.requester, &scope, self.svc.now())
                .await?
        } else {
            None
        };
        let bypass_mode = if requires_approval && grant.is_none() {
            self.svc
                .config
                .bypass
                .bypass_for(&req.tenant, &req.requester, req.risk_tier)
        } else {
            None
        };

        // (4) 永続化
        let new = NewTask {
            id: self.svc.ids.task_id(),
            tenant: req.tenant,
            requester: req.requester,
            task_type: req.task_type,
            idempotency_key: req.idempotency_key,
            risk_tier: req.risk_tier,
            scope,
            payload: req.payload,
            parent_id: req.parent_id,
            bypass_grant: grant.as_ref().map(|g| g.id),
        };
        let submission = self.svc.create_or_get(new).await?;
        if !submission.was_new {
            if let Some(key) = submission.task.idempotency_key.as_deref() {
                self.observe_duplicate(&submission.task, key).await;
            }
            return Ok(submission);
        }
        let task = submission.task;

        info!(
            task_id = %task.id,
            tenant = %task.tenant,
            requester = %task.requester,
            task_type = %task.task_type,
            risk_tier = %task.risk_tier,
            requires_approval,
            bypass_grant = ?task.bypass_grant,
            bypass_mode = ?bypass_mode,
            "task submitted"
        );
        self.svc
            .auditor
            .record(
                AuditRecord::new(&task.tenant, task.requester.as_str(), actions::TASK_SUBMITTED)
                    .task(task.id)
                    .details(json!({
                        "task_type": task.task_type,
                        "risk_tier": task.risk_tier,
                        "scope": task.scope,
                        "requires_approval": requires_approval,
                        "idempotency_key": task.idempotency_key,
                        "parent_id": task.parent_id,
                    })),
            )
            .await;

        if let Some(grant) = &grant {
            self.svc
                .auditor
                .record(
                    AuditRecord::new(&task.tenant, actors::COORDINATOR, actions::POLICY_BYPASS_APPLIED)
                        .task(task.id)
                        .details(json!({
                            "grant_id": grant.id,
                            "user": grant.user,
                            "scope": grant.scope,
                            "grant_expires_at": grant.expires_at,
                        })),
                )
                .await;
        }

        if let Some(mode) = bypass_mode {
            self.svc
                .auditor
                .record(
                    AuditRecord::new(&task.tenant, actors::COORDINATOR, actions::POLICY_BYPASS_APPLIED)
                        .task(task.id)
                        .details(json!({
                            "bypass_mode": mode,
                            "risk_tier": task.risk_tier,
                            "user": task.requester,
                        })),
                )
                .await;
        }

        // (5) ゲートか publish
        let task = if requires_approval && grant.is_none() && bypass_mode.is_none() {
            match self
                .gate
                .request_approval(&task, Expect::status(TaskStatus::Queued), None, actors::COORDINATOR)
                .await?
            {
                Some((waiting, _)) => waiting,
                None => self.svc.load_task(task.id).await?,
            }
        } else {
            self.svc
                .publish_or_record(&task, Dispatch::Submitted, actors::COORDINATOR)
                .await;
            task
        };

        Ok(Submission {
            task,
            was_new: true,
        })
    }

    async fn observe_duplicate(&self, existing: &Task, key: &str) {
        info!(
            task_id = %existing.id,
            tenant = %existing.tenant,
            idempotency_key = key,
            status = %existing.status,
            "duplicate submission observed"
        );
        self.svc
            .auditor
            .record(
                AuditRecord::new(
                    &existing.tenant,
                    existing.requester.as_str(),
                    actions::TASK_DUPLICATE_OBSERVED,
                )
                .task(existing.id)
                .details(json!({
                    "idempotency_key": key,
                    "status": existing.status,
                })),
            )
            .await;
    }

    /// テナントをまたいだ参照は存在しないものとして扱う
    pub async fn get_task(&self, tenant: &TenantId, id: TaskId) -> Result<Task, StewardError> {
        match self.svc.store.get_task(id).await? {
            Some(task) if &task.tenant == tenant => Ok(task),
            _ => Err(StewardError::task_not_found(id)),
        }
    }

    pub async fn cancel_task(
        &self,
        tenant: &TenantId,
        id: TaskId,
        actor: &str,
    ) -> Result<Task, StewardError> {
        let task = self.get_task(tenant, id).await?;
        self.gate
            .cancel(task, actor, format!("canceled by {actor}"))
            .await
    }
}
