//! InMemoryTaskStore - テスト・単一プロセス用の正本
//!
//! 1 つの Mutex の中で読み取りと書き込みを行うので、CAS は自明に原子的です。
//! SQLite 実装と同じ契約（一意制約・CAS・追記専用）を守ります。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::{
    Approval, ApprovalDecision, ApprovalGrant, ApprovalId, AuditLogEntry, GrantId, Resolution,
    Task, TaskEvent, TaskId, TaskStatus, TenantId, UserId,
};
use crate::ports::{AuditLog, Claim, Expect, StatusChange, StoreError, TaskStore};

type IdempotencyIndex = HashMap<(TenantId, UserId, String), TaskId>;

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    idempotency: IdempotencyIndex,
    events: Vec<TaskEvent>,
    /// 挿入順
    approvals: Vec<Approval>,
    grants: HashMap<GrantId, ApprovalGrant>,
    audit: Vec<AuditLogEntry>,
}

impl State {
    fn approval_mut(&mut self, id: ApprovalId) -> Option<&mut Approval> {
        self.approvals.iter_mut().find(|a| a.id == id)
    }
}

/// InMemoryTaskStore は TaskStore と AuditLog の両方を実装する
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: Task, created: TaskEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        if let Some(key) = &task.idempotency_key {
            let index_key = (task.tenant.clone(), task.requester.clone(), key.clone());
            if state.idempotency.contains_key(&index_key) {
                return Err(StoreError::Conflict(format!(
                    "idempotency key {key:?} already used by {}/{}",
                    task.tenant, task.requester
                )));
            }
            state.idempotency.insert(index_key, task.id);
        }
        state.tasks.insert(task.id, task);
        state.events.push(created);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        requester: &UserId,
        key: &str,
    ) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        let index_key = (tenant.clone(), requester.clone(), key.to_string());
        Ok(state
            .idempotency
            .get(&index_key)
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        expect: Expect,
        change: StatusChange,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if !expect.matches(task) {
            return Ok(None);
        }
        task.status = change.to;
        task.result = change.result;
        task.error = change.error;
        task.lease_expires_at = None;
        task.updated_at = change.event.at;
        let updated = task.clone();
        state.events.push(change.event);
        Ok(Some(updated))
    }

    async fn claim(
        &self,
        id: TaskId,
        expect: Expect,
        claim: Claim,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if !expect.matches(task) || task.has_live_lease(claim.now) {
            return Ok(None);
        }
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.lease_expires_at = Some(claim.lease_until);
        task.updated_at = claim.now;
        let updated = task.clone();
        if let Some(event) = claim.event {
            state.events.push(event);
        }
        Ok(Some(updated))
    }

    async fn release_lease(
        &self,
        id: TaskId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&id) {
            Some(task) if Expect::fenced(TaskStatus::Running, attempts).matches(task) => {
                task.lease_expires_at = None;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(
        &self,
        id: TaskId,
        expect: Expect,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&id) {
            Some(task) if expect.matches(task) => {
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_awaiting_delivery(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                let awaiting = t.status == TaskStatus::Queued
                    || (t.status == TaskStatus::Running && t.lease_expires_at.is_none());
                awaiting && t.updated_at <= updated_before
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.updated_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn list_lapsed_leases(
        &self,
        lapsed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.lease_expires_at.is_some_and(|until| until <= lapsed_before)
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.lease_expires_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn list_stranded_waiting(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::WaitingApproval
                    && !state
                        .approvals
                        .iter()
                        .any(|a| a.task_id == t.id && a.is_pending())
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.updated_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn list_children(
        &self,
        tenant: &TenantId,
        parent_id: TaskId,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| &t.tenant == tenant && t.parent_id == Some(parent_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn count_by_status(
        &self,
        tenant: Option<&TenantId>,
    ) -> Result<BTreeMap<TaskStatus, u64>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for task in state
            .tasks
            .values()
            .filter(|t| tenant.is_none_or(|tenant| &t.tenant == tenant))
        {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn events_for(&self, id: TaskId) -> Result<Vec<TaskEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.task_id == id)
            .cloned()
            .collect())
    }

    async fn insert_approval(&self, approval: Approval) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state
            .approvals
            .iter()
            .any(|a| a.task_id == approval.task_id && a.is_pending())
        {
            return Err(StoreError::Conflict(format!(
                "task {} already has a pending approval",
                approval.task_id
            )));
        }
        state.approvals.push(approval);
        Ok(())
    }

    async fn get_approval(&self, id: ApprovalId) -> Result<Option<Approval>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.approvals.iter().find(|a| a.id == id).cloned())
    }

    async fn pending_approval_for(&self, task_id: TaskId) -> Result<Option<Approval>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .approvals
            .iter()
            .find(|a| a.task_id == task_id && a.is_pending())
            .cloned())
    }

    async fn latest_approval_for(&self, task_id: TaskId) -> Result<Option<Approval>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .approvals
            .iter()
            .rev()
            .find(|a| a.task_id == task_id)
            .cloned())
    }

    async fn resolve_approval(
        &self,
        id: ApprovalId,
        resolution: Resolution,
    ) -> Result<Option<Approval>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(approval) = state.approval_mut(id) else {
            return Err(StoreError::NotFound {
                entity: "approval",
                id: id.to_string(),
            });
        };
        if approval.decision != ApprovalDecision::Pending {
            return Ok(None);
        }
        approval.decision = resolution.decision;
        approval.reason = resolution.reason;
        approval.decided_at = Some(resolution.at);
        approval.decided_by = Some(resolution.actor);
        Ok(Some(approval.clone()))
    }

    async fn list_pending_approvals(
        &self,
        tenant: &TenantId,
        user: Option<&UserId>,
    ) -> Result<Vec<Approval>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .approvals
            .iter()
            .filter(|a| {
                a.is_pending() && &a.tenant == tenant && user.is_none_or(|u| &a.requester == u)
            })
            .cloned()
            .collect())
    }

    async fn list_expired_approvals(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Approval>, StoreError> {
        let state = self.state.lock().await;
        let mut expired: Vec<Approval> = state
            .approvals
            .iter()
            .filter(|a| a.is_pending() && a.is_past_deadline(now))
            .cloned()
            .collect();
        expired.sort_by_key(|a| a.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn insert_grant(&self, grant: ApprovalGrant) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.grants.contains_key(&grant.id) {
            return Err(StoreError::Conflict(format!("grant {} already exists", grant.id)));
        }
        state.grants.insert(grant.id, grant);
        Ok(())
    }

    async fn get_grant(&self, id: GrantId) -> Result<Option<ApprovalGrant>, StoreError> {
        Ok(self.state.lock().await.grants.get(&id).cloned())
    }

    async fn find_active_grant(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalGrant>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .values()
            .filter(|g| g.matches(tenant, user, scope) && g.is_active(now))
            .max_by_key(|g| g.expires_at)
            .cloned())
    }

    async fn revoke_grant(
        &self,
        id: GrantId,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalGrant>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.grants.get_mut(&id).map(|grant| {
            if grant.revoked_at.is_none() {
                grant.revoked_at = Some(now);
            }
            grant.clone()
        }))
    }

    async fn revoke_grants(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalGrant>, StoreError> {
        let mut state = self.state.lock().await;
        let mut revoked = Vec::new();
        for grant in state.grants.values_mut() {
            if grant.matches(tenant, user, scope) && grant.is_active(now) {
                grant.revoked_at = Some(now);
                revoked.push(grant.clone());
            }
        }
        Ok(revoked)
    }
}

#[async_trait]
impl AuditLog for InMemoryTaskStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.audit.push(entry);
        Ok(())
    }

    async fn recent(&self, tenant: &TenantId, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|e| &e.tenant == tenant)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn for_task(&self, task_id: TaskId) -> Result<Vec<AuditLogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.task_id == Some(task_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::store_contract;

    #[tokio::test]
    async fn idempotency_key_is_unique_per_requester() {
        store_contract::idempotency_key_is_unique_per_requester(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        store_contract::transition_is_compare_and_swap(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn claim_increments_attempts_and_respects_lease() {
        store_contract::claim_increments_attempts_and_respects_lease(&InMemoryTaskStore::new())
            .await;
    }

    #[tokio::test]
    async fn fenced_writes_reject_stale_attempts() {
        store_contract::fenced_writes_reject_stale_attempts(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn sweep_queries() {
        store_contract::sweep_queries(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn approvals_resolve_once() {
        store_contract::approvals_resolve_once(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn grants_lifecycle() {
        store_contract::grants_lifecycle(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn audit_is_append_only_and_queryable() {
        store_contract::audit_is_append_only_and_queryable(&InMemoryTaskStore::new()).await;
    }
}
