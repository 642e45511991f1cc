//! TaskStore / AuditLog の共通契約テスト
//!
//! InMemory と SQLite の両方に同じシナリオを流して、振る舞いが一致することを確認します。

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use ulid::Ulid;

use crate::domain::task::fixtures;
use crate::domain::{
    Approval, ApprovalDecision, ApprovalGrant, ApprovalId, AuditId, AuditRecord, EventId, GrantId,
    NewTask, Resolution, RiskTier, Task, TaskEvent, TaskId, TaskStatus, TenantId, UserId, state,
};
use crate::ports::{AuditLog, Claim, Expect, StatusChange, StoreError, TaskStore};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

fn event_id() -> EventId {
    EventId::from_ulid(Ulid::new())
}

async fn insert<S: TaskStore>(store: &S, new: NewTask, at: DateTime<Utc>) -> Task {
    let task = new.into_task(at);
    let created = TaskEvent::created(event_id(), task.id, task.tenant.clone(), at);
    store.insert_task(task.clone(), created).await.unwrap();
    task
}

fn change(task: &Task, from: TaskStatus, to: TaskStatus, at: DateTime<Utc>) -> StatusChange {
    let transition = state::transition(from, to, "test").unwrap();
    StatusChange {
        to,
        result: None,
        error: None,
        event: TaskEvent::from_transition(event_id(), task.id, task.tenant.clone(), &transition, at),
    }
}

fn claim_from_queued(task: &Task, at: DateTime<Utc>) -> Claim {
    let transition = state::transition(TaskStatus::Queued, TaskStatus::Running, "claimed").unwrap();
    Claim {
        lease_until: at + Duration::seconds(60),
        now: at,
        event: Some(TaskEvent::from_transition(
            event_id(),
            task.id,
            task.tenant.clone(),
            &transition,
            at,
        )),
    }
}

pub async fn idempotency_key_is_unique_per_requester<S: TaskStore>(store: &S) {
    let mut first = fixtures::new_task(RiskTier::ReadOnly);
    first.idempotency_key = Some("key-1".to_string());
    let first = insert(store, first, t0()).await;

    let mut dup = fixtures::new_task(RiskTier::ReadOnly);
    dup.idempotency_key = Some("key-1".to_string());
    let dup = dup.into_task(t0());
    let err = store
        .insert_task(
            dup.clone(),
            TaskEvent::created(event_id(), dup.id, dup.tenant.clone(), t0()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "{err:?}");
    assert!(store.get_task(dup.id).await.unwrap().is_none());

    let found = store
        .find_by_idempotency_key(&first.tenant, &first.requester, "key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);

    // 別の requester は同じキーを使える
    let mut other = fixtures::new_task(RiskTier::ReadOnly);
    other.requester = UserId::new("bob").unwrap();
    other.idempotency_key = Some("key-1".to_string());
    insert(store, other, t0()).await;

    // キーなしは何件でも作れる
    insert(store, fixtures::new_task(RiskTier::ReadOnly), t0()).await;
    insert(store, fixtures::new_task(RiskTier::ReadOnly), t0()).await;
}

pub async fn transition_is_compare_and_swap<S: TaskStore>(store: &S) {
    let task = insert(store, fixtures::new_task(RiskTier::ReadOnly), t0()).await;
    let at = t0() + Duration::seconds(1);

    let waiting = store
        .apply_transition(
            task.id,
            Expect::status(TaskStatus::Queued),
            change(&task, TaskStatus::Queued, TaskStatus::WaitingApproval, at),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waiting.status, TaskStatus::WaitingApproval);
    assert_eq!(waiting.updated_at, at);

    // 期待値が古い更新はゼロ行
    let lost = store
        .apply_transition(
            task.id,
            Expect::status(TaskStatus::Queued),
            change(&task, TaskStatus::Queued, TaskStatus::Canceled, at),
        )
        .await
        .unwrap();
    assert!(lost.is_none());

    let mut failed = change(&task, TaskStatus::WaitingApproval, TaskStatus::TimedOut, at);
    failed.error = Some("approval expired".to_string());
    let done = store
        .apply_transition(task.id, Expect::status(TaskStatus::WaitingApproval), failed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, TaskStatus::TimedOut);
    assert_eq!(done.error.as_deref(), Some("approval expired"));
    assert!(done.result.is_none());

    let history: Vec<TaskStatus> = store
        .events_for(task.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.status)
        .collect();
    assert_eq!(
        history,
        vec![
            TaskStatus::Queued,
            TaskStatus::WaitingApproval,
            TaskStatus::TimedOut
        ]
    );
    assert!(state::is_legal_history(&history));
}

pub async fn claim_increments_attempts_and_respects_lease<S: TaskStore>(store: &S) {
    let task = insert(store, fixtures::new_task(RiskTier::ReadOnly), t0()).await;
    let at = t0() + Duration::seconds(1);

    let claimed = store
        .claim(task.id, Expect::fenced(TaskStatus::Queued, 0), claim_from_queued(&task, at))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, TaskStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.lease_expires_at, Some(at + Duration::seconds(60)));

    // lease が生きている間は再 claim できない
    let during = Claim {
        lease_until: at + Duration::seconds(120),
        now: at + Duration::seconds(30),
        event: None,
    };
    assert!(
        store
            .claim(task.id, Expect::fenced(TaskStatus::Running, 1), during)
            .await
            .unwrap()
            .is_none()
    );

    // lease が切れたら再 claim できる（イベントは増えない）
    let after = Claim {
        lease_until: at + Duration::seconds(200),
        now: at + Duration::seconds(61),
        event: None,
    };
    let reclaimed = store
        .claim(task.id, Expect::fenced(TaskStatus::Running, 1), after)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(store.events_for(task.id).await.unwrap().len(), 2);

    // lease を外すと lease なし RUNNING（配送待ち）になる
    assert!(
        store
            .release_lease(task.id, 2, at + Duration::seconds(62))
            .await
            .unwrap()
    );
    let released = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(released.status, TaskStatus::Running);
    assert!(released.lease_expires_at.is_none());
}

pub async fn fenced_writes_reject_stale_attempts<S: TaskStore>(store: &S) {
    let task = insert(store, fixtures::new_task(RiskTier::ReadOnly), t0()).await;
    let at = t0() + Duration::seconds(1);
    store
        .claim(task.id, Expect::fenced(TaskStatus::Queued, 0), claim_from_queued(&task, at))
        .await
        .unwrap()
        .unwrap();
    let reclaim = Claim {
        lease_until: at + Duration::seconds(300),
        now: at + Duration::seconds(120),
        event: None,
    };
    store
        .claim(task.id, Expect::fenced(TaskStatus::Running, 1), reclaim)
        .await
        .unwrap()
        .unwrap();

    // attempt 1 のワーカーの終端書き込みは効かない
    let mut stale = change(&task, TaskStatus::Running, TaskStatus::Succeeded, at);
    stale.result = Some(json!({"from": "stale"}));
    assert!(
        store
            .apply_transition(task.id, Expect::fenced(TaskStatus::Running, 1), stale)
            .await
            .unwrap()
            .is_none()
    );
    assert!(!store.release_lease(task.id, 1, at).await.unwrap());

    let mut fresh = change(&task, TaskStatus::Running, TaskStatus::Succeeded, at);
    fresh.result = Some(json!({"from": "fresh"}));
    let done = store
        .apply_transition(task.id, Expect::fenced(TaskStatus::Running, 2), fresh)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.result, Some(json!({"from": "fresh"})));
    assert!(done.lease_expires_at.is_none());
}

pub async fn sweep_queries<S: TaskStore>(store: &S) {
    let queued = insert(store, fixtures::new_task(RiskTier::ReadOnly), t0()).await;
    let fresh = insert(
        store,
        fixtures::new_task(RiskTier::ReadOnly),
        t0() + Duration::seconds(50),
    )
    .await;
    let running = insert(store, fixtures::new_task(RiskTier::ReadOnly), t0()).await;
    store
        .claim(
            running.id,
            Expect::fenced(TaskStatus::Queued, 0),
            claim_from_queued(&running, t0()),
        )
        .await
        .unwrap()
        .unwrap();

    let awaiting = store
        .list_awaiting_delivery(t0() + Duration::seconds(30), 10)
        .await
        .unwrap();
    let ids: Vec<_> = awaiting.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![queued.id]);
    assert!(!ids.contains(&fresh.id));

    assert!(
        store
            .touch(
                queued.id,
                Expect::status(TaskStatus::Queued),
                t0() + Duration::seconds(40)
            )
            .await
            .unwrap()
    );
    assert!(
        store
            .list_awaiting_delivery(t0() + Duration::seconds(30), 10)
            .await
            .unwrap()
            .is_empty()
    );

    // lease は t0+60s に切れる
    assert!(
        store
            .list_lapsed_leases(t0() + Duration::seconds(59), 10)
            .await
            .unwrap()
            .is_empty()
    );
    let lapsed = store
        .list_lapsed_leases(t0() + Duration::seconds(61), 10)
        .await
        .unwrap();
    assert_eq!(lapsed.len(), 1);
    assert_eq!(lapsed[0].id, running.id);

    let counts = store.count_by_status(None).await.unwrap();
    assert_eq!(counts.get(&TaskStatus::Queued), Some(&2));
    assert_eq!(counts.get(&TaskStatus::Running), Some(&1));
    let other = TenantId::new("globex").unwrap();
    assert!(store.count_by_status(Some(&other)).await.unwrap().is_empty());
}

fn pending_approval(task: &Task, at: DateTime<Utc>, ttl: Duration) -> Approval {
    Approval::pending(
        ApprovalId::from_ulid(Ulid::new()),
        task.id,
        task.tenant.clone(),
        task.requester.clone(),
        None,
        task.attempts,
        at,
        at + ttl,
    )
}

pub async fn approvals_resolve_once<S: TaskStore>(store: &S) {
    let task = insert(store, fixtures::new_task(RiskTier::Destructive), t0()).await;
    let approval = pending_approval(&task, t0(), Duration::minutes(5));
    store.insert_approval(approval.clone()).await.unwrap();

    // 同じタスクに 2 件目の PENDING は作れない
    let second = pending_approval(&task, t0(), Duration::minutes(5));
    assert!(matches!(
        store.insert_approval(second).await,
        Err(StoreError::Conflict(_))
    ));

    assert_eq!(
        store.pending_approval_for(task.id).await.unwrap().map(|a| a.id),
        Some(approval.id)
    );
    assert_eq!(
        store
            .list_pending_approvals(&task.tenant, Some(&task.requester))
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(
        store
            .list_expired_approvals(t0() + Duration::minutes(4), 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        store
            .list_expired_approvals(t0() + Duration::minutes(5), 10)
            .await
            .unwrap()
            .len(),
        1
    );

    let resolution = Resolution {
        decision: ApprovalDecision::Approve,
        actor: "carol".to_string(),
        reason: Some("looks fine".to_string()),
        at: t0() + Duration::minutes(1),
    };
    let resolved = store
        .resolve_approval(approval.id, resolution.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.decision, ApprovalDecision::Approve);
    assert_eq!(resolved.decided_by.as_deref(), Some("carol"));

    // 二度目の決定は負ける
    let again = Resolution {
        decision: ApprovalDecision::Deny,
        ..resolution
    };
    assert!(store.resolve_approval(approval.id, again).await.unwrap().is_none());
    let stored = store.get_approval(approval.id).await.unwrap().unwrap();
    assert_eq!(stored.decision, ApprovalDecision::Approve);

    assert!(store.pending_approval_for(task.id).await.unwrap().is_none());
    assert_eq!(
        store.latest_approval_for(task.id).await.unwrap().map(|a| a.id),
        Some(approval.id)
    );

    // 解決済みなら新しい PENDING を作れる
    let next = pending_approval(&task, t0() + Duration::minutes(2), Duration::minutes(5));
    store.insert_approval(next.clone()).await.unwrap();
    assert_eq!(
        store.latest_approval_for(task.id).await.unwrap().map(|a| a.id),
        Some(next.id)
    );

    let missing = store
        .resolve_approval(
            ApprovalId::from_ulid(Ulid::new()),
            Resolution {
                decision: ApprovalDecision::Deny,
                actor: "x".to_string(),
                reason: None,
                at: t0(),
            },
        )
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound { .. })));
}

fn grant(scope: &str, at: DateTime<Utc>, ttl: Duration) -> ApprovalGrant {
    ApprovalGrant {
        id: GrantId::from_ulid(Ulid::new()),
        tenant: TenantId::new("acme").unwrap(),
        user: UserId::new("alice").unwrap(),
        scope: scope.to_string(),
        issued_by: "admin".to_string(),
        issued_at: at,
        expires_at: at + ttl,
        revoked_at: None,
    }
}

pub async fn grants_lifecycle<S: TaskStore>(store: &S) {
    let tenant = TenantId::new("acme").unwrap();
    let alice = UserId::new("alice").unwrap();

    let g1 = grant("shell_mutation", t0(), Duration::minutes(10));
    let g2 = grant("shell_mutation", t0(), Duration::minutes(20));
    let other = grant("file_write", t0(), Duration::minutes(20));
    for g in [&g1, &g2, &other] {
        store.insert_grant(g.clone()).await.unwrap();
    }

    let active = store
        .find_active_grant(&tenant, &alice, "shell_mutation", t0() + Duration::minutes(15))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, g2.id);
    assert!(
        store
            .find_active_grant(&tenant, &alice, "shell", t0())
            .await
            .unwrap()
            .is_none()
    );

    let revoked = store
        .revoke_grant(g2.id, t0() + Duration::minutes(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(revoked.revoked_at, Some(t0() + Duration::minutes(1)));
    // 二度目の revoke は最初の時刻を保つ
    let again = store
        .revoke_grant(g2.id, t0() + Duration::minutes(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.revoked_at, Some(t0() + Duration::minutes(1)));
    assert!(
        store
            .revoke_grant(GrantId::from_ulid(Ulid::new()), t0())
            .await
            .unwrap()
            .is_none()
    );

    let bulk = store
        .revoke_grants(&tenant, &alice, "shell_mutation", t0() + Duration::minutes(3))
        .await
        .unwrap();
    assert_eq!(bulk.len(), 1);
    assert_eq!(bulk[0].id, g1.id);
    assert!(
        store
            .find_active_grant(&tenant, &alice, "shell_mutation", t0() + Duration::minutes(4))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .get_grant(other.id)
            .await
            .unwrap()
            .unwrap()
            .revoked_at
            .is_none()
    );
}

pub async fn audit_is_append_only_and_queryable<S: AuditLog>(store: &S) {
    let tenant = TenantId::new("acme").unwrap();
    let task_id = TaskId::from_ulid(Ulid::new());
    for (i, action) in ["task.submitted", "task.lifecycle.running", "grant.issued"]
        .into_iter()
        .enumerate()
    {
        let mut record = AuditRecord::new(&tenant, "tester", action).details(json!({ "i": i }));
        if i < 2 {
            record = record.task(task_id);
        }
        store
            .append(record.into_entry(
                AuditId::from_ulid(Ulid::new()),
                t0() + Duration::seconds(i as i64),
            ))
            .await
            .unwrap();
    }

    let recent = store.recent(&tenant, 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].action, "grant.issued");

    let for_task = store.for_task(task_id).await.unwrap();
    let actions: Vec<_> = for_task.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["task.submitted", "task.lifecycle.running"]);
    assert_eq!(for_task[0].details, json!({ "i": 0 }));
}
