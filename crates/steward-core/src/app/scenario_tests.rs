//! モジュールをまたぐシナリオテスト
//!
//! Coordinator → bus → WorkerLoop → ApprovalGate → sweep を通しで動かし、
//! 履歴・監査・承認の性質を確認します。

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::json;

use super::publisher_loop::PublisherLoop;
use super::reaper_loop::ReaperLoop;
use super::test_support::{Harness, request};
use crate::domain::audit::actions;
use crate::domain::state::is_legal_history;
use crate::domain::{
    Dispatch, ErrorKind, ExecutionOutcome, RiskTier, Task, TaskId, TaskStatus, Verdict,
};
use crate::error::StewardError;
use crate::ports::TaskStore;

async fn history(h: &Harness, id: TaskId) -> Vec<TaskStatus> {
    h.store
        .events_for(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.status)
        .collect()
}

async fn task(h: &Harness, id: TaskId) -> Task {
    h.store.get_task(id).await.unwrap().unwrap()
}

/// 作成以外のイベント 1 件ごとに lifecycle 監査が 1 件ある
async fn assert_audited_per_transition(h: &Harness, id: TaskId) {
    let events = h.store.events_for(id).await.unwrap();
    let audit = h.audit_actions(id).await;
    for status in events.iter().filter(|e| e.from.is_some()).map(|e| e.status) {
        let want = actions::lifecycle(status);
        let events_to = events
            .iter()
            .filter(|e| e.from.is_some() && e.status == status)
            .count();
        let audited = audit.iter().filter(|a| **a == want).count();
        assert_eq!(audited, events_to, "{want} audited {audited} times for {events_to} events");
    }
}

#[tokio::test]
async fn histories_are_legal_paths_with_one_audit_per_transition() {
    let h = Harness::new().await;

    // 成功
    let ok = h.coordinator().submit_task(request(RiskTier::ReadOnly)).await.unwrap();
    h.poll().await;

    // リトライの末に失敗
    let flaky = h
        .coordinator()
        .submit_task(request(RiskTier::ReadOnly).idempotency_key("flaky"))
        .await
        .unwrap();
    h.backend.push(ExecutionOutcome::retryable("upstream 503"));
    h.poll().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.backend.push(ExecutionOutcome::failed("bad input"));
    h.poll().await;

    // 事前承認 → DENY
    let denied = h.coordinator().submit_task(request(RiskTier::Privileged)).await.unwrap();
    let pending = h.store.pending_approval_for(denied.task.id).await.unwrap().unwrap();
    h.gate()
        .decide_approval(pending.id, Verdict::Deny, "bob", None)
        .await
        .unwrap();

    // 実行途中の承認 → APPROVE → 成功
    let mid = h
        .coordinator()
        .submit_task(request(RiskTier::Mutating))
        .await
        .unwrap();
    h.backend.push(ExecutionOutcome::needs_approval("restart db"));
    h.poll().await;
    let pending = h.store.pending_approval_for(mid.task.id).await.unwrap().unwrap();
    h.gate()
        .decide_approval(pending.id, Verdict::Approve, "bob", None)
        .await
        .unwrap();
    h.poll().await;

    let expected = [
        (ok.task.id, TaskStatus::Succeeded),
        (flaky.task.id, TaskStatus::Failed),
        (denied.task.id, TaskStatus::Canceled),
        (mid.task.id, TaskStatus::Succeeded),
    ];
    for (id, status) in expected {
        assert_eq!(task(&h, id).await.status, status);
        let statuses = history(&h, id).await;
        assert!(is_legal_history(&statuses), "illegal history {statuses:?}");
        assert_eq!(statuses.last(), Some(&status));
        assert_audited_per_transition(&h, id).await;
    }
    assert!(!h.backend.calls().contains(&denied.task.id));
    assert_eq!(
        history(&h, mid.task.id).await,
        vec![
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::WaitingApproval,
            TaskStatus::Running,
            TaskStatus::Succeeded,
        ]
    );
}

#[tokio::test]
async fn concurrent_submissions_with_one_key_create_one_task() {
    let h = Harness::new().await;
    let (a, b) = tokio::join!(
        h.coordinator().submit_task(request(RiskTier::ReadOnly).idempotency_key("k-1")),
        h.coordinator().submit_task(request(RiskTier::ReadOnly).idempotency_key("k-1")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.task.id, b.task.id);
    assert_eq!([a.was_new, b.was_new].iter().filter(|new| **new).count(), 1);
    let counts = h.store.count_by_status(None).await.unwrap();
    assert_eq!(counts.values().sum::<u64>(), 1);
    assert_eq!(h.bus.backlog("tasks").await, 1);
}

#[tokio::test]
async fn concurrent_decisions_have_a_single_winner() {
    let h = Harness::new().await;
    let sub = h.coordinator().submit_task(request(RiskTier::Destructive)).await.unwrap();
    let pending = h.store.pending_approval_for(sub.task.id).await.unwrap().unwrap();

    let (approve, deny) = tokio::join!(
        h.gate().decide_approval(pending.id, Verdict::Approve, "bob", None),
        h.gate().decide_approval(pending.id, Verdict::Deny, "carol", None),
    );
    let outcomes = [approve.is_ok(), deny.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

    let loser = if approve.is_ok() { deny } else { approve };
    assert!(matches!(loser, Err(StewardError::AlreadyResolved { .. })));

    let status = task(&h, sub.task.id).await.status;
    assert!(matches!(status, TaskStatus::Running | TaskStatus::Canceled));
    let decided = h
        .audit_actions(sub.task.id)
        .await
        .into_iter()
        .filter(|a| a == actions::APPROVAL_DECIDED)
        .count();
    assert_eq!(decided, 1);
}

#[tokio::test]
async fn gated_task_never_executes_without_approval() {
    let h = Harness::new().await;
    let sub = h.coordinator().submit_task(request(RiskTier::Privileged)).await.unwrap();
    assert_eq!(sub.task.status, TaskStatus::WaitingApproval);

    // 承認待ちのタスクに迷い込んだ配送
    h.svc().publish(&sub.task, Dispatch::Reconciled).await.unwrap();
    h.poll().await;
    assert!(h.backend.calls().is_empty());

    // approval を経ずに QUEUED のまま配送された場合もゲートへ回る
    let queued = h.insert_task(RiskTier::Privileged).await;
    h.svc().publish(&queued, Dispatch::Submitted).await.unwrap();
    h.poll().await;
    assert!(h.backend.calls().is_empty());
    assert_eq!(task(&h, queued.id).await.status, TaskStatus::WaitingApproval);

    let pending = h.store.pending_approval_for(queued.id).await.unwrap().unwrap();
    h.gate()
        .decide_approval(pending.id, Verdict::Approve, "bob", None)
        .await
        .unwrap();
    h.poll().await;
    assert_eq!(h.backend.calls(), vec![queued.id]);
    assert_eq!(task(&h, queued.id).await.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn terminal_states_are_absorbing() {
    let h = Harness::new().await;
    let sub = h.coordinator().submit_task(request(RiskTier::ReadOnly)).await.unwrap();
    h.backend.push(ExecutionOutcome::succeeded(json!({ "rows": 3 })));
    h.poll().await;
    let done = task(&h, sub.task.id).await;
    assert_eq!(done.status, TaskStatus::Succeeded);

    let err = h
        .coordinator()
        .cancel_task(&done.tenant, done.id, "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);

    // 再配送・sweep は何もしない
    h.svc().publish(&done, Dispatch::Reconciled).await.unwrap();
    h.poll().await;
    h.clock.advance(ChronoDuration::hours(3));
    PublisherLoop::new(h.svc().clone()).sweep_once().await.unwrap();
    ReaperLoop::new(h.svc().clone(), h.gate().clone())
        .sweep_once()
        .await
        .unwrap();

    let after = task(&h, done.id).await;
    assert_eq!(after.status, TaskStatus::Succeeded);
    assert_eq!(after.result, Some(json!({ "rows": 3 })));
    assert_eq!(h.backend.calls().len(), 1);
    assert_eq!(history(&h, done.id).await.len(), 3);
}

#[tokio::test]
async fn task_persisted_but_never_published_is_recovered() {
    let h = Harness::new().await;
    let lost = h.insert_task(RiskTier::ReadOnly).await;
    assert_eq!(h.bus.backlog("tasks").await, 0);

    h.clock.advance(ChronoDuration::minutes(5));
    let republished = PublisherLoop::new(h.svc().clone()).sweep_once().await.unwrap();
    assert_eq!(republished, 1);

    h.poll().await;
    assert_eq!(task(&h, lost.id).await.status, TaskStatus::Succeeded);
    assert!(
        h.audit_actions(lost.id)
            .await
            .contains(&actions::TASK_REPUBLISHED.to_string())
    );
}

#[tokio::test]
async fn grant_stops_matching_after_expiry_or_revocation() {
    let h = Harness::new().await;
    let req = request(RiskTier::Destructive);
    h.gate()
        .issue_grant(&req.tenant, &req.requester, "risk:destructive", Duration::from_secs(600), "admin")
        .await
        .unwrap();

    let bypassed = h.coordinator().submit_task(req.clone()).await.unwrap();
    assert_eq!(bypassed.task.status, TaskStatus::Queued);

    h.clock.advance(ChronoDuration::minutes(11));
    let expired = h.coordinator().submit_task(req.clone()).await.unwrap();
    assert_eq!(expired.task.status, TaskStatus::WaitingApproval);

    let grant = h
        .gate()
        .issue_grant(&req.tenant, &req.requester, "risk:destructive", Duration::from_secs(600), "admin")
        .await
        .unwrap();
    h.gate().revoke_grant(grant.id, "admin").await.unwrap();
    let revoked = h.coordinator().submit_task(req).await.unwrap();
    assert_eq!(revoked.task.status, TaskStatus::WaitingApproval);
    assert_eq!(revoked.task.bypass_grant, None);
}
