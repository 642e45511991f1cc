//! テスト用のワイヤリング
//!
//! in-memory ストア・bus と手で進める時計で `Services` を組み立てます。
//! ExecutionBackend と ApprovalNotifier は呼び出しを記録するテストダブルです。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::config::StewardConfig;
use crate::domain::task::fixtures;
use crate::domain::{
    Approval, DefaultDecider, ExecutionOutcome, RiskTier, Task, TaskId, TaskType, TenantId, UserId,
};
use crate::impls::{InMemoryTaskBus, InMemoryTaskStore};
use crate::ports::{
    ApprovalNotifier, AuditLog, ExecutionBackend, ExecutionContext, ExecutionError, FixedClock,
    UlidGenerator,
};

use super::approval_gate::ApprovalGate;
use super::audit::Auditor;
use super::context::Services;
use super::coordinator::{Coordinator, SubmitRequest};
use super::worker_loop::{Handled, WorkerLoop};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// acme/alice が `test.echo.v1` を投入するリクエスト
pub(crate) fn request(tier: RiskTier) -> SubmitRequest {
    SubmitRequest::new(
        TenantId::new("acme").unwrap(),
        UserId::new("alice").unwrap(),
        TaskType::new("test.echo.v1").unwrap(),
        json!({ "msg": "hi" }),
        tier,
    )
}

pub(crate) fn test_config() -> StewardConfig {
    let mut cfg = StewardConfig::default();
    cfg.executor.retry_base_delay = Duration::from_millis(20);
    cfg.executor.cancel_poll_interval = Duration::from_millis(10);
    cfg
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    requested: Mutex<Vec<Approval>>,
    resolved: Mutex<Vec<Approval>>,
    expired: Mutex<Vec<Approval>>,
}

impl RecordingNotifier {
    pub fn requested(&self) -> Vec<Approval> {
        lock(&self.requested).clone()
    }

    pub fn resolved(&self) -> Vec<Approval> {
        lock(&self.resolved).clone()
    }

    pub fn expired(&self) -> Vec<Approval> {
        lock(&self.expired).clone()
    }
}

#[async_trait]
impl ApprovalNotifier for RecordingNotifier {
    async fn approval_requested(&self, _task: &Task, approval: &Approval) {
        lock(&self.requested).push(approval.clone());
    }

    async fn approval_resolved(&self, approval: &Approval) {
        lock(&self.resolved).push(approval.clone());
    }

    async fn approval_expired(&self, _task: &Task, approval: &Approval) {
        lock(&self.expired).push(approval.clone());
    }
}

enum Step {
    Outcome(ExecutionOutcome),
    Error(String),
    Hang,
    WaitForCancel,
}

/// 積まれた順に結果を返す。空なら成功
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<TaskId>>,
    approvals: Mutex<Vec<Option<Approval>>>,
    saw_cancel: AtomicBool,
}

impl ScriptedBackend {
    pub fn push(&self, outcome: ExecutionOutcome) {
        lock(&self.script).push_back(Step::Outcome(outcome));
    }

    pub fn push_error(&self, message: &str) {
        lock(&self.script).push_back(Step::Error(message.to_string()));
    }

    pub fn hang(&self) {
        lock(&self.script).push_back(Step::Hang);
    }

    pub fn wait_for_cancel(&self) {
        lock(&self.script).push_back(Step::WaitForCancel);
    }

    pub fn calls(&self) -> Vec<TaskId> {
        lock(&self.calls).clone()
    }

    /// 最後の呼び出しに渡された承認
    pub fn last_approval(&self) -> Option<Approval> {
        lock(&self.approvals).last().cloned().flatten()
    }

    pub fn saw_cancel(&self) -> bool {
        self.saw_cancel.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn run(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        lock(&self.calls).push(task.id);
        lock(&self.approvals).push(ctx.approval.clone());
        let step = lock(&self.script).pop_front();
        match step {
            None => Ok(ExecutionOutcome::succeeded(json!({ "ok": true }))),
            Some(Step::Outcome(outcome)) => Ok(outcome),
            Some(Step::Error(message)) => Err(ExecutionError::new(message)),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                Err(ExecutionError::new("unreachable"))
            }
            Some(Step::WaitForCancel) => {
                ctx.cancel.cancelled().await;
                self.saw_cancel.store(true, Ordering::SeqCst);
                Ok(ExecutionOutcome::failed("canceled"))
            }
        }
    }
}

pub(crate) struct Harness {
    pub store: InMemoryTaskStore,
    pub bus: Arc<InMemoryTaskBus>,
    pub clock: FixedClock,
    pub notifier: Arc<RecordingNotifier>,
    pub backend: Arc<ScriptedBackend>,
    svc: Services,
    gate: ApprovalGate,
    coordinator: Coordinator,
    worker: Arc<WorkerLoop>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut StewardConfig)) -> Self {
        let mut cfg = test_config();
        tweak(&mut cfg);

        let store = InMemoryTaskStore::default();
        let bus = Arc::new(InMemoryTaskBus::new(cfg.bus.visibility_timeout));
        let clock = FixedClock::new(start());
        let notifier = Arc::new(RecordingNotifier::default());
        let backend = Arc::new(ScriptedBackend::default());

        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let log: Arc<dyn AuditLog> = Arc::new(store.clone());
        let svc = Services {
            store: Arc::new(store.clone()),
            bus: bus.clone(),
            clock: Arc::new(clock.clone()),
            ids: ids.clone(),
            auditor: Auditor::new(log, Arc::new(clock.clone()), ids),
            notifier: notifier.clone(),
            config: Arc::new(cfg),
        };
        let gate = ApprovalGate::new(svc.clone());
        let coordinator = Coordinator::new(svc.clone(), gate.clone());
        let decider = Arc::new(DefaultDecider::new(
            svc.config.executor.retry_policy(),
            svc.config.executor.max_attempts,
        ));
        let worker = Arc::new(WorkerLoop::new(svc.clone(), gate.clone(), backend.clone(), decider));

        Self {
            store,
            bus,
            clock,
            notifier,
            backend,
            svc,
            gate,
            coordinator,
            worker,
        }
    }

    pub fn svc(&self) -> &Services {
        &self.svc
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn worker(&self) -> Arc<WorkerLoop> {
        Arc::clone(&self.worker)
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use crate::ports::Clock;
        self.clock.now()
    }

    /// publish せずに `QUEUED` のタスクを作る
    pub async fn insert_task(&self, tier: RiskTier) -> Task {
        let mut new = fixtures::new_task(tier);
        new.id = self.svc.ids.task_id();
        self.svc.create_or_get(new).await.unwrap().task
    }

    pub async fn audit_actions(&self, task_id: TaskId) -> Vec<String> {
        self.store
            .for_task(task_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    /// 1 バッチ分 consume して処理する
    pub async fn poll(&self) -> Vec<Handled> {
        self.worker
            .poll_once("test-worker", Duration::from_millis(50))
            .await
            .unwrap()
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}
