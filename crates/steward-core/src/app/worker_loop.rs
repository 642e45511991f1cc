//! WorkerLoop - タスク実行ループ
//!
//! # フロー（1 メッセージ）
//! 1. TaskBus::consume() で TaskEnvelope（task_id だけ）を受け取る
//! 2. TaskStore から現在の状態を読み直す（bus は正本ではない）
//! 3. 実行してよい状態なら claim（`RUNNING`・attempts+1・lease）
//! 4. ExecutionBackend を timeout とキャンセル監視つきで呼ぶ
//! 5. Decider が outcome を Decision に変換
//! 6. Decision をフェンスつきでストアに反映
//! 7. 反映が永続化された後にだけ ack（リトライは nack + backoff）
//!
//! # フェンシング
//! claim 後の書き込みはすべて `(RUNNING, attempts = claim 時の値)` を期待値にする。
//! 再配送で別ワーカーが claim し直したタスクに古いワーカーが書き込んでも 0 行で終わる。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::audit::{actions, actors};
use crate::domain::{
    Approval, ApprovalDecision, AuditRecord, Decider, Decision, ExecutionOutcome, Task, TaskEnvelope,
    TaskId, TaskStatus,
};
use crate::error::StewardError;
use crate::ports::{BusError, Delivery, ExecutionBackend, ExecutionContext, Expect, TaskStore};

use super::approval_gate::ApprovalGate;
use super::context::Services;
use super::lifecycle::Move;

/// consume で 1 回に待つ最大時間（shutdown とは select で競合させる）
const CONSUME_WAIT: Duration = Duration::from_secs(1);

/// 1 メッセージを処理した結果
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// 実行しなかった（終端・承認待ち・不明なタスク・claim 負け）。ack 済み
    Skipped,
    /// 承認ゲートへ回した。ack 済み
    Gated,
    /// 他のワーカーが lease を持っている。nack 済み
    Deferred(Duration),
    /// 実行中にキャンセルされた（またはフェンスに負けた）。ack 済み
    Aborted,
    /// 状態を書き込んだ。CAS 負けなら None。ack 済み
    Settled(Option<TaskStatus>),
    /// リトライ待ち。nack 済み
    RetryScheduled(Duration),
}

enum Attempt {
    Finished(ExecutionOutcome),
    TimedOut,
    Aborted,
}

/// WorkerLoop はタスクを実行
pub struct WorkerLoop {
    svc: Services,
    gate: ApprovalGate,
    backend: Arc<dyn ExecutionBackend>,
    decider: Arc<dyn Decider>,
}

impl WorkerLoop {
    pub fn new(
        svc: Services,
        gate: ApprovalGate,
        backend: Arc<dyn ExecutionBackend>,
        decider: Arc<dyn Decider>,
    ) -> Self {
        Self {
            svc,
            gate,
            backend,
            decider,
        }
    }

    /// 1 バッチ受け取って処理する
    pub async fn poll_once(&self, consumer: &str, wait: Duration) -> Result<Vec<Handled>, StewardError> {
        let bus = &self.svc.config.bus;
        let deliveries = self
            .svc
            .bus
            .consume(&bus.task_stream, &bus.consumer_group, consumer, bus.batch_size, wait)
            .await?;
        let mut handled = Vec::with_capacity(deliveries.len());
        for delivery in &deliveries {
            handled.push(self.handle(consumer, delivery).await?);
        }
        Ok(handled)
    }

    pub async fn handle(&self, consumer: &str, delivery: &Delivery) -> Result<Handled, StewardError> {
        let envelope = match TaskEnvelope::from_json(&delivery.message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    consumer,
                    message_id = %delivery.message.id,
                    error = %err,
                    "dropping undecodable bus message"
                );
                self.ack(delivery).await?;
                return Ok(Handled::Skipped);
            }
        };

        let Some(task) = self.svc.store.get_task(envelope.task_id).await? else {
            warn!(task_id = %envelope.task_id, consumer, "message for unknown task; dropping");
            self.ack(delivery).await?;
            return Ok(Handled::Skipped);
        };
        debug!(
            task_id = %task.id,
            status = %task.status,
            attempts = task.attempts,
            dispatch = ?envelope.dispatch,
            redelivery = delivery.is_redelivery(),
            consumer,
            "delivery received"
        );

        let now = self.svc.now();
        match task.status {
            status if status.is_terminal() || status == TaskStatus::WaitingApproval => {
                debug!(task_id = %task.id, status = %status, "task not executable; skipping");
                self.ack(delivery).await?;
                return Ok(Handled::Skipped);
            }
            TaskStatus::Queued if self.needs_gate(&task) => {
                // persist と gate の間で落ちたタスク
                self.gate
                    .request_approval(&task, Expect::status(TaskStatus::Queued), None, actors::EXECUTOR)
                    .await?;
                self.ack(delivery).await?;
                return Ok(Handled::Gated);
            }
            TaskStatus::Running if task.has_live_lease(now) => {
                return self.defer(&task, delivery).await;
            }
            _ => {}
        }

        let approval = self
            .svc
            .store
            .latest_approval_for(task.id)
            .await?
            .filter(|a| a.decision == ApprovalDecision::Approve);
        // APPROVE 直後の再開はリトライではない
        let resuming = approval.as_ref().is_some_and(|a| a.awaits_resume(&task));

        let max_attempts = self.svc.config.executor.max_attempts;
        if task.attempts >= max_attempts && !resuming {
            let mv = Move::to(TaskStatus::Failed, "max attempts exceeded").error(format!(
                "max attempts exceeded ({}/{max_attempts})",
                task.attempts
            ));
            let failed = self
                .svc
                .move_task(&task, Expect::fenced(task.status, task.attempts), mv, actors::EXECUTOR)
                .await?;
            self.ack(delivery).await?;
            return Ok(Handled::Settled(failed.map(|t| t.status)));
        }

        let lease = self.svc.config.executor.lease_duration();
        let Some(claimed) = self.svc.claim_task(&task, lease, actors::EXECUTOR).await? else {
            // 読み取りと claim の間に誰かが取った
            let current = self.svc.load_task(task.id).await?;
            if current.status == TaskStatus::Running && current.has_live_lease(self.svc.now()) {
                return self.defer(&current, delivery).await;
            }
            self.ack(delivery).await?;
            return Ok(Handled::Skipped);
        };
        self.record_start(&task, &claimed, consumer).await;

        let attempt = self.execute(&claimed, approval).await?;
        let handled = self.settle(&claimed, attempt, delivery).await?;
        Ok(handled)
    }

    fn needs_gate(&self, task: &Task) -> bool {
        if task.bypass_grant.is_some() {
            return false;
        }
        if self
            .svc
            .config
            .bypass
            .bypass_for(&task.tenant, &task.requester, task.risk_tier)
            .is_some()
        {
            return false;
        }
        // ポリシー表から消えた区分は安全側に倒す
        self.svc
            .config
            .policy
            .requires_approval(task.risk_tier)
            .unwrap_or(true)
    }

    async fn defer(&self, task: &Task, delivery: &Delivery) -> Result<Handled, StewardError> {
        let remaining = task
            .lease_expires_at
            .and_then(|until| (until - self.svc.now()).to_std().ok())
            .unwrap_or_default();
        let delay = remaining + Duration::from_secs(1);
        debug!(task_id = %task.id, delay_ms = delay.as_millis() as u64, "task leased by another worker; deferring");
        self.svc.bus.nack(&delivery.token, delay).await?;
        Ok(Handled::Deferred(delay))
    }

    async fn record_start(&self, before: &Task, claimed: &Task, consumer: &str) {
        info!(
            task_id = %claimed.id,
            tenant = %claimed.tenant,
            task_type = %claimed.task_type,
            attempt = claimed.attempts,
            consumer,
            "execution started"
        );
        if before.status == TaskStatus::Running && before.lease_expires_at.is_some() {
            // lease が切れたまま残っていた = 前のワーカーが落ちた
            self.svc
                .auditor
                .record(
                    AuditRecord::new(&claimed.tenant, actors::EXECUTOR, actions::TASK_RECLAIMED)
                        .task(claimed.id)
                        .details(json!({
                            "previous_attempt": before.attempts,
                            "lapsed_lease": before.lease_expires_at,
                        })),
                )
                .await;
        }
        self.svc
            .auditor
            .record(
                AuditRecord::new(&claimed.tenant, actors::EXECUTOR, actions::TASK_EXECUTION_STARTED)
                    .task(claimed.id)
                    .details(json!({
                        "attempt": claimed.attempts,
                        "consumer": consumer,
                        "lease_expires_at": claimed.lease_expires_at,
                    })),
            )
            .await;
    }

    async fn execute(
        &self,
        claimed: &Task,
        approval: Option<Approval>,
    ) -> Result<Attempt, StewardError> {
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            attempt: claimed.attempts,
            cancel: cancel.clone(),
            approval,
        };

        let done = CancellationToken::new();
        let watcher = tokio::spawn(watch_for_cancel(
            Arc::clone(&self.svc.store),
            claimed.id,
            claimed.attempts,
            cancel.clone(),
            done.clone(),
            self.svc.config.executor.cancel_poll_interval,
        ));

        let timeout = self.svc.config.executor.execution_timeout;
        let result = tokio::time::timeout(timeout, self.backend.run(claimed, &ctx)).await;
        done.cancel();
        let _ = watcher.await;

        Ok(match result {
            Err(_elapsed) => Attempt::TimedOut,
            Ok(_) if cancel.is_cancelled() => Attempt::Aborted,
            Ok(Ok(outcome)) => Attempt::Finished(outcome),
            Ok(Err(err)) => {
                warn!(task_id = %claimed.id, attempt = claimed.attempts, error = %err, "execution backend error");
                Attempt::Finished(ExecutionOutcome::retryable(err.0))
            }
        })
    }

    async fn settle(
        &self,
        claimed: &Task,
        attempt: Attempt,
        delivery: &Delivery,
    ) -> Result<Handled, StewardError> {
        let fence = Expect::fenced(TaskStatus::Running, claimed.attempts);
        let mv = match attempt {
            Attempt::Aborted => {
                info!(task_id = %claimed.id, attempt = claimed.attempts, "execution aborted");
                self.ack(delivery).await?;
                return Ok(Handled::Aborted);
            }
            Attempt::TimedOut => {
                let timeout = self.svc.config.executor.execution_timeout;
                warn!(task_id = %claimed.id, attempt = claimed.attempts, "execution timed out");
                Move::to(TaskStatus::TimedOut, "execution timed out").error(format!(
                    "execution timed out after {}",
                    humantime::format_duration(timeout)
                ))
            }
            Attempt::Finished(outcome) => match self.decider.decide(claimed, outcome) {
                Decision::Succeed { result } => {
                    Move::to(TaskStatus::Succeeded, "execution succeeded").result(result)
                }
                Decision::Fail { error } => {
                    Move::to(TaskStatus::Failed, "execution failed").error(error)
                }
                Decision::AwaitApproval { sub_scope } => {
                    self.gate
                        .request_approval(claimed, fence, Some(sub_scope), actors::EXECUTOR)
                        .await?;
                    self.ack(delivery).await?;
                    return Ok(Handled::Gated);
                }
                Decision::Retry { delay, reason } => {
                    return self.schedule_retry(claimed, delay, reason, delivery).await;
                }
            },
        };

        let to = mv.to;
        let settled = self
            .svc
            .move_task(claimed, fence, mv, actors::EXECUTOR)
            .await?;
        if settled.is_some() {
            info!(task_id = %claimed.id, attempt = claimed.attempts, status = %to, "execution settled");
        }
        self.ack(delivery).await?;
        Ok(Handled::Settled(settled.map(|t| t.status)))
    }

    async fn schedule_retry(
        &self,
        claimed: &Task,
        delay: Duration,
        reason: String,
        delivery: &Delivery,
    ) -> Result<Handled, StewardError> {
        let released = self
            .svc
            .store
            .release_lease(claimed.id, claimed.attempts, self.svc.now())
            .await?;
        if !released {
            debug!(task_id = %claimed.id, attempt = claimed.attempts, "lost fence before retry; dropping");
            self.ack(delivery).await?;
            return Ok(Handled::Settled(None));
        }

        info!(
            task_id = %claimed.id,
            attempt = claimed.attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "retry scheduled"
        );
        self.svc
            .auditor
            .record(
                AuditRecord::new(&claimed.tenant, actors::EXECUTOR, actions::TASK_RETRY_SCHEDULED)
                    .task(claimed.id)
                    .details(json!({
                        "attempt": claimed.attempts,
                        "delay_ms": delay.as_millis() as u64,
                        "reason": reason,
                    })),
            )
            .await;
        self.svc.bus.nack(&delivery.token, delay).await?;
        Ok(Handled::RetryScheduled(delay))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), StewardError> {
        self.svc.bus.ack(&delivery.token).await?;
        Ok(())
    }
}

/// タスクが `CANCELED` になった、または自分の claim が奪われたら `cancel` を発火する
async fn watch_for_cancel(
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
    attempts: u32,
    cancel: CancellationToken,
    done: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match store.get_task(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Canceled => {
                info!(task_id = %task_id, "cancellation observed; signalling backend");
                cancel.cancel();
                return;
            }
            Ok(Some(task)) if !Expect::fenced(TaskStatus::Running, attempts).matches(&task) => {
                warn!(task_id = %task_id, status = %task.status, attempts = task.attempts, "claim superseded; signalling backend");
                cancel.cancel();
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(err) => warn!(task_id = %task_id, error = %err, "cancel watcher could not read task"),
        }
    }
}

/// Worker group handle.
/// - `shutdown_and_join()` で全ワーカー・sweep の終了を待てる
/// - 実行中の handler は中断しない。新しいメッセージを取らなくなるだけ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers. consumer 名は `{prefix}-{index}`
    pub fn spawn(n: usize, prefix: &str, worker: Arc<WorkerLoop>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut group = Self {
            shutdown_tx,
            joins: Vec::with_capacity(n),
        };
        for index in 0..n {
            let worker = Arc::clone(&worker);
            let consumer = format!("{prefix}-{index}");
            group.attach(move |rx| run_worker(consumer, worker, rx));
        }
        group
    }

    /// shutdown シグナルを受け取るバックグラウンドタスクを追加する
    pub fn attach<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(task(rx)));
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "background task panicked");
            }
        }
    }
}

async fn run_worker(consumer: String, worker: Arc<WorkerLoop>, mut shutdown_rx: watch::Receiver<bool>) {
    let bus = worker.svc.config.bus.clone();
    info!(consumer = %consumer, stream = %bus.task_stream, group = %bus.consumer_group, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // consume は待つので shutdown と競合させる
        let deliveries = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            res = worker.svc.bus.consume(
                &bus.task_stream,
                &bus.consumer_group,
                &consumer,
                bus.batch_size,
                CONSUME_WAIT,
            ) => res,
        };

        let deliveries = match deliveries {
            Ok(deliveries) => deliveries,
            Err(BusError::Closed) => {
                info!(consumer = %consumer, "bus closed; worker exiting");
                break;
            }
            Err(err) => {
                warn!(consumer = %consumer, error = %err, "consume failed; backing off");
                tokio::time::sleep(bus.poll_interval).await;
                continue;
            }
        };

        for delivery in &deliveries {
            // 失敗したメッセージは ack しない。visibility timeout 後に再配送される
            if let Err(err) = worker.handle(&consumer, delivery).await {
                error!(
                    consumer = %consumer,
                    message_id = %delivery.message.id,
                    error = %err,
                    "delivery handling failed; leaving for redelivery"
                );
            }
        }
    }
    info!(consumer = %consumer, "worker stopped");
}
