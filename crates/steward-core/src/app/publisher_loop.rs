//! PublisherLoop - 配送待ちタスクの再 publish（reconciliation sweep）
//!
//! ストアが正本で、bus は配送手段にすぎません。persist 後の publish に失敗した
//! タスクや、APPROVE 後の再開 publish が落ちたタスクは、ここで拾い直します。
//!
//! # フロー
//! 1. TaskStore::list_awaiting_delivery() で `queued_age` 以上動いていないタスクを取得
//!    （`QUEUED`、または lease のない `RUNNING`）
//! 2. TaskBus::publish() で再配送
//! 3. TaskStore::touch() で updated_at を進める（次の sweep で二重に拾わない）
//! 4. `task.republished` を監査に書く
//!
//! 二重配送は executor 側の claim フェンスが吸収します。

use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::audit::{actions, actors};
use crate::domain::{AuditRecord, Dispatch, Task};
use crate::error::StewardError;
use crate::ports::Expect;

use super::context::{Services, ago};

pub struct PublisherLoop {
    svc: Services,
}

impl PublisherLoop {
    pub fn new(svc: Services) -> Self {
        Self { svc }
    }

    /// 1 回分の sweep。再 publish した件数を返す
    pub async fn sweep_once(&self) -> Result<usize, StewardError> {
        let cfg = &self.svc.config.reconcile;
        let now = self.svc.now();
        let cutoff = ago(now, cfg.queued_age);
        let stale = self
            .svc
            .store
            .list_awaiting_delivery(cutoff, cfg.batch_size)
            .await?;

        let mut republished = 0;
        for task in &stale {
            match self.republish(task).await {
                Ok(true) => republished += 1,
                Ok(false) => {}
                Err(err) => warn!(task_id = %task.id, error = %err, "republish failed; will retry next sweep"),
            }
        }
        if republished > 0 {
            info!(republished, scanned = stale.len(), "reconciliation sweep republished tasks");
        }
        Ok(republished)
    }

    async fn republish(&self, task: &Task) -> Result<bool, StewardError> {
        self.svc.publish(task, Dispatch::Reconciled).await?;

        // 読み取り後に状態が動いていたら touch しない
        let touched = self
            .svc
            .store
            .touch(task.id, Expect::fenced(task.status, task.attempts), self.svc.now())
            .await?;
        if !touched {
            debug!(task_id = %task.id, "task moved during reconciliation; skipping touch");
            return Ok(false);
        }

        self.svc
            .auditor
            .record(
                AuditRecord::new(&task.tenant, actors::RECONCILER, actions::TASK_REPUBLISHED)
                    .task(task.id)
                    .details(json!({
                        "status": task.status,
                        "attempts": task.attempts,
                        "idle_since": task.updated_at,
                    })),
            )
            .await;
        Ok(true)
    }

    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let interval = self.svc.config.reconcile.interval;
        let this = &self;
        run_periodic("reconciler", interval, shutdown_rx, move || this.sweep_once()).await;
    }
}

/// `interval` ごとに `sweep` を呼ぶ。shutdown シグナルで止まる
pub(crate) async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<usize, StewardError>>,
{
    info!(sweep = name, interval_ms = interval.as_millis() as u64, "sweep started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = sweep().await {
                    warn!(sweep = name, error = %err, "sweep failed");
                }
            }
        }
    }
    info!(sweep = name, "sweep stopped");
}
