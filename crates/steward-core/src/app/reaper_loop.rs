//! ReaperLoop - 期限切れの回収
//!
//! # フロー（1 sweep）
//! 1. 期限を過ぎた PENDING approval を EXPIRE にし、タスクを `TIMED_OUT` へ
//! 2. lease が `orphan_grace` 以上前に切れた `RUNNING` タスクを `TIMED_OUT` へ
//! 3. PENDING approval を持たない `WAITING_APPROVAL` タスクを修復
//!
//! 2 は「再配送されないまま放置された実行中タスク」の終端化です。lease が切れて
//! すぐの間は executor の再 claim（クラッシュ回復）を優先します。

use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::audit::actors;
use crate::domain::{Task, TaskStatus};
use crate::error::StewardError;
use crate::ports::Expect;

use super::approval_gate::ApprovalGate;
use super::context::{Services, ago};
use super::lifecycle::Move;
use super::publisher_loop::run_periodic;

/// 1 sweep の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub approvals_expired: usize,
    pub leases_timed_out: usize,
    pub stranded_repaired: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.approvals_expired + self.leases_timed_out + self.stranded_repaired
    }
}

pub struct ReaperLoop {
    svc: Services,
    gate: ApprovalGate,
}

impl ReaperLoop {
    pub fn new(svc: Services, gate: ApprovalGate) -> Self {
        Self { svc, gate }
    }

    pub async fn sweep_once(&self) -> Result<ReapReport, StewardError> {
        let limit = self.svc.config.reconcile.batch_size;
        let report = ReapReport {
            approvals_expired: self.gate.expire_pending(limit).await?,
            leases_timed_out: self.time_out_orphans(limit).await?,
            stranded_repaired: self.gate.repair_stranded(limit).await?,
        };
        if report.total() > 0 {
            info!(
                approvals_expired = report.approvals_expired,
                leases_timed_out = report.leases_timed_out,
                stranded_repaired = report.stranded_repaired,
                "reaper sweep"
            );
        }
        Ok(report)
    }

    async fn time_out_orphans(&self, limit: usize) -> Result<usize, StewardError> {
        let cutoff = ago(self.svc.now(), self.svc.config.executor.orphan_grace);
        let lapsed = self.svc.store.list_lapsed_leases(cutoff, limit).await?;
        let mut timed_out = 0;
        for task in &lapsed {
            match self.time_out(task).await {
                Ok(true) => timed_out += 1,
                Ok(false) => {}
                Err(err) => warn!(task_id = %task.id, error = %err, "orphan timeout failed"),
            }
        }
        Ok(timed_out)
    }

    async fn time_out(&self, task: &Task) -> Result<bool, StewardError> {
        warn!(
            task_id = %task.id,
            tenant = %task.tenant,
            attempts = task.attempts,
            lease_expires_at = ?task.lease_expires_at,
            "execution lease lapsed; timing out"
        );
        let mv = Move::to(TaskStatus::TimedOut, "execution lease expired")
            .error("execution lease expired")
            .detail("lease_expires_at", json!(task.lease_expires_at));
        let moved = self
            .svc
            .move_task(
                task,
                Expect::fenced(TaskStatus::Running, task.attempts),
                mv,
                actors::REAPER,
            )
            .await?;
        Ok(moved.is_some())
    }

    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let interval = self.svc.config.approval.sweep_interval;
        let this = &self;
        run_periodic("reaper", interval, shutdown_rx, move || async move {
            this.sweep_once().await.map(|r| r.total())
        })
        .await;
    }
}
