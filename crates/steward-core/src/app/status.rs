//! Status - タスク数のスナップショット
//!
//! operator 向けの「今どこに何件あるか」。ストアの `count_by_status` を
//! ステータスごとのフィールドに展開するだけです。

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::domain::TaskStatus;

/// ステータスごとのタスク数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub waiting_approval: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub timed_out: u64,
}

impl StatusCounts {
    pub fn from_counts(counts: &BTreeMap<TaskStatus, u64>) -> Self {
        let mut out = Self::default();
        for (status, n) in counts {
            *out.slot(*status) += n;
        }
        out
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Queued => self.queued,
            TaskStatus::WaitingApproval => self.waiting_approval,
            TaskStatus::Running => self.running,
            TaskStatus::Succeeded => self.succeeded,
            TaskStatus::Failed => self.failed,
            TaskStatus::Canceled => self.canceled,
            TaskStatus::TimedOut => self.timed_out,
        }
    }

    fn slot(&mut self, status: TaskStatus) -> &mut u64 {
        match status {
            TaskStatus::Queued => &mut self.queued,
            TaskStatus::WaitingApproval => &mut self.waiting_approval,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Succeeded => &mut self.succeeded,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Canceled => &mut self.canceled,
            TaskStatus::TimedOut => &mut self.timed_out,
        }
    }

    pub fn total(&self) -> u64 {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// まだ終端に達していないタスク数
    pub fn in_flight(&self) -> u64 {
        self.queued + self.waiting_approval + self.running
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = TaskStatus::ALL
            .iter()
            .map(|s| format!("{s}={}", self.get(*s)))
            .collect();
        write!(f, "{} (total={})", parts.join(" "), self.total())
    }
}
