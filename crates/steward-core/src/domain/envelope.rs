//! TaskEnvelope - バスで運ぶメッセージ
//!
//! バスは「配送」しか持たないため、封筒には task_id と配送理由だけを入れます。
//! 実行可否は executor が必ずストアから読み直して判断します。

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::principal::TenantId;

/// なぜこのメッセージが publish されたか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// Coordinator が新規タスクを publish した
    Submitted,
    /// APPROVE によって再開された
    Approved,
    /// reconciliation sweep が再 publish した
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub tenant: TenantId,
    pub dispatch: Dispatch,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId, tenant: TenantId, dispatch: Dispatch) -> Self {
        Self {
            task_id,
            tenant,
            dispatch,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        // TaskEnvelope は文字列とユニット列挙だけなので失敗しない
        serde_json::json!({
            "task_id": self.task_id,
            "tenant": self.tenant,
            "dispatch": self.dispatch,
        })
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn envelope_json_shape() {
        let env = TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TenantId::new("acme").unwrap(),
            Dispatch::Approved,
        );
        let v = env.to_json();
        assert_eq!(v["dispatch"], "approved");
        assert_eq!(v["tenant"], "acme");
        assert_eq!(TaskEnvelope::from_json(&v).unwrap(), env);
    }
}
