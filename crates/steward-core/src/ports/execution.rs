//! ExecutionBackend port - 実際の作業を行う外部コラボレーター
//!
//! サンドボックスや隔離は実装側の責務です。core は「いつ実行してよいか」だけを決めます。

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Approval, ExecutionOutcome, Task};

/// 実行時に渡されるコンテキスト
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// 今回の attempt 番号（1 始まり）
    pub attempt: u32,

    /// タスクがキャンセルされると発火する。安全なチェックポイントで確認すること
    pub cancel: CancellationToken,

    /// このタスクを再開させた承認（あれば）
    pub approval: Option<Approval>,
}

/// バックエンド自体の失敗（リトライ可能として扱う）
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError>;
}
