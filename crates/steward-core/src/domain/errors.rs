//! Errors - ドメイン層のエラー型と分類
//!
//! I/O を伴わない純粋なエラーだけをここに置きます。
//! ストア・バスを含む全体のエラーは `crate::error::StewardError` にまとめます。

use thiserror::Error;

use super::state::TaskStatus;

/// ErrorKind はエラーの運用分類
///
/// - Validation: 入力不正。永続化の前に拒否され、呼び出し側が修正して再送する
/// - IllegalTransition: 状態機械が遷移を拒否した。競合かバグの兆候で、自動リトライしない
/// - NotFound: 対象が存在しない（またはテナントが違う）
/// - Conflict: 既に解決済みの approval に二度目の決定が来た
/// - Expired: approval の期限切れ
/// - Delivery: バスの publish/consume 失敗。reconciliation で回復する
/// - Execution: 実行バックエンドのエラー
/// - Infrastructure: ストアや設定の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    IllegalTransition,
    NotFound,
    Conflict,
    Expired,
    Delivery,
    Execution,
    Infrastructure,
}

/// 入力検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// 状態機械が拒否した遷移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}
