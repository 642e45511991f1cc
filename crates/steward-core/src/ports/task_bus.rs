//! TaskBus port - at-least-once の配送キュー
//!
//! バスは task_id を運ぶだけで、タスクの状態の正本ではありません。
//!
//! # 契約
//! - `publish(stream, payload) -> MessageId`
//! - `consume(stream, group, consumer, batch_size, timeout) -> [Delivery]`
//!   - 同じ consumer group 内では 1 メッセージは同時に 1 consumer にしか渡らない
//!   - consumer group ごとに全メッセージが届く
//!   - visibility timeout 内に ack されなければ再配送の対象になる
//! - `ack(token)`: 冪等。既に ack 済みでもエラーにしない
//! - `nack(token, delay)`: `delay` 後に再配送の対象にする
//!
//! 順序保証はありません。同じタスクの重複「処理」を防ぐのはストアの CAS です。
//!
//! # 実装
//! - `impls::memory_bus::InMemoryTaskBus`（単一プロセス）
//! - `impls::sqlite_bus::SqliteTaskBus`（永続・複数プロセス）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("bus backend error: {0}")]
    Backend(String),

    #[error("bus serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// ストリーム内で単調増加するメッセージ番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-0", self.0)
    }
}

/// ack / nack に使うトークン
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken {
    pub stream: String,
    pub group: String,
    pub message_id: MessageId,

    /// 何回目の配送か（1 始まり）。古い配送からの ack / nack を無視するために使う
    pub delivery: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub id: MessageId,
    pub payload: serde_json::Value,
}

/// consume で受け取った 1 件
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: BusMessage,
    pub token: AckToken,
}

impl Delivery {
    /// 再配送かどうか
    pub fn is_redelivery(&self) -> bool {
        self.token.delivery > 1
    }
}

#[async_trait]
pub trait TaskBus: Send + Sync {
    async fn publish(&self, stream: &str, payload: serde_json::Value) -> Result<MessageId, BusError>;

    /// 最大 `timeout` 待って、最大 `batch_size` 件を受け取る。何もなければ空
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError>;

    /// 別の consumer に再配送済みの古いトークンでは何もしない
    async fn ack(&self, token: &AckToken) -> Result<(), BusError>;

    async fn nack(&self, token: &AckToken, delay: Duration) -> Result<(), BusError>;
}
