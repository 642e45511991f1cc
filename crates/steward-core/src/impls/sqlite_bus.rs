//! SqliteTaskBus - SQLite を使った永続の配送キュー
//!
//! 複数プロセスが同じデータベースファイルを共有しても、1 メッセージが同じ
//! consumer group の 2 つの consumer に同時に渡ることはありません。
//!
//! # 実装詳細
//! - `bus_messages`: stream ごとに単調増加する id とペイロード
//! - `bus_groups`: group ごとの cursor（最後に新規配送した id）
//! - `bus_pending`: 配送済み・未 ack のエントリと visibility deadline
//! - 取り出しは `BEGIN IMMEDIATE` のトランザクション内で行う（書き込みロックを先に取る）
//! - deadline はプロセス間で共有するため壁時計のミリ秒で持つ
//! - 新着の通知手段がないので、consume は `poll_interval` ごとにポーリングする

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::ports::{AckToken, BusError, BusMessage, Delivery, MessageId, TaskBus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bus_messages (
    stream TEXT NOT NULL,
    id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (stream, id)
);
CREATE TABLE IF NOT EXISTS bus_groups (
    stream TEXT NOT NULL,
    grp TEXT NOT NULL,
    cursor INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream, grp)
);
CREATE TABLE IF NOT EXISTS bus_pending (
    stream TEXT NOT NULL,
    grp TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    consumer TEXT NOT NULL,
    visible_at INTEGER NOT NULL,
    delivery INTEGER NOT NULL,
    PRIMARY KEY (stream, grp, message_id)
);
CREATE INDEX IF NOT EXISTS idx_bus_pending_visible ON bus_pending (stream, grp, visible_at);
";

impl From<rusqlite::Error> for BusError {
    fn from(err: rusqlite::Error) -> Self {
        BusError::Backend(err.to_string())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn message_id(raw: i64) -> MessageId {
    MessageId(raw.max(0) as u64)
}

fn db_id(id: MessageId) -> i64 {
    i64::try_from(id.0).unwrap_or(i64::MAX)
}

/// SqliteTaskBus は複数プロセスで共有できる TaskBus
#[derive(Clone)]
pub struct SqliteTaskBus {
    conn: Arc<Mutex<Connection>>,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl SqliteTaskBus {
    pub fn open(
        path: impl AsRef<Path>,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, BusError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn, visibility_timeout, poll_interval)
    }

    pub fn open_in_memory(
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, BusError> {
        Self::init(Connection::open_in_memory()?, visibility_timeout, poll_interval)
    }

    fn init(
        conn: Connection,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, BusError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            visibility_timeout,
            poll_interval,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, BusError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BusError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| BusError::Backend("sqlite connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| BusError::Backend(format!("sqlite worker join failed: {e}")))?
    }

    /// stream に残っているメッセージ数（未配送 + 未 ack）
    pub async fn backlog(&self, stream: &str) -> Result<usize, BusError> {
        let stream = stream.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM bus_messages WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    /// 未 ack のメッセージを今持っている consumer
    pub async fn pending_owner(
        &self,
        stream: &str,
        group: &str,
        id: MessageId,
    ) -> Result<Option<String>, BusError> {
        let (stream, group) = (stream.to_string(), group.to_string());
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT consumer FROM bus_pending WHERE stream = ?1 AND grp = ?2 AND message_id = ?3",
                    params![stream, group, db_id(id)],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn try_take(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> Result<Vec<Delivery>, BusError> {
        let (stream, group, consumer) = (stream.to_string(), group.to_string(), consumer.to_string());
        let visibility = millis(self.visibility_timeout);
        self.with_conn(move |conn| {
            let now = now_ms();
            let visible_at = now.saturating_add(visibility);
            let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "INSERT OR IGNORE INTO bus_groups (stream, grp, cursor) VALUES (?1, ?2, 0)",
                params![stream, group],
            )?;

            let mut out = Vec::new();
            let token = |id: MessageId, delivery: u32| AckToken {
                stream: stream.clone(),
                group: group.clone(),
                message_id: id,
                delivery,
            };

            // 1) visibility timeout を過ぎた pending を再配送
            let expired: Vec<(i64, String, u32, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT p.message_id, p.consumer, p.delivery, m.payload
                     FROM bus_pending p
                     JOIN bus_messages m ON m.stream = p.stream AND m.id = p.message_id
                     WHERE p.stream = ?1 AND p.grp = ?2 AND p.visible_at <= ?3
                     ORDER BY p.message_id
                     LIMIT ?4",
                )?;
                stmt.query_map(params![stream, group, now, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<_, _>>()?
            };
            for (id, previous_consumer, delivery, payload) in expired {
                debug!(
                    stream = %stream,
                    group = %group,
                    message_id = %message_id(id),
                    previous_consumer = %previous_consumer,
                    consumer = %consumer,
                    "redelivering message after visibility timeout"
                );
                let delivery = delivery.saturating_add(1);
                tx.execute(
                    "UPDATE bus_pending SET consumer = ?1, visible_at = ?2, delivery = ?3
                     WHERE stream = ?4 AND grp = ?5 AND message_id = ?6",
                    params![consumer, visible_at, delivery, stream, group, id],
                )?;
                out.push(Delivery {
                    message: BusMessage {
                        id: message_id(id),
                        payload: serde_json::from_str(&payload)?,
                    },
                    token: token(message_id(id), delivery),
                });
            }

            // 2) 未配送のメッセージ
            let remaining = limit.saturating_sub(out.len() as i64);
            if remaining > 0 {
                let cursor: i64 = tx.query_row(
                    "SELECT cursor FROM bus_groups WHERE stream = ?1 AND grp = ?2",
                    params![stream, group],
                    |row| row.get(0),
                )?;
                let fresh: Vec<(i64, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, payload FROM bus_messages
                         WHERE stream = ?1 AND id > ?2
                         ORDER BY id
                         LIMIT ?3",
                    )?;
                    stmt.query_map(params![stream, cursor, remaining], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<_, _>>()?
                };
                for (id, payload) in fresh {
                    tx.execute(
                        "INSERT INTO bus_pending (stream, grp, message_id, consumer, visible_at, delivery)
                         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                        params![stream, group, id, consumer, visible_at],
                    )?;
                    tx.execute(
                        "UPDATE bus_groups SET cursor = ?1 WHERE stream = ?2 AND grp = ?3",
                        params![id, stream, group],
                    )?;
                    out.push(Delivery {
                        message: BusMessage {
                            id: message_id(id),
                            payload: serde_json::from_str(&payload)?,
                        },
                        token: token(message_id(id), 1),
                    });
                }
            }

            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl TaskBus for SqliteTaskBus {
    async fn publish(&self, stream: &str, payload: serde_json::Value) -> Result<MessageId, BusError> {
        let stream = stream.to_string();
        let payload = serde_json::to_string(&payload)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // 削除済みの id を再利用しないよう cursor も見る
            let next: i64 = tx.query_row(
                "SELECT MAX(
                     COALESCE((SELECT MAX(id) FROM bus_messages WHERE stream = ?1), 0),
                     COALESCE((SELECT MAX(cursor) FROM bus_groups WHERE stream = ?1), 0)
                 ) + 1",
                params![stream],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO bus_messages (stream, id, payload) VALUES (?1, ?2, ?3)",
                params![stream, next, payload],
            )?;
            tx.commit()?;
            Ok(message_id(next))
        })
        .await
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let deliveries = self
                .try_take(stream, group, consumer, batch_size.max(1))
                .await?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, token: &AckToken) -> Result<(), BusError> {
        let token = token.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = db_id(token.message_id);
            let removed = tx.execute(
                "DELETE FROM bus_pending
                 WHERE stream = ?1 AND grp = ?2 AND message_id = ?3 AND delivery = ?4",
                params![token.stream, token.group, id, token.delivery],
            )?;
            if removed == 0 {
                debug!(
                    stream = %token.stream,
                    message_id = %token.message_id,
                    delivery = token.delivery,
                    "ack matched no pending delivery"
                );
            }
            // 全 group が配送済みかつ ack 済みなら本体も消す
            tx.execute(
                "DELETE FROM bus_messages
                 WHERE stream = ?1 AND id = ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM bus_pending WHERE stream = ?1 AND message_id = ?2
                   )
                   AND NOT EXISTS (
                       SELECT 1 FROM bus_groups WHERE stream = ?1 AND cursor < ?2
                   )",
                params![token.stream, id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn nack(&self, token: &AckToken, delay: Duration) -> Result<(), BusError> {
        let token = token.clone();
        let delay = millis(delay);
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE bus_pending SET visible_at = ?1
                 WHERE stream = ?2 AND grp = ?3 AND message_id = ?4 AND delivery = ?5",
                params![
                    now_ms().saturating_add(delay),
                    token.stream,
                    token.group,
                    db_id(token.message_id),
                    token.delivery,
                ],
            )?;
            if updated == 0 {
                debug!(
                    stream = %token.stream,
                    message_id = %token.message_id,
                    delivery = token.delivery,
                    "ignoring nack from a stale delivery"
                );
            }
            Ok(())
        })
        .await
    }
}
