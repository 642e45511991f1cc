//! InMemoryTaskBus - 単一プロセス用の配送キュー
//!
//! # 実装詳細
//! - stream ごとにメッセージを `BTreeMap<MessageId, payload>` で保持
//! - consumer group ごとに「どこまで配ったか（cursor）」と
//!   「配ったが ack されていないもの（pending）」を持つ
//! - pending は visibility deadline を持ち、過ぎたら他の consumer に再配送される
//! - すべての group が読み終えて ack したメッセージは削除する
//!
//! プロセスが落ちるとメッセージも消えます。永続化が必要なら `SqliteTaskBus` を使います。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::ports::{AckToken, BusError, BusMessage, Delivery, MessageId, TaskBus};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    visible_at: Instant,
    delivery: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// 最後に新規配送したメッセージ番号
    cursor: u64,
    pending: BTreeMap<MessageId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    last_id: u64,
    messages: BTreeMap<MessageId, serde_json::Value>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    /// 全 group が配送済みかつ ack 済みのメッセージを消す
    fn prune(&mut self) {
        let Some(min_cursor) = self.groups.values().map(|g| g.cursor).min() else {
            return;
        };
        let oldest_pending = self
            .groups
            .values()
            .filter_map(|g| g.pending.keys().next().map(|id| id.0))
            .min()
            .unwrap_or(u64::MAX);
        let keep_from = min_cursor.saturating_add(1).min(oldest_pending);
        self.messages = self.messages.split_off(&MessageId(keep_from));
    }
}

/// InMemoryTaskBus は開発・テスト用の TaskBus
pub struct InMemoryTaskBus {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl InMemoryTaskBus {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 以降の publish / consume を `BusError::Closed` にする。待機中の consume も起こす
    ///
    /// ack / nack は受け付け続ける（処理中のメッセージを片付けられるように）。
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    /// stream に残っているメッセージ数（未配送 + 未 ack）
    pub async fn backlog(&self, stream: &str) -> usize {
        let streams = self.streams.lock().await;
        streams.get(stream).map_or(0, |s| s.messages.len())
    }

    /// 取り出せるものを取り出す。なければ次に再配送可能になる時刻を返す
    async fn try_take(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> Result<Vec<Delivery>, Option<Instant>> {
        let now = Instant::now();
        let visible_at = now + self.visibility_timeout;
        let mut streams = self.streams.lock().await;
        let StreamState {
            messages, groups, ..
        } = streams.entry(stream.to_string()).or_default();
        let state = groups.entry(group.to_string()).or_default();

        let mut out = Vec::new();
        let token = |id: MessageId, delivery: u32| AckToken {
            stream: stream.to_string(),
            group: group.to_string(),
            message_id: id,
            delivery,
        };

        // 1) visibility timeout を過ぎた pending を再配送
        for (id, entry) in state.pending.iter_mut() {
            if out.len() >= batch_size {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let Some(payload) = messages.get(id) else {
                continue;
            };
            debug!(
                stream,
                group,
                message_id = %id,
                previous_consumer = %entry.consumer,
                consumer,
                "redelivering message after visibility timeout"
            );
            entry.visible_at = visible_at;
            entry.delivery += 1;
            entry.consumer = consumer.to_string();
            out.push(Delivery {
                message: BusMessage {
                    id: *id,
                    payload: payload.clone(),
                },
                token: token(*id, entry.delivery),
            });
        }

        // 2) 未配送のメッセージ
        let fresh: Vec<(MessageId, serde_json::Value)> = messages
            .range(MessageId(state.cursor.saturating_add(1))..)
            .take(batch_size.saturating_sub(out.len()))
            .map(|(id, payload)| (*id, payload.clone()))
            .collect();
        for (id, payload) in fresh {
            state.cursor = id.0;
            state.pending.insert(
                id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    visible_at,
                    delivery: 1,
                },
            );
            out.push(Delivery {
                message: BusMessage { id, payload },
                token: token(id, 1),
            });
        }

        if out.is_empty() {
            Err(state.pending.values().map(|e| e.visible_at).min())
        } else {
            Ok(out)
        }
    }
}

#[async_trait]
impl TaskBus for InMemoryTaskBus {
    async fn publish(&self, stream: &str, payload: serde_json::Value) -> Result<MessageId, BusError> {
        self.ensure_open()?;
        let id = {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();
            state.last_id += 1;
            let id = MessageId(state.last_id);
            state.messages.insert(id, payload);
            id
        };
        self.notify.notify_waiters();
        Ok(id)
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
            // ロックを離す前に waiter として登録しておく（通知の取りこぼし防止）
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.ensure_open()?;

            let next_visible = match self.try_take(stream, group, consumer, batch_size.max(1)).await {
                Ok(deliveries) => return Ok(deliveries),
                Err(next_visible) => next_visible,
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake) => {},
            }
        }
    }

    async fn ack(&self, token: &AckToken) -> Result<(), BusError> {
        let mut streams = self.streams.lock().await;
        if let Some(state) = streams.get_mut(&token.stream) {
            if let Some(group) = state.groups.get_mut(&token.group)
                && group
                    .pending
                    .get(&token.message_id)
                    .is_some_and(|entry| entry.delivery == token.delivery)
            {
                group.pending.remove(&token.message_id);
            }
            state.prune();
        }
        Ok(())
    }

    async fn nack(&self, token: &AckToken, delay: Duration) -> Result<(), BusError> {
        {
            let mut streams = self.streams.lock().await;
            let entry = streams
                .get_mut(&token.stream)
                .and_then(|s| s.groups.get_mut(&token.group))
                .and_then(|g| g.pending.get_mut(&token.message_id));
            // 他の consumer に再配送済みなら古い配送の nack は無視する
            if let Some(entry) = entry
                && entry.delivery == token.delivery
            {
                entry.visible_at = Instant::now() + delay;
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
