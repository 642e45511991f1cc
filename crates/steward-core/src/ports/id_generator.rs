//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + 乱数で ULID を作る

use crate::domain::ids::{ApprovalId, AuditId, EventId, GrantId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// 型ごとのメソッドは `next_ulid` を包むだけなので、実装側は 1 メソッドで済みます。
pub trait IdGenerator: Send + Sync {
    fn next_ulid(&self) -> Ulid;

    fn task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn approval_id(&self) -> ApprovalId {
        ApprovalId::from(self.next_ulid())
    }

    fn grant_id(&self) -> GrantId {
        GrantId::from(self.next_ulid())
    }

    fn event_id(&self) -> EventId {
        EventId::from(self.next_ulid())
    }

    fn audit_id(&self) -> AuditId {
        AuditId::from(self.next_ulid())
    }
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// FixedClock を渡せば timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}
