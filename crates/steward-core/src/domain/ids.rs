//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! すべての永続エンティティ（Task, Approval, Grant, TaskEvent, AuditLogEntry）は
//! ULID を使った `Id<T>` で識別します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順 = 辞書順なので、イベント履歴の並びが安定する
//! - **分散生成可能**: 複数の coordinator / executor プロセスが調整なしで生成できる
//!
//! ## 文字列表現
//! Display は `"task-01HV..."` のようにプレフィックス付き。
//! `FromStr` は同じ形式をパースし、プレフィックスが違えばエラーにします。
//! serde ではプレフィックスなしの ULID 文字列として直列化されます（DB/バス用）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-", "apv-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しませんが、
/// TaskId と ApprovalId を取り違えるとコンパイルエラーになります。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// ID 文字列のパースエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected}id: {input}")]
pub struct ParseIdError {
    expected: &'static str,
    input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// `"task-<ulid>"` と裸の `"<ulid>"` の両方を受け付ける
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                expected: T::prefix(),
                input: s.to_string(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

macro_rules! id_marker {
    ($(#[$meta:meta])* $marker:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(
    /// Task のマーカー型
    Task,
    "task-"
);
id_marker!(
    /// Approval のマーカー型
    Approval,
    "apv-"
);
id_marker!(
    /// ApprovalGrant のマーカー型
    Grant,
    "grant-"
);
id_marker!(
    /// TaskEvent のマーカー型
    Event,
    "evt-"
);
id_marker!(
    /// AuditLogEntry のマーカー型
    Audit,
    "audit-"
);

/// Identifier of a Task (one logical unit of requested work).
pub type TaskId = Id<Task>;

/// Identifier of an Approval (a human decision tied to one task).
pub type ApprovalId = Id<Approval>;

/// Identifier of an ApprovalGrant.
pub type GrantId = Id<Grant>;

/// Identifier of a TaskEvent.
pub type EventId = Id<Event>;

/// Identifier of an AuditLogEntry.
pub type AuditId = Id<Audit>;
