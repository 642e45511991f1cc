//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - TaskBus は配送だけ（task_id のみ）。「現在の状態」を問い合わせない
//! - AuditLog は書き込み専用のシンク
//! - ExecutionBackend / ApprovalNotifier は core の外側のコラボレーター

pub mod audit_log;
pub mod clock;
pub mod execution;
pub mod id_generator;
pub mod notifier;
pub mod task_bus;
pub mod task_store;

pub use self::audit_log::AuditLog;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::execution::{ExecutionBackend, ExecutionContext, ExecutionError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::notifier::{ApprovalNotifier, LoggingNotifier};
pub use self::task_bus::{AckToken, BusError, BusMessage, Delivery, MessageId, TaskBus};
pub use self::task_store::{Claim, Expect, StatusChange, StoreError, TaskStore};
