//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore** / **InMemoryTaskBus**: テスト・単一プロセス用
//! - **SqliteTaskStore** / **SqliteTaskBus**: 永続化（複数プロセスで共有可能）
//!
//! どちらの組み合わせでも Coordinator・Executor の振る舞いは変わりません。

pub mod memory_bus;
pub mod memory_store;
pub mod sqlite_bus;
pub mod sqlite_store;

#[cfg(test)]
pub(crate) mod store_contract;

pub use self::memory_bus::InMemoryTaskBus;
pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_bus::SqliteTaskBus;
pub use self::sqlite_store::SqliteTaskStore;
