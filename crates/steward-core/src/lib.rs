//! steward-core
//!
//! タスクのライフサイクルと承認ガバナンスのエンジン。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state machine, approval, risk, decision, audit）
//! - **ports**: 抽象化レイヤー（TaskStore, TaskBus, AuditLog, Clock, ExecutionBackend, ApprovalNotifier）
//! - **impls**: 実装（in-memory / SQLite の store と bus）
//! - **app**: アプリケーションロジック（coordinator, approval gate, worker loop, sweeps, builder, runtime）
//! - **typed**: 型付き Task API（TypedTask trait, Handler trait, TypedRegistry, PayloadCodec）
//! - **config**: 設定（TOML + `STEWARD_*` 環境変数）
//! - **error**: 呼び出し側に見せるエラー

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{AppBuilder, Runtime, StatusCounts, SubmitRequest, Submission};
pub use crate::config::StewardConfig;
pub use crate::error::StewardError;
