//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **Runtime**: 公開 API の表面
//! - **Coordinator**: タスク投入（冪等性・grant 照合・persist-then-publish）
//! - **ApprovalGate**: 承認の要求・決定・失効、grant 管理、キャンセル
//! - **WorkerLoop / WorkerGroup**: タスク実行ループ（consume→claim→run→decide→ack）
//! - **PublisherLoop**: 配送待ちタスクの再 publish（reconciliation）
//! - **ReaperLoop**: 承認期限・lease 期限切れの回収と、取り残されたタスクの修復
//!
//! 状態の書き込みはすべて `lifecycle`（`Services::move_task` / `claim_task`）を通ります。

pub mod approval_gate;
pub mod audit;
pub mod builder;
pub mod context;
pub mod coordinator;
pub mod idempotency;
pub mod lifecycle;
pub mod publisher_loop;
pub mod reaper_loop;
pub mod runtime;
pub mod status;
pub mod worker_loop;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod scenario_tests;

// 主要な型を再エクスポート
pub use self::approval_gate::ApprovalGate;
pub use self::audit::Auditor;
pub use self::builder::{AppBuilder, BuildError};
pub use self::context::Services;
pub use self::coordinator::{Coordinator, SubmitRequest};
pub use self::idempotency::Submission;
pub use self::lifecycle::Move;
pub use self::publisher_loop::PublisherLoop;
pub use self::reaper_loop::{ReapReport, ReaperLoop};
pub use self::runtime::Runtime;
pub use self::status::StatusCounts;
pub use self::worker_loop::{Handled, WorkerGroup, WorkerLoop};
