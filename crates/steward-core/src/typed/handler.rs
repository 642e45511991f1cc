//! Handler trait - 型付きタスクを実行する Handler の定義
//!
//! - ジェネリック trait (`Handler<T>`)
//! - Object-safe trait (`DynHandler`)
//! - Type erasure パターン (`TypedHandler<T, H>` → `DynHandler`)

use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::warn;

use super::codec::PayloadCodec;
use super::task::TypedTask;
use crate::domain::{ExecutionOutcome, Task};
use crate::ports::{ExecutionContext, ExecutionError};

/// Handler は型付き入力を受け取って ExecutionOutcome を返す
///
/// # 使用例
/// ```ignore
/// struct RotateKeysHandler;
///
/// #[async_trait]
/// impl Handler<RotateKeys> for RotateKeysHandler {
///     async fn handle(
///         &self,
///         input: RotateKeys,
///         task: &Task,
///         ctx: &ExecutionContext,
///     ) -> Result<ExecutionOutcome, ExecutionError> {
///         if ctx.approval.is_none() {
///             return Ok(ExecutionOutcome::needs_approval(format!("rotate {}", input.service)));
///         }
///         Ok(ExecutionOutcome::succeeded(json!({ "rotated": input.service })))
///     }
/// }
/// ```
///
/// - `Handler<RotateKeys>` は `RotateKeys` しか受け取れない
/// - 長い処理は `ctx.cancel` を安全なチェックポイントで確認すること
#[async_trait]
pub trait Handler<T: TypedTask>: Send + Sync {
    async fn handle(
        &self,
        input: T,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納するための型消去層。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError>;

    fn task_type(&self) -> &'static str;
}

pub struct TypedHandler<T: TypedTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTask, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        // 壊れた payload は何度実行しても壊れている
        let input: T = match PayloadCodec::decode(&task.payload) {
            Ok(input) => input,
            Err(err) => {
                warn!(task_id = %task.id, task_type = T::TYPE, error = %err, "payload decode failed");
                return Ok(ExecutionOutcome::failed(err.to_string()));
            }
        };
        self.handler.handle(input, task, ctx).await
    }

    fn task_type(&self) -> &'static str {
        T::TYPE
    }
}
