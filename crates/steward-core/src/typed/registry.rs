//! TypedRegistry - Handler の登録と、task_type によるディスパッチ
//!
//! TypedRegistry 自体が `ExecutionBackend` です。executor は task_type を知らず、
//! レジストリが `task.task_type` で Handler を引きます。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::TypedTask;
use crate::domain::{ExecutionOutcome, Task};
use crate::ports::{ExecutionBackend, ExecutionContext, ExecutionError};

/// TypedRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register::<RotateKeys, _>(RotateKeysHandler)?;
///
/// let handler = registry.get("ops.keys.rotate.v1");
/// ```
#[derive(Default)]
pub struct TypedRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

/// RegistryError は TypedRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TypedTask, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let task_type = T::TYPE.to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers
            .insert(task_type, Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl ExecutionBackend for TypedRegistry {
    async fn run(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let Some(handler) = self.get(task.task_type.as_str()) else {
            warn!(task_id = %task.id, task_type = %task.task_type, "no handler registered");
            return Ok(ExecutionOutcome::failed(format!(
                "no handler registered for task type '{}'",
                task.task_type
            )));
        };
        handler.handle_dyn(task, ctx).await
    }
}
