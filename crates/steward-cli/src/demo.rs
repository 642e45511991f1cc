//! デモ用の ExecutionBackend
//!
//! - `demo.echo.v1`: メッセージをそのまま返す
//! - `demo.deploy.v1`: サービスの再起動前に承認を求める（mid-execution approval）

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use steward_core::app::AppBuilder;
use steward_core::domain::{ExecutionOutcome, Task};
use steward_core::ports::{ExecutionContext, ExecutionError};
use steward_core::typed::{Handler, RegistryError, TypedTask};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl TypedTask for Echo {
    const TYPE: &'static str = "demo.echo.v1";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deploy {
    pub service: String,
    pub version: String,
}

impl TypedTask for Deploy {
    const TYPE: &'static str = "demo.deploy.v1";
}

pub struct EchoHandler;

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(
        &self,
        input: Echo,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        info!(task_id = %task.id, attempt = ctx.attempt, message = %input.message, "echo");
        Ok(ExecutionOutcome::succeeded(json!({ "echo": input.message })))
    }
}

pub struct DeployHandler {
    pub step: Duration,
}

#[async_trait]
impl Handler<Deploy> for DeployHandler {
    async fn handle(
        &self,
        input: Deploy,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let restart = format!("restart {}", input.service);
        let approved = ctx
            .approval
            .as_ref()
            .is_some_and(|a| a.sub_scope.as_deref() == Some(restart.as_str()));
        if !approved {
            return Ok(ExecutionOutcome::needs_approval(restart));
        }

        for stage in ["drain", "swap", "warmup"] {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    info!(task_id = %task.id, stage, "deploy canceled");
                    return Ok(ExecutionOutcome::failed(format!("canceled during {stage}")));
                }
                _ = tokio::time::sleep(self.step) => {
                    info!(task_id = %task.id, service = %input.service, stage, "deploy stage done");
                }
            }
        }
        Ok(ExecutionOutcome::succeeded(json!({
            "service": input.service,
            "version": input.version,
        })))
    }
}

pub fn register(builder: AppBuilder, step: Duration) -> Result<AppBuilder, RegistryError> {
    builder
        .register::<Echo, _>(EchoHandler)?
        .register::<Deploy, _>(DeployHandler { step })
}
