//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 設計原則
//! - 起動時検証（Fail-fast）: 設定の検証と「期待 task_type ⊆ 登録済み」を build() で確認
//! - ports は差し替え可能。指定がなければ config の backend から作る
//! - 明確なエラーメッセージ（BuildError）

use std::sync::Arc;

use crate::config::{Backend, ConfigError, StewardConfig};
use crate::domain::{Decider, DefaultDecider};
use crate::impls::{InMemoryTaskBus, InMemoryTaskStore, SqliteTaskBus, SqliteTaskStore};
use crate::ports::{
    ApprovalNotifier, AuditLog, BusError, Clock, ExecutionBackend, LoggingNotifier, StoreError,
    SystemClock, TaskBus, TaskStore, UlidGenerator,
};
use crate::typed::{Handler, RegistryError, TypedRegistry, TypedTask};

use super::approval_gate::ApprovalGate;
use super::audit::Auditor;
use super::context::Services;
use super::coordinator::Coordinator;
use super::runtime::Runtime;
use super::worker_loop::WorkerLoop;

/// AppBuilder は Runtime を構築
///
/// # 使用例
/// ```ignore
/// let runtime = AppBuilder::new(config)
///     .register::<RotateKeys, _>(RotateKeysHandler)?
///     .expect_tasks(&["ops.keys.rotate.v1"])
///     .build()?;
/// ```
pub struct AppBuilder {
    config: StewardConfig,
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    store: Option<(Arc<dyn TaskStore>, Arc<dyn AuditLog>)>,
    bus: Option<Arc<dyn TaskBus>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn ApprovalNotifier>>,
    decider: Option<Arc<dyn Decider>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("both typed handlers and a custom execution backend were configured")]
    ConflictingBackends,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open task store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to open task bus: {0}")]
    Bus(#[from] BusError),
}

impl AppBuilder {
    pub fn new(config: StewardConfig) -> Self {
        Self {
            config,
            registry: TypedRegistry::new(),
            expected_tasks: None,
            backend: None,
            store: None,
            bus: None,
            clock: None,
            notifier: None,
            decider: None,
        }
    }

    /// Handler を登録
    pub fn register<T: TypedTask, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// 型付き Handler の代わりに使う ExecutionBackend
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: TaskStore + AuditLog + 'static,
    {
        let log: Arc<dyn AuditLog> = store.clone();
        self.store = Some((store, log));
        self
    }

    pub fn bus(mut self, bus: Arc<dyn TaskBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// # 検証
    /// - 設定値（`StewardConfig::validate`）
    /// - expect_tasks() の task_type が全て登録されているか
    /// - 型付き Handler とカスタム backend の併用
    pub fn build(self) -> Result<Runtime, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let backend: Arc<dyn ExecutionBackend> = match self.backend {
            Some(_) if !self.registry.is_empty() => return Err(BuildError::ConflictingBackends),
            Some(backend) => backend,
            None => Arc::new(self.registry),
        };

        let (store, log) = match self.store {
            Some(pair) => pair,
            None => open_store(&self.config)?,
        };
        let bus = match self.bus {
            Some(bus) => bus,
            None => open_bus(&self.config)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(DefaultDecider::new(
                self.config.executor.retry_policy(),
                self.config.executor.max_attempts,
            ))
        });

        let svc = Services {
            store,
            bus,
            clock: Arc::clone(&clock),
            ids: ids.clone(),
            auditor: Auditor::new(log, clock, ids),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LoggingNotifier)),
            config: Arc::new(self.config),
        };
        let gate = ApprovalGate::new(svc.clone());
        let coordinator = Coordinator::new(svc.clone(), gate.clone());
        let worker = Arc::new(WorkerLoop::new(svc.clone(), gate.clone(), backend, decider));
        Ok(Runtime::new(svc, gate, coordinator, worker))
    }
}

fn open_store(config: &StewardConfig) -> Result<(Arc<dyn TaskStore>, Arc<dyn AuditLog>), BuildError> {
    match (config.store.backend, config.store.path.as_deref()) {
        (Backend::Sqlite, Some(path)) => {
            let store = Arc::new(SqliteTaskStore::open(path)?);
            Ok((store.clone(), store))
        }
        (Backend::Sqlite, None) => Err(ConfigError::Invalid("store.path is required".into()).into()),
        (Backend::Memory, _) => {
            let store = Arc::new(InMemoryTaskStore::new());
            Ok((store.clone(), store))
        }
    }
}

fn open_bus(config: &StewardConfig) -> Result<Arc<dyn TaskBus>, BuildError> {
    let bus = &config.bus;
    match (bus.backend, config.bus_path()) {
        (Backend::Sqlite, Some(path)) => Ok(Arc::new(SqliteTaskBus::open(
            path,
            bus.visibility_timeout,
            bus.poll_interval,
        )?)),
        (Backend::Sqlite, None) => Err(ConfigError::Invalid("bus.path is required".into()).into()),
        (Backend::Memory, _) => Ok(Arc::new(InMemoryTaskBus::new(bus.visibility_timeout))),
    }
}
