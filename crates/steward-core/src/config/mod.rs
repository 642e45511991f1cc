//! Config - エンジンの設定
//!
//! TOML ファイルから読み込み、`STEWARD_*` 環境変数で一部を上書きします。
//! 省略したセクション・キーは既定値になります。
//!
//! ```toml
//! [store]
//! backend = "sqlite"
//! path = "steward.db"
//!
//! [executor]
//! workers = 8
//! execution_timeout = "5m"
//!
//! [approval]
//! ttl = "30m"
//! deny_cancel_scope = "siblings"
//!
//! [policy]
//! read-only = { requires_approval = false }
//! mutating = { requires_approval = true, scope = "writes" }
//! destructive = { requires_approval = true }
//! privileged = { requires_approval = true }
//!
//! [bypass.tenants.acme]
//! allow_user_bypass = true
//!
//! [[bypass.overrides]]
//! tenant = "acme"
//! user = "alice"
//! mode = "LOW_RISK_ONLY"
//! ```

pub mod duration_format;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{BypassPolicy, CancelScope, PolicyTable, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {message}")]
    Env { key: String, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            other => Err(format!("unknown backend {other:?} (expected \"memory\" or \"sqlite\")")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: Backend,
    /// sqlite のときのファイル。未指定なら `store.path` を共有する
    pub path: Option<PathBuf>,
    pub task_stream: String,
    pub consumer_group: String,
    #[serde(with = "duration_format")]
    pub visibility_timeout: Duration,
    pub batch_size: usize,
    #[serde(with = "duration_format")]
    pub poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            path: None,
            task_stream: "tasks".to_string(),
            consumer_group: "executors".to_string(),
            visibility_timeout: Duration::from_secs(30),
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub max_attempts: u32,
    #[serde(with = "duration_format")]
    pub execution_timeout: Duration,
    /// lease = execution_timeout + lease_grace
    #[serde(with = "duration_format")]
    pub lease_grace: Duration,
    /// lease が切れてから reaper が TIMED_OUT にするまでの猶予
    #[serde(with = "duration_format")]
    pub orphan_grace: Duration,
    #[serde(with = "duration_format")]
    pub cancel_poll_interval: Duration,
    #[serde(with = "duration_format")]
    pub retry_base_delay: Duration,
    pub retry_multiplier: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            execution_timeout: Duration::from_secs(120),
            lease_grace: Duration::from_secs(5),
            orphan_grace: Duration::from_secs(60),
            cancel_poll_interval: Duration::from_secs(1),
            retry_base_delay: Duration::from_secs(2),
            retry_multiplier: 2.0,
        }
    }
}

impl ExecutorConfig {
    pub fn lease_duration(&self) -> Duration {
        self.execution_timeout + self.lease_grace
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base_delay, self.retry_multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    #[serde(with = "duration_format")]
    pub ttl: Duration,
    #[serde(with = "duration_format")]
    pub sweep_interval: Duration,
    pub deny_cancel_scope: CancelScope,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(5),
            deny_cancel_scope: CancelScope::Task,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    #[serde(with = "duration_format")]
    pub interval: Duration,
    /// これより長く動いていない配送待ちタスクを再 publish する
    #[serde(with = "duration_format")]
    pub queued_age: Duration,
    pub batch_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            queued_age: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantConfig {
    #[serde(with = "duration_format")]
    pub max_ttl: Duration,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `RUST_LOG` が未設定のときの EnvFilter
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// StewardConfig は設定全体
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub executor: ExecutorConfig,
    pub approval: ApprovalConfig,
    pub reconcile: ReconcileConfig,
    pub grants: GrantConfig,
    pub policy: PolicyTable,
    pub bypass: BypassPolicy,
    pub log: LogConfig,
}

impl StewardConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// ファイルを読み、環境変数を反映し、検証する
    ///
    /// `path` が None なら既定値から始める。
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `STEWARD_*` の値で上書きする
    ///
    /// `lookup` はテストで環境変数を差し替えるための引数。
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parsed<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Env {
                key: key.to_string(),
                message: e.to_string(),
            })
        }

        fn duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
            duration_format::parse_duration(raw).map_err(|message| ConfigError::Env {
                key: key.to_string(),
                message,
            })
        }

        if let Some(v) = lookup("STEWARD_STORE_BACKEND") {
            self.store.backend = parsed("STEWARD_STORE_BACKEND", &v)?;
        }
        if let Some(v) = lookup("STEWARD_STORE_PATH") {
            self.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("STEWARD_BUS_BACKEND") {
            self.bus.backend = parsed("STEWARD_BUS_BACKEND", &v)?;
        }
        if let Some(v) = lookup("STEWARD_BUS_PATH") {
            self.bus.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("STEWARD_EXECUTOR_WORKERS") {
            self.executor.workers = parsed("STEWARD_EXECUTOR_WORKERS", &v)?;
        }
        if let Some(v) = lookup("STEWARD_EXECUTOR_MAX_ATTEMPTS") {
            self.executor.max_attempts = parsed("STEWARD_EXECUTOR_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("STEWARD_EXECUTOR_TIMEOUT") {
            self.executor.execution_timeout = duration("STEWARD_EXECUTOR_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("STEWARD_APPROVAL_TTL") {
            self.approval.ttl = duration("STEWARD_APPROVAL_TTL", &v)?;
        }
        if let Some(v) = lookup("STEWARD_LOG_FILTER") {
            self.log.filter = v;
        }
        if let Some(v) = lookup("STEWARD_LOG_FORMAT") {
            self.log.format = match v.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(ConfigError::Env {
                        key: "STEWARD_LOG_FORMAT".to_string(),
                        message: format!("unknown log format {other:?}"),
                    });
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if self.store.backend == Backend::Sqlite && self.store.path.is_none() {
            return invalid("store.path is required when store.backend = \"sqlite\"");
        }
        if self.bus.backend == Backend::Sqlite && self.bus_path().is_none() {
            return invalid("bus.path (or store.path) is required when bus.backend = \"sqlite\"");
        }
        if self.bus.task_stream.trim().is_empty() || self.bus.consumer_group.trim().is_empty() {
            return invalid("bus.task_stream and bus.consumer_group must not be empty");
        }
        if self.bus.batch_size == 0 || self.reconcile.batch_size == 0 {
            return invalid("batch sizes must be at least 1");
        }
        if self.executor.workers == 0 {
            return invalid("executor.workers must be at least 1");
        }
        if self.executor.max_attempts == 0 {
            return invalid("executor.max_attempts must be at least 1");
        }
        if !(self.executor.retry_multiplier.is_finite() && self.executor.retry_multiplier >= 1.0) {
            return invalid("executor.retry_multiplier must be a finite number >= 1.0");
        }

        let durations = [
            ("bus.visibility_timeout", self.bus.visibility_timeout),
            ("bus.poll_interval", self.bus.poll_interval),
            ("executor.execution_timeout", self.executor.execution_timeout),
            ("executor.cancel_poll_interval", self.executor.cancel_poll_interval),
            ("executor.retry_base_delay", self.executor.retry_base_delay),
            ("approval.ttl", self.approval.ttl),
            ("approval.sweep_interval", self.approval.sweep_interval),
            ("reconcile.interval", self.reconcile.interval),
            ("grants.max_ttl", self.grants.max_ttl),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }

        for tier in crate::domain::RiskTier::ALL {
            self.policy
                .lookup(tier)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        self.bypass
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// sqlite バスのファイル（未指定なら store と共有）
    pub fn bus_path(&self) -> Option<&Path> {
        self.bus.path.as_deref().or(self.store.path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RiskTier;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = StewardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bus.task_stream, "tasks");
        assert_eq!(config.bus.consumer_group, "executors");
        assert_eq!(config.executor.workers, 4);
        assert_eq!(config.executor.lease_duration(), Duration::from_secs(125));
        assert_eq!(config.approval.ttl, Duration::from_secs(3600));
        assert_eq!(config.grants.max_ttl, Duration::from_secs(86_400));
        assert_eq!(config.approval.deny_cancel_scope, CancelScope::Task);
    }

    #[test]
    fn parses_partial_toml() {
        let config = StewardConfig::from_toml_str(
            r#"
            [store]
            backend = "sqlite"
            path = "/tmp/steward.db"

            [executor]
            workers = 2
            execution_timeout = "5m"

            [approval]
            ttl = "30m"
            deny_cancel_scope = "siblings"

            [policy]
            read-only = { requires_approval = false }
            mutating = { requires_approval = true, scope = "writes" }
            destructive = { requires_approval = true }
            privileged = { requires_approval = true }
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.store.backend, Backend::Sqlite);
        assert_eq!(config.executor.workers, 2);
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.executor.execution_timeout, Duration::from_secs(300));
        assert_eq!(config.approval.deny_cancel_scope, CancelScope::Siblings);
        assert!(config.policy.requires_approval(RiskTier::Mutating).unwrap());
        assert_eq!(config.bus_path(), Some(Path::new("/tmp/steward.db")));
    }

    #[test]
    fn unknown_backend_is_rejected_at_parse() {
        let err = StewardConfig::from_toml_str("[store]\nbackend = \"postgres\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("STEWARD_EXECUTOR_WORKERS", "16"),
            ("STEWARD_APPROVAL_TTL", "10m"),
            ("STEWARD_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();
        let mut config = StewardConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.executor.workers, 16);
        assert_eq!(config.approval.ttl, Duration::from_secs(600));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn bad_env_value_names_the_key() {
        let mut config = StewardConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "STEWARD_STORE_BACKEND").then(|| "mongo".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STEWARD_STORE_BACKEND"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = StewardConfig::default();
        config.executor.workers = 0;
        assert!(config.validate().is_err());

        let mut config = StewardConfig::default();
        config.approval.ttl = Duration::ZERO;
        assert!(config.validate().unwrap_err().to_string().contains("approval.ttl"));

        let mut config = StewardConfig::default();
        config.store.backend = Backend::Sqlite;
        assert!(config.validate().is_err());

        let config = StewardConfig::from_toml_str(
            "[policy]\nread-only = { requires_approval = false }",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_bypass_section() {
        let config = StewardConfig::from_toml_str(
            r#"
            [bypass]
            allow_user_bypass = false

            [bypass.tenants.acme]
            allow_user_bypass = true

            [[bypass.overrides]]
            tenant = "acme"
            user = "alice"
            mode = "LOW_RISK_ONLY"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let acme = crate::domain::TenantId::new("acme").unwrap();
        let alice = crate::domain::UserId::new("alice").unwrap();
        assert_eq!(
            config.bypass.effective_mode(&acme, &alice),
            crate::domain::BypassMode::LowRiskOnly
        );
        assert!(StewardConfig::default().bypass.overrides.is_empty());

        let err = StewardConfig::from_toml_str(
            r#"
            [[bypass.overrides]]
            tenant = "acme"
            user = "alice"
            mode = "SOMETIMES"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[reconcile]\ninterval = \"1m\"").unwrap();
        let config = StewardConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.reconcile.interval, Duration::from_secs(60));
    }
}
