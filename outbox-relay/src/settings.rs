//! 中继进程配置
//!
//! 加载顺序（后者覆盖前者）：
//! 1. 当前目录下的 `relay.yaml`（可选）
//! 2. 命令行参数指定的文件
//! 3. `OUTBOX_RELAY_CONFIG` 指向的文件
//! 4. `OUTBOX_RELAY__` 前缀的环境变量，层级以 `__` 分隔，例如 `OUTBOX_RELAY__DISPATCHER__BATCH_SIZE=50`

use config::{Config, Environment, File, FileFormat};
use outbox_domain::dispatcher::DispatcherConfig;
use outbox_domain::policy::{Backoff, OutboxPolicy};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "relay";
const CONFIG_ENV_VAR: &str = "OUTBOX_RELAY_CONFIG";
const CONFIG_ENV_PREFIX: &str = "OUTBOX_RELAY";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub dispatcher: DispatcherSettings,
    pub policy: PolicySettings,
    pub store: StoreSettings,
    pub broker: BrokerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub tick_interval_secs: u64,
    pub reap_interval_secs: u64,
    pub stale_lock_threshold_secs: u64,
    pub confirm_timeout_ms: u64,
    pub purge_interval_secs: u64,
    pub retention_days: u64,
    /// 缺省为 `dispatcher@<pid>`
    pub worker_id: Option<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let d = DispatcherConfig::default();
        Self {
            batch_size: d.batch_size,
            tick_interval_secs: d.tick_interval.as_secs(),
            reap_interval_secs: d.reap_interval.as_secs(),
            stale_lock_threshold_secs: d.stale_lock_threshold.as_secs(),
            confirm_timeout_ms: u64::try_from(d.confirm_timeout.as_millis()).unwrap_or(u64::MAX),
            purge_interval_secs: d.purge_interval.as_secs(),
            retention_days: d.retention.as_secs() / 86_400,
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        let p = OutboxPolicy::default();
        Self {
            max_attempts: p.max_attempts,
            backoff_base_ms: u64::try_from(p.backoff.base.as_millis()).unwrap_or(u64::MAX),
            backoff_cap_ms: u64::try_from(p.backoff.cap.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub kind: StoreKind,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Log,
    Amqp,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub url: Option<String>,
}

impl RelaySettings {
    pub fn load(path: Option<&str>) -> Result<Self, SettingsError> {
        Self::load_with_env(path, std::env::vars().collect())
    }

    /// 同 `load`，环境变量取自 `env` 而非进程环境
    pub fn load_with_env(
        path: Option<&str>,
        env: config::Map<String, String>,
    ) -> Result<Self, SettingsError> {
        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        }

        if let Some(path) = env.get(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        }

        let settings: RelaySettings = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env)),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// 从 YAML 文本加载（不读取文件与环境变量）
    pub fn from_yaml(yaml: &str) -> Result<Self, SettingsError> {
        let settings: RelaySettings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let d = &self.dispatcher;
        if d.batch_size == 0 {
            return Err(invalid("dispatcher.batch_size", "must be greater than 0"));
        }
        for (field, value) in [
            ("dispatcher.tick_interval_secs", d.tick_interval_secs),
            ("dispatcher.reap_interval_secs", d.reap_interval_secs),
            ("dispatcher.stale_lock_threshold_secs", d.stale_lock_threshold_secs),
            ("dispatcher.confirm_timeout_ms", d.confirm_timeout_ms),
            ("dispatcher.purge_interval_secs", d.purge_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }
        if d.worker_id.as_deref().is_some_and(|w| w.trim().is_empty()) {
            return Err(invalid("dispatcher.worker_id", "must not be blank"));
        }

        let p = &self.policy;
        if p.max_attempts == 0 {
            return Err(invalid("policy.max_attempts", "must be greater than 0"));
        }
        if p.backoff_base_ms > p.backoff_cap_ms {
            return Err(invalid(
                "policy.backoff_base_ms",
                format!("{} exceeds backoff_cap_ms {}", p.backoff_base_ms, p.backoff_cap_ms),
            ));
        }

        if self.store.kind == StoreKind::Postgres && self.store.url.is_none() {
            return Err(invalid("store.url", "required when store.kind is postgres"));
        }
        if self.broker.kind == BrokerKind::Amqp && self.broker.url.is_none() {
            return Err(invalid("broker.url", "required when broker.kind is amqp"));
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let d = &self.dispatcher;
        DispatcherConfig {
            batch_size: d.batch_size,
            tick_interval: Duration::from_secs(d.tick_interval_secs),
            reap_interval: Duration::from_secs(d.reap_interval_secs),
            stale_lock_threshold: Duration::from_secs(d.stale_lock_threshold_secs),
            confirm_timeout: Duration::from_millis(d.confirm_timeout_ms),
            purge_interval: Duration::from_secs(d.purge_interval_secs),
            retention: Duration::from_secs(d.retention_days.saturating_mul(86_400)),
        }
    }

    pub fn outbox_policy(&self) -> OutboxPolicy {
        OutboxPolicy {
            max_attempts: self.policy.max_attempts,
            backoff: Backoff::new(
                Duration::from_millis(self.policy.backoff_base_ms),
                Duration::from_millis(self.policy.backoff_cap_ms),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.dispatcher_config(), DispatcherConfig::default());
        assert_eq!(s.outbox_policy(), OutboxPolicy::default());
        assert_eq!(s.store.kind, StoreKind::Memory);
        assert_eq!(s.broker.kind, BrokerKind::Log);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let s = RelaySettings::from_yaml(
            r#"
dispatcher:
  batch_size: 50
  confirm_timeout_ms: 1500
  worker_id: relay-a
policy:
  max_attempts: 3
store:
  kind: postgres
  url: postgres://localhost/outbox
broker:
  kind: amqp
  url: amqp://localhost:5672
"#,
        )
        .unwrap();

        let d = s.dispatcher_config();
        assert_eq!(d.batch_size, 50);
        assert_eq!(d.confirm_timeout, Duration::from_millis(1500));
        assert_eq!(d.tick_interval, Duration::from_secs(10));
        assert_eq!(s.dispatcher.worker_id.as_deref(), Some("relay-a"));
        assert_eq!(s.outbox_policy().max_attempts, 3);
        assert_eq!(s.outbox_policy().backoff, Backoff::default());
        assert_eq!(s.store.kind, StoreKind::Postgres);
        assert_eq!(s.broker.kind, BrokerKind::Amqp);
    }

    #[test]
    fn rejects_missing_urls_and_zero_intervals() {
        let err = RelaySettings::from_yaml("store:\n  kind: postgres\n").unwrap_err();
        assert!(err.to_string().contains("store.url"));

        let err = RelaySettings::from_yaml("broker:\n  kind: amqp\n").unwrap_err();
        assert!(err.to_string().contains("broker.url"));

        let err = RelaySettings::from_yaml("dispatcher:\n  tick_interval_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("tick_interval_secs"));

        let err = RelaySettings::from_yaml(
            "policy:\n  backoff_base_ms: 10000\n  backoff_cap_ms: 500\n",
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "policy.backoff_base_ms", .. }));
    }

    fn env(vars: &[(&str, &str)]) -> config::Map<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_file_and_variables_override_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.yaml");
        std::fs::write(
            &explicit,
            "dispatcher:\n  batch_size: 50\n  worker_id: relay-explicit\npolicy:\n  max_attempts: 3\n",
        )
        .unwrap();
        let from_env = dir.path().join("from-env.yaml");
        std::fs::write(
            &from_env,
            "dispatcher:\n  batch_size: 75\n  worker_id: relay-file\n",
        )
        .unwrap();

        let s = RelaySettings::load_with_env(
            explicit.to_str(),
            env(&[
                (CONFIG_ENV_VAR, from_env.to_str().unwrap()),
                ("OUTBOX_RELAY__DISPATCHER__WORKER_ID", "relay-env"),
                ("OUTBOX_RELAY__POLICY__BACKOFF_CAP_MS", "60000"),
                ("OUTBOX_RELAY_LOG", "debug"),
            ]),
        )
        .unwrap();

        assert_eq!(s.dispatcher.batch_size, 75);
        assert_eq!(s.dispatcher.worker_id.as_deref(), Some("relay-env"));
        assert_eq!(s.policy.max_attempts, 3);
        assert_eq!(s.outbox_policy().backoff.cap, Duration::from_secs(60));
    }

    #[test]
    fn env_variables_are_validated() {
        let err = RelaySettings::load_with_env(
            None,
            env(&[("OUTBOX_RELAY__DISPATCHER__BATCH_SIZE", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "dispatcher.batch_size", .. }));

        let err = RelaySettings::load_with_env(
            None,
            env(&[(CONFIG_ENV_VAR, "/nonexistent/relay-settings.yaml")]),
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::Load(_)));
    }
}
