//! Configuration loading for Vitrine sync clients.
//!
//! Hosts either load a TOML file (`--config <path>` or `VITRINE_CONFIG`) or
//! start from [`SyncConfig::default_client`] and override what they need.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub polling: PollingConfig,
    pub reconnect: ReconnectConfig,
    pub mutation: MutationConfig,
    pub chat: ChatConfig,
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub hasher: HasherPreference,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub base_url: String,
    pub push_endpoint: String,
    #[serde(default)]
    pub auth: AuthConfig,
    pub request_timeout_ms: u64,
}

/// Credentials for the snapshot API and the push transport.
///
/// Both are optional: anonymous storefront sessions poll without push.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

impl AuthConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            || self.jwt.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    /// Safety-net interval while the push channel is healthy.
    pub healthy_interval_ms: u64,
    /// Primary refresh interval while push is degraded.
    pub unhealthy_interval_ms: u64,
    pub dedup_window_ms: u64,
    pub error_retry_count: u32,
    pub error_retry_base_ms: u64,
}

impl PollingConfig {
    pub fn healthy_interval(&self) -> Duration {
        Duration::from_millis(self.healthy_interval_ms)
    }

    pub fn unhealthy_interval(&self) -> Duration {
        Duration::from_millis(self.unhealthy_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn error_retry_base(&self) -> Duration {
        Duration::from_millis(self.error_retry_base_ms)
    }

    /// Interval to use for the given push-channel health.
    pub fn interval_for(&self, push_healthy: bool) -> Duration {
        if push_healthy {
            self.healthy_interval()
        } else {
            self.unhealthy_interval()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationConfig {
    pub timeout_ms: u64,
}

impl MutationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatConfig {
    pub typing_quiet_period_ms: u64,
    pub typing_poll_interval_ms: u64,
}

impl ChatConfig {
    pub fn typing_quiet_period(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_period_ms)
    }

    pub fn typing_poll_interval(&self) -> Duration {
        Duration::from_millis(self.typing_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    Disabled,
    Memory,
    JsonFile,
    Lmdb,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Blobs older than this are not used for seeding.
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

impl PersistenceConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }
}

/// Which scope hasher to build at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HasherPreference {
    /// SHA-256 scope hashing.
    Crypto,
    /// Non-cryptographic FNV-1a hashing.
    Fallback,
    /// Crypto when available.
    #[default]
    Auto,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or VITRINE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl SyncConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Defaults for an embedding host that only knows its endpoints.
    pub fn default_client(base_url: impl Into<String>, push_endpoint: impl Into<String>) -> Self {
        Self {
            api: ApiConfig {
                base_url: base_url.into(),
                push_endpoint: push_endpoint.into(),
                auth: AuthConfig::default(),
                request_timeout_ms: 15_000,
            },
            polling: PollingConfig {
                healthy_interval_ms: 300_000,
                unhealthy_interval_ms: 15_000,
                dedup_window_ms: 2_000,
                error_retry_count: 3,
                error_retry_base_ms: 1_000,
            },
            reconnect: ReconnectConfig {
                initial_ms: 1_000,
                max_ms: 30_000,
                multiplier: 2.0,
                jitter_ms: 500,
            },
            mutation: MutationConfig { timeout_ms: 10_000 },
            chat: ChatConfig {
                typing_quiet_period_ms: 3_000,
                typing_poll_interval_ms: 1_000,
            },
            persistence: PersistenceConfig {
                backend: PersistenceBackend::Memory,
                path: None,
                max_age_ms: None,
            },
            hasher: HasherPreference::Auto,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.api.push_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.push_endpoint",
                reason: "must not be empty".to_string(),
            });
        }
        if self.api.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.polling.unhealthy_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "polling.unhealthy_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.polling.healthy_interval_ms <= self.polling.unhealthy_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "polling.healthy_interval_ms",
                reason: "must be > unhealthy_interval_ms".to_string(),
            });
        }
        if self.polling.dedup_window_ms >= self.polling.unhealthy_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "polling.dedup_window_ms",
                reason: "must be < unhealthy_interval_ms".to_string(),
            });
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.mutation.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mutation.timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.chat.typing_quiet_period_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chat.typing_quiet_period_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.chat.typing_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chat.typing_poll_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        let needs_path = matches!(
            self.persistence.backend,
            PersistenceBackend::JsonFile | PersistenceBackend::Lmdb
        );
        let has_path = self
            .persistence
            .path
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty());
        if needs_path && !has_path {
            return Err(ConfigError::InvalidValue {
                field: "persistence.path",
                reason: "required for json_file and lmdb backends".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("VITRINE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
hasher = "fallback"

[api]
base_url = "https://shop.example.com"
push_endpoint = "wss://push.example.com/socket"
request_timeout_ms = 5000

[api.auth]
api_key = "pk_test"

[polling]
healthy_interval_ms = 120000
unhealthy_interval_ms = 15000
dedup_window_ms = 2000
error_retry_count = 2
error_retry_base_ms = 500

[reconnect]
initial_ms = 500
max_ms = 10000
multiplier = 2.0
jitter_ms = 100

[mutation]
timeout_ms = 8000

[chat]
typing_quiet_period_ms = 3000
typing_poll_interval_ms = 1000

[persistence]
backend = "json_file"
path = "/tmp/vitrine-cache"
max_age_ms = 86400000
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = SyncConfig::from_toml_str(SAMPLE).expect("sample should parse");
        config.validate().expect("sample should validate");
        assert_eq!(config.hasher, HasherPreference::Fallback);
        assert_eq!(config.persistence.backend, PersistenceBackend::JsonFile);
        assert_eq!(config.polling.interval_for(false), Duration::from_secs(15));
        assert_eq!(config.polling.interval_for(true), Duration::from_secs(120));
        assert!(config.api.auth.has_credentials());
    }

    #[test]
    fn test_from_path_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile should be created");
        file.write_all(SAMPLE.as_bytes())
            .expect("write should succeed");
        let config = SyncConfig::from_path(file.path()).expect("config should load");
        assert_eq!(config.mutation.timeout(), Duration::from_secs(8));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let bad = SAMPLE.replace("[mutation]", "[mutation]\nretries = 3");
        assert!(matches!(
            SyncConfig::from_toml_str(&bad),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_default_client_is_valid() {
        let config = SyncConfig::default_client("https://a", "wss://b");
        config.validate().expect("defaults should validate");
        assert_eq!(config.polling.healthy_interval(), Duration::from_secs(300));
        assert_eq!(config.polling.unhealthy_interval(), Duration::from_secs(15));
        assert_eq!(config.polling.dedup_window(), Duration::from_secs(2));
        assert_eq!(config.mutation.timeout(), Duration::from_secs(10));
        assert_eq!(config.chat.typing_quiet_period(), Duration::from_secs(3));
        assert!(!config.api.auth.has_credentials());
    }

    #[test]
    fn test_validate_rejects_inverted_intervals() {
        let mut config = SyncConfig::default_client("https://a", "wss://b");
        config.polling.healthy_interval_ms = 10_000;
        let err = config.validate().expect_err("inverted intervals should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "polling.healthy_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_low_multiplier() {
        let mut config = SyncConfig::default_client("https://a", "wss://b");
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_path_for_file_backends() {
        let mut config = SyncConfig::default_client("https://a", "wss://b");
        config.persistence.backend = PersistenceBackend::Lmdb;
        let err = config.validate().expect_err("missing path should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "persistence.path",
                ..
            }
        ));
    }
}
