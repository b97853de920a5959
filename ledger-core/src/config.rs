//! Ledger configuration

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ENVIRONMENT: &str = "dev";
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 25;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: u32 = 2;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_LMDB_MAX_SIZE_MB: usize = 1_024;
/// Largest accepted LMDB memory map, 1 TiB.
pub const MAX_LMDB_MAX_SIZE_MB: usize = 1_048_576;
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;
pub const DEFAULT_CHANGE_BATCH_SIZE: usize = 256;
pub const DEFAULT_ID_COLLISION_RETRIES: u32 = 3;

/// How index reads treat derived projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// Trust index projections. Correct whenever the store applies batches atomically.
    #[default]
    Trusted,
    /// Re-read the primary record behind every index hit, drop stale hits and repair them.
    Verify,
}

impl ConsistencyMode {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ConsistencyMode::Trusted => "trusted",
            ConsistencyMode::Verify => "verify",
        }
    }
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for ConsistencyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trusted" => Ok(ConsistencyMode::Trusted),
            "verify" => Ok(ConsistencyMode::Verify),
            _ => Err(ConfigError::InvalidValue {
                field: "consistency".to_string(),
                value: s.to_string(),
                reason: "expected 'trusted' or 'verify'".to_string(),
            }),
        }
    }
}

/// Timeout and retry budget applied to every storage call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: u32,
    /// Deadline for a single storage call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy with a single attempt and no backoff.
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1,
            call_timeout,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Delay before retry number `retry` (1-based), capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1)
            .saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                value: self.max_attempts.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "retry.call_timeout".to_string(),
                value: format!("{:?}", self.call_timeout),
                reason: "must be positive".to_string(),
            });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_backoff".to_string(),
                value: format!("{:?}", self.initial_backoff),
                reason: format!("must not exceed max_backoff ({:?})", self.max_backoff),
            });
        }
        Ok(())
    }
}

/// Which storage substrate backs the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Lmdb { path: PathBuf, max_size_mb: usize },
}

/// Complete ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Deployment environment (`dev`, `staging`, `prod`).
    pub environment: String,
    /// Logical table name, `decision-ledger-<environment>` by default.
    pub table_name: String,
    /// Name of the secret document holding chat credentials.
    pub credentials_secret: String,
    pub backend: StoreBackend,
    pub retry: RetryPolicy,
    pub consistency: ConsistencyMode,
    /// Page size for internal scans (member listings, query pages).
    pub scan_page_size: usize,
    /// Maximum change records delivered to a sink in one call.
    pub change_batch_size: usize,
    /// Fresh ids tried before surfacing `DuplicateId`.
    pub id_collision_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::for_environment(DEFAULT_ENVIRONMENT)
    }
}

impl LedgerConfig {
    pub fn for_environment(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            table_name: format!("decision-ledger-{}", environment),
            credentials_secret: format!("decision-ledger/{}/slack", environment),
            backend: StoreBackend::Memory,
            retry: RetryPolicy::default(),
            consistency: ConsistencyMode::default(),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            change_batch_size: DEFAULT_CHANGE_BATCH_SIZE,
            id_collision_retries: DEFAULT_ID_COLLISION_RETRIES,
        }
    }

    pub fn with_backend(mut self, backend: StoreBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_consistency(mut self, consistency: ConsistencyMode) -> Self {
        self.consistency = consistency;
        self
    }

    /// Load configuration from `LEDGER_*` environment variables.
    ///
    /// | variable | default |
    /// |---|---|
    /// | `LEDGER_ENV` | `dev` |
    /// | `LEDGER_TABLE_NAME` | `decision-ledger-<env>` |
    /// | `LEDGER_CREDENTIALS_SECRET` | `decision-ledger/<env>/slack` |
    /// | `LEDGER_STORE` | `memory` (or `lmdb`) |
    /// | `LEDGER_LMDB_PATH` | required when `LEDGER_STORE=lmdb` |
    /// | `LEDGER_LMDB_MAX_SIZE_MB` | `1024` |
    /// | `LEDGER_RETRY_MAX_ATTEMPTS` | `4` |
    /// | `LEDGER_RETRY_INITIAL_BACKOFF_MS` | `25` |
    /// | `LEDGER_RETRY_MAX_BACKOFF_MS` | `1000` |
    /// | `LEDGER_CALL_TIMEOUT_MS` | `2000` |
    /// | `LEDGER_CONSISTENCY` | `trusted` |
    /// | `LEDGER_SCAN_PAGE_SIZE` | `100` |
    /// | `LEDGER_CHANGE_BATCH_SIZE` | `256` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LedgerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("LEDGER_ENV").unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
        let mut config = Self::for_environment(&environment);

        if let Some(table_name) = lookup("LEDGER_TABLE_NAME") {
            config.table_name = table_name;
        }
        if let Some(secret) = lookup("LEDGER_CREDENTIALS_SECRET") {
            config.credentials_secret = secret;
        }

        config.backend = match lookup("LEDGER_STORE").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("lmdb") => {
                let path = lookup("LEDGER_LMDB_PATH").ok_or_else(|| ConfigError::MissingRequired {
                    field: "LEDGER_LMDB_PATH".to_string(),
                })?;
                let max_size_mb = parse_var(&lookup, "LEDGER_LMDB_MAX_SIZE_MB")?
                    .unwrap_or(DEFAULT_LMDB_MAX_SIZE_MB);
                StoreBackend::Lmdb {
                    path: PathBuf::from(path),
                    max_size_mb,
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "LEDGER_STORE".to_string(),
                    value: other.to_string(),
                    reason: "expected 'memory' or 'lmdb'".to_string(),
                })
            }
        };

        if let Some(attempts) = parse_var(&lookup, "LEDGER_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var(&lookup, "LEDGER_RETRY_INITIAL_BACKOFF_MS")? {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "LEDGER_RETRY_MAX_BACKOFF_MS")? {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "LEDGER_CALL_TIMEOUT_MS")? {
            config.retry.call_timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = lookup("LEDGER_CONSISTENCY") {
            config.consistency = mode.parse()?;
        }
        if let Some(size) = parse_var(&lookup, "LEDGER_SCAN_PAGE_SIZE")? {
            config.scan_page_size = size;
        }
        if let Some(size) = parse_var(&lookup, "LEDGER_CHANGE_BATCH_SIZE")? {
            config.change_batch_size = size;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "environment".to_string(),
            });
        }
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "table_name".to_string(),
            });
        }
        self.retry.validate()?;
        if self.scan_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan_page_size".to_string(),
                value: self.scan_page_size.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.change_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "change_batch_size".to_string(),
                value: self.change_batch_size.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.id_collision_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "id_collision_retries".to_string(),
                value: self.id_collision_retries.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let StoreBackend::Lmdb { path, max_size_mb } = &self.backend {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "backend.path".to_string(),
                });
            }
            if *max_size_mb == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "backend.max_size_mb".to_string(),
                    value: max_size_mb.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            if *max_size_mb > MAX_LMDB_MAX_SIZE_MB {
                return Err(ConfigError::InvalidValue {
                    field: "backend.max_size_mb".to_string(),
                    value: max_size_mb.to_string(),
                    reason: format!("must be at most {}", MAX_LMDB_MAX_SIZE_MB),
                });
            }
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_follow_environment() {
        let config = LedgerConfig::from_lookup(lookup_from(&[("LEDGER_ENV", "prod")])).unwrap();
        assert_eq!(config.table_name, "decision-ledger-prod");
        assert_eq!(config.credentials_secret, "decision-ledger/prod/slack");
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.consistency, ConsistencyMode::Trusted);
    }

    #[test]
    fn test_lmdb_backend_requires_path() {
        let err = LedgerConfig::from_lookup(lookup_from(&[("LEDGER_STORE", "lmdb")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                field: "LEDGER_LMDB_PATH".to_string()
            }
        );

        let config = LedgerConfig::from_lookup(lookup_from(&[
            ("LEDGER_STORE", "lmdb"),
            ("LEDGER_LMDB_PATH", "/var/lib/ledger"),
            ("LEDGER_LMDB_MAX_SIZE_MB", "64"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            StoreBackend::Lmdb {
                path: PathBuf::from("/var/lib/ledger"),
                max_size_mb: 64
            }
        );
    }

    #[test]
    fn test_oversized_lmdb_map_is_rejected() {
        let huge = usize::MAX.to_string();
        let err = LedgerConfig::from_lookup(lookup_from(&[
            ("LEDGER_STORE", "lmdb"),
            ("LEDGER_LMDB_PATH", "/var/lib/ledger"),
            ("LEDGER_LMDB_MAX_SIZE_MB", huge.as_str()),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "backend.max_size_mb"),
            "got {err:?}"
        );
    }

    #[test]
    fn test_invalid_numbers_are_reported() {
        let err = LedgerConfig::from_lookup(lookup_from(&[("LEDGER_RETRY_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "LEDGER_RETRY_MAX_ATTEMPTS"));

        let err = LedgerConfig::from_lookup(lookup_from(&[("LEDGER_RETRY_MAX_ATTEMPTS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "retry.max_attempts"));
    }

    #[test]
    fn test_consistency_parsing() {
        let config =
            LedgerConfig::from_lookup(lookup_from(&[("LEDGER_CONSISTENCY", "VERIFY")])).unwrap();
        assert_eq!(config.consistency, ConsistencyMode::Verify);
        assert!(LedgerConfig::from_lookup(lookup_from(&[("LEDGER_CONSISTENCY", "eventual")])).is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(35));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(35));
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(500), Duration::from_millis(100));
        assert!(policy.validate().is_err());
    }
}
