//! TOML-based configuration system for Trunchbull.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TrunchbullError};
use crate::models::common::{DataType, Source};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TRUNCHBULL_";

/// Top-level configuration, deserialized from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrunchbullConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schoology: ProviderConfig,
    #[serde(default)]
    pub powerschool: ProviderConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_env")]
    pub env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            env: default_env(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_env() -> String {
    "development".into()
}

/// SQLite database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Base64-encoded 32-byte key used to encrypt stored OAuth tokens.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            encryption_key: None,
        }
    }
}

fn default_db_path() -> String {
    "/data/trunchbull.db".into()
}

/// OAuth + API endpoint settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    /// OAuth 2.0 token endpoint used for refresh grants.
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Total fetch attempts per sync, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_backoff: BackoffStrategy,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long a request may wait for a rate limit permit.
    #[serde(default = "default_rate_limit_wait_secs")]
    pub rate_limit_wait_secs: u64,
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,
    /// Fraction of malformed records at which a non-empty batch fails.
    #[serde(default = "default_malformed_batch_threshold")]
    pub malformed_batch_threshold: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: BackoffStrategy::default(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_wait_secs: default_rate_limit_wait_secs(),
            max_concurrent_syncs: default_max_concurrent_syncs(),
            malformed_batch_threshold: default_malformed_batch_threshold(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_wait_secs)
    }
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_rate_limit_wait_secs() -> u64 {
    60
}

fn default_max_concurrent_syncs() -> usize {
    4
}

fn default_malformed_batch_threshold() -> f64 {
    1.0
}

/// Cache freshness windows per data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl_courses")]
    pub ttl_courses_minutes: i64,
    #[serde(default = "default_ttl_assignments")]
    pub ttl_assignments_minutes: i64,
    #[serde(default = "default_ttl_grades")]
    pub ttl_grades_minutes: i64,
    #[serde(default = "default_ttl_events")]
    pub ttl_events_minutes: i64,
    #[serde(default = "default_ttl_messages")]
    pub ttl_messages_minutes: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_courses_minutes: default_ttl_courses(),
            ttl_assignments_minutes: default_ttl_assignments(),
            ttl_grades_minutes: default_ttl_grades(),
            ttl_events_minutes: default_ttl_events(),
            ttl_messages_minutes: default_ttl_messages(),
        }
    }
}

impl CacheConfig {
    /// Freshness window for a data type. Zero when caching is disabled.
    pub fn ttl(&self, data_type: DataType) -> chrono::Duration {
        if !self.enabled {
            return chrono::Duration::zero();
        }
        let minutes = match data_type {
            DataType::Courses => self.ttl_courses_minutes,
            DataType::Assignments => self.ttl_assignments_minutes,
            DataType::Grades => self.ttl_grades_minutes,
            DataType::Events => self.ttl_events_minutes,
            DataType::Messages => self.ttl_messages_minutes,
        };
        chrono::Duration::minutes(minutes.max(0))
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_ttl_courses() -> i64 {
    1440
}

fn default_ttl_assignments() -> i64 {
    15
}

fn default_ttl_grades() -> i64 {
    30
}

fn default_ttl_events() -> i64 {
    1440
}

fn default_ttl_messages() -> i64 {
    10
}

/// Requests per minute allowed by each provider, shared across students.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_schoology_rpm")]
    pub schoology: u32,
    #[serde(default = "default_powerschool_rpm")]
    pub powerschool: u32,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            schoology: default_schoology_rpm(),
            powerschool: default_powerschool_rpm(),
        }
    }
}

impl RateLimitsConfig {
    pub fn per_minute(&self, source: Source) -> u32 {
        match source {
            Source::Schoology => self.schoology,
            Source::PowerSchool => self.powerschool,
        }
    }

    pub fn as_map(&self) -> HashMap<Source, u32> {
        Source::ALL
            .into_iter()
            .map(|s| (s, self.per_minute(s)))
            .collect()
    }
}

fn default_schoology_rpm() -> u32 {
    60
}

fn default_powerschool_rpm() -> u32 {
    30
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl TrunchbullConfig {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TrunchbullError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from a file, then apply `TRUNCHBULL_*` environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(path) = var("DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(key) = var("ENCRYPTION_KEY") {
            self.database.encryption_key = Some(key);
        }
        if let Some(port) = var("SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| TrunchbullError::Config(format!("invalid server port: {port}")))?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }
        for (name, provider) in [
            ("SCHOOLOGY", &mut self.schoology),
            ("POWERSCHOOL", &mut self.powerschool),
        ] {
            if let Some(id) = var(&format!("{name}_CLIENT_ID")) {
                provider.client_id = id;
            }
            if let Some(secret) = var(&format!("{name}_CLIENT_SECRET")) {
                provider.client_secret = secret;
            }
        }
        Ok(())
    }

    pub fn provider(&self, source: Source) -> &ProviderConfig {
        match source {
            Source::Schoology => &self.schoology,
            Source::PowerSchool => &self.powerschool,
        }
    }

    /// Providers turned on in this configuration.
    pub fn enabled_sources(&self) -> Vec<Source> {
        Source::ALL
            .into_iter()
            .filter(|s| self.provider(*s).enabled)
            .collect()
    }

    /// Validate the configuration, returning an error for invalid combinations.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(TrunchbullError::Config("invalid server port: 0".into()));
        }

        if self.database.path.is_empty() {
            return Err(TrunchbullError::Config(
                "database.path must not be empty".into(),
            ));
        }

        if self.sync.interval_minutes == 0 {
            return Err(TrunchbullError::Config(
                "sync.interval_minutes must be at least 1".into(),
            ));
        }

        if self.sync.retry_attempts == 0 {
            return Err(TrunchbullError::Config(
                "sync.retry_attempts must be at least 1".into(),
            ));
        }

        if self.sync.max_concurrent_syncs == 0 {
            return Err(TrunchbullError::Config(
                "sync.max_concurrent_syncs must be at least 1".into(),
            ));
        }

        let threshold = self.sync.malformed_batch_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(TrunchbullError::Config(format!(
                "sync.malformed_batch_threshold must be in (0, 1], got {threshold}"
            )));
        }

        for source in Source::ALL {
            if self.rate_limits.per_minute(source) == 0 {
                return Err(TrunchbullError::Config(format!(
                    "rate_limits.{source} must be greater than zero"
                )));
            }

            let provider = self.provider(source);
            if !provider.enabled {
                continue;
            }
            if provider.base_url.is_empty() {
                return Err(TrunchbullError::Config(format!(
                    "{source}.base_url is required when {source} is enabled"
                )));
            }
            if provider.token_url.is_none() {
                return Err(TrunchbullError::Config(format!(
                    "{source}.token_url is required when {source} is enabled"
                )));
            }
            // Credentials may arrive later through the OAuth flow.
            if provider.client_id.is_empty() {
                warn!(provider = %source, "client_id is not set");
            }
        }

        if let Some(ref key) = self.database.encryption_key {
            crate::crypto::decode_key(key)?;
        }

        Ok(())
    }

    /// Generate a sensible default configuration.
    pub fn generate_default() -> Self {
        Self {
            schoology: ProviderConfig {
                enabled: false,
                base_url: "https://api.schoology.com/v1".into(),
                token_url: Some("https://api.schoology.com/v1/oauth/access_token".into()),
                client_id: String::new(),
                client_secret: String::new(),
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_TOML: &str = r#"
[server]
port = 9090
env = "production"

[database]
path = "/var/lib/trunchbull/trunchbull.db"

[schoology]
enabled = true
base_url = "https://api.schoology.com/v1"
token_url = "https://api.schoology.com/v1/oauth/access_token"
client_id = "key"
client_secret = "secret"

[powerschool]
enabled = true
base_url = "https://powerschool.example.org"
token_url = "https://powerschool.example.org/oauth/access_token"
client_id = "ps-id"
client_secret = "ps-secret"

[sync]
interval_minutes = 15
retry_attempts = 5
retry_backoff = "fixed"
malformed_batch_threshold = 0.5

[cache]
ttl_assignments_minutes = 5

[rate_limits]
schoology = 120
powerschool = 20

[logging]
level = "debug"
format = "json"
"#;

    fn parse_sample() -> TrunchbullConfig {
        TrunchbullConfig::parse(SAMPLE_TOML).expect("sample TOML should parse")
    }

    #[test]
    fn parse_full_config() {
        let cfg = parse_sample();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.env, "production");
        assert_eq!(cfg.database.path, "/var/lib/trunchbull/trunchbull.db");
        assert!(cfg.schoology.enabled);
        assert_eq!(cfg.powerschool.client_id, "ps-id");
        assert_eq!(cfg.sync.interval_minutes, 15);
        assert_eq!(cfg.sync.retry_attempts, 5);
        assert_eq!(cfg.sync.retry_backoff, BackoffStrategy::Fixed);
        assert_eq!(cfg.sync.malformed_batch_threshold, 0.5);
        assert_eq!(cfg.cache.ttl_assignments_minutes, 5);
        assert_eq!(cfg.rate_limits.schoology, 120);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = TrunchbullConfig::parse("").unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.database.path, "/data/trunchbull.db");
        assert_eq!(cfg.sync.interval_minutes, 30);
        assert_eq!(cfg.sync.retry_attempts, 3);
        assert_eq!(cfg.sync.retry_backoff, BackoffStrategy::Exponential);
        assert_eq!(cfg.cache.ttl_grades_minutes, 30);
        assert_eq!(cfg.cache.ttl_events_minutes, 1440);
        assert_eq!(cfg.cache.ttl_messages_minutes, 10);
        assert_eq!(cfg.rate_limits.schoology, 60);
        assert_eq!(cfg.rate_limits.powerschool, 30);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
        cfg.validate().unwrap();
    }

    #[test]
    fn ttl_per_data_type() {
        let cfg = parse_sample();
        assert_eq!(
            cfg.cache.ttl(DataType::Assignments),
            chrono::Duration::minutes(5)
        );
        assert_eq!(cfg.cache.ttl(DataType::Grades), chrono::Duration::minutes(30));
    }

    #[test]
    fn disabled_cache_has_zero_ttl() {
        let mut cfg = parse_sample();
        cfg.cache.enabled = false;
        assert_eq!(cfg.cache.ttl(DataType::Events), chrono::Duration::zero());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = parse_sample();
        let env: HashMap<String, String> = [
            ("TRUNCHBULL_DATABASE_PATH", "/tmp/t.db"),
            ("TRUNCHBULL_SCHOOLOGY_CLIENT_SECRET", "from-env"),
            ("TRUNCHBULL_SERVER_PORT", "7070"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        cfg.apply_env(|k| env.get(k).cloned()).unwrap();
        assert_eq!(cfg.database.path, "/tmp/t.db");
        assert_eq!(cfg.schoology.client_secret, "from-env");
        assert_eq!(cfg.server.port, 7070);
        assert_eq!(cfg.powerschool.client_secret, "ps-secret");
    }

    #[test]
    fn env_override_rejects_bad_port() {
        let mut cfg = parse_sample();
        let result = cfg.apply_env(|k| (k == "TRUNCHBULL_SERVER_PORT").then(|| "abc".to_string()));
        assert!(matches!(result, Err(TrunchbullError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut cfg = parse_sample();
        cfg.sync.interval_minutes = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("interval_minutes"));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut cfg = parse_sample();
        cfg.sync.retry_attempts = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("retry_attempts"));
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let mut cfg = parse_sample();
        cfg.sync.malformed_batch_threshold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.sync.malformed_batch_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_rate_limit() {
        let mut cfg = parse_sample();
        cfg.rate_limits.powerschool = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limits.powerschool"));
    }

    #[test]
    fn validate_enabled_provider_requires_urls() {
        let mut cfg = parse_sample();
        cfg.powerschool.token_url = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("powerschool.token_url"));

        let mut cfg = parse_sample();
        cfg.schoology.base_url.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("schoology.base_url"));
    }

    #[test]
    fn validate_disabled_provider_skips_url_checks() {
        let mut cfg = parse_sample();
        cfg.powerschool.enabled = false;
        cfg.powerschool.base_url.clear();
        cfg.powerschool.token_url = None;
        cfg.validate().unwrap();
        assert_eq!(cfg.enabled_sources(), vec![Source::Schoology]);
    }

    #[test]
    fn validate_rejects_bad_encryption_key() {
        let mut cfg = parse_sample();
        cfg.database.encryption_key = Some("not-base64!".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_TOML.as_bytes()).unwrap();
        let cfg = TrunchbullConfig::load(file.path()).unwrap();
        assert_eq!(cfg.server.port, 9090);
    }

    #[test]
    fn load_nonexistent_file_returns_io_error() {
        let result = TrunchbullConfig::load(Path::new("/nonexistent/trunchbull.toml"));
        assert!(matches!(result, Err(TrunchbullError::Io(_))));
    }

    #[test]
    fn load_invalid_toml_returns_config_error() {
        let result = TrunchbullConfig::parse("this is not [valid toml");
        assert!(matches!(result, Err(TrunchbullError::Config(_))));
    }

    #[test]
    fn generated_default_round_trips() {
        let cfg = TrunchbullConfig::generate_default();
        let text = toml::to_string(&cfg).unwrap();
        let back = TrunchbullConfig::parse(&text).unwrap();
        assert_eq!(back.schoology, cfg.schoology);
        back.validate().unwrap();
    }
}
