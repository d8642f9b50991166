//! Upstream provider clients (Schoology LMS, PowerSchool SIS).

pub mod http;
pub mod powerschool;
pub mod schoology;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::info;

use crate::config::TrunchbullConfig;
use crate::error::Result;
use crate::models::common::{DataType, Source};
use crate::rate_limit::RateLimiter;
use crate::sync::cancel::CancelToken;

pub use powerschool::PowerSchoolClient;
pub use schoology::SchoologyClient;

/// One provider record exactly as it arrived on the wire.
pub type RawRecord = Value;

/// Per-call inputs shared by every fetch.
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// The student's provider-native identifier.
    pub external_id: String,
    pub access_token: String,
    pub cancel: CancelToken,
}

impl FetchContext {
    pub fn new(external_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            access_token: access_token.into(),
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Capability set every upstream implements. Each call walks pagination
/// internally and returns the fully materialized record list.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch_courses(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>>;
    async fn fetch_assignments(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>>;
    async fn fetch_grades(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>>;
    async fn fetch_events(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>>;
    async fn fetch_messages(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>>;

    async fn fetch(&self, data_type: DataType, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        match data_type {
            DataType::Courses => self.fetch_courses(ctx).await,
            DataType::Assignments => self.fetch_assignments(ctx).await,
            DataType::Grades => self.fetch_grades(ctx).await,
            DataType::Events => self.fetch_events(ctx).await,
            DataType::Messages => self.fetch_messages(ctx).await,
        }
    }
}

/// Build a client for every enabled provider, all sharing one limiter.
pub fn clients_from_config(
    config: &TrunchbullConfig,
    limiter: Arc<RateLimiter>,
) -> Result<HashMap<Source, Arc<dyn ProviderClient>>> {
    let mut clients: HashMap<Source, Arc<dyn ProviderClient>> = HashMap::new();
    for source in config.enabled_sources() {
        let provider = config.provider(source);
        let (timeout, wait) = (config.sync.request_timeout(), config.sync.rate_limit_wait());
        let client: Arc<dyn ProviderClient> = match source {
            Source::Schoology => {
                Arc::new(SchoologyClient::new(provider, limiter.clone(), timeout, wait)?)
            }
            Source::PowerSchool => {
                Arc::new(PowerSchoolClient::new(provider, limiter.clone(), timeout, wait)?)
            }
        };
        info!(provider = %source, base_url = %provider.base_url, "Provider client configured");
        clients.insert(source, client);
    }
    Ok(clients)
}

/// Provider ids arrive as either JSON strings or numbers.
pub(crate) fn de_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a non-empty id, got {other}"
        ))),
    }
}

pub(crate) fn de_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected an id, got {other}"
        ))),
    }
}

/// Scores arrive as numbers, numeric strings, or blanks.
pub(crate) fn de_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got \"{s}\""))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a number, got {other}"
        ))),
    }
}

/// Flags arrive as booleans, 0/1, or "true"/"read" strings.
pub(crate) fn de_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "read"
        ),
        _ => false,
    })
}
