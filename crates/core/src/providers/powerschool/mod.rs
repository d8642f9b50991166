pub mod mapper;
pub mod models;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::error::{Result, TrunchbullError};
use crate::models::common::Source;
use crate::providers::http::ProviderHttp;
use crate::providers::{FetchContext, ProviderClient, RawRecord};
use crate::rate_limit::RateLimiter;

const PAGE_SIZE: u32 = 100;

/// PowerSchool SIS client. Collections are paged with `page`/`pagesize`
/// until a short page comes back.
pub struct PowerSchoolClient {
    http: ProviderHttp,
    page_size: u32,
}

impl PowerSchoolClient {
    pub fn new(
        config: &ProviderConfig,
        limiter: Arc<RateLimiter>,
        request_timeout: Duration,
        permit_timeout: Duration,
    ) -> Result<Self> {
        let http = ProviderHttp::new(
            Source::PowerSchool,
            &config.base_url,
            limiter,
            request_timeout,
            permit_timeout,
        )?;
        Ok(Self::from_transport(http))
    }

    /// Create from a pre-built transport (useful for testing).
    pub fn from_transport(http: ProviderHttp) -> Self {
        Self {
            http,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fetch every page of `/ws/v1/student/{id}/{resource}`. Items live under
    /// `{"<plural>": {"<singular>": [...]}}`.
    async fn get_all(
        &self,
        resource: &str,
        plural: &str,
        singular: &str,
        ctx: &FetchContext,
    ) -> Result<Vec<RawRecord>> {
        let auth = format!("Bearer {}", ctx.access_token);
        let url = self
            .http
            .url(&format!("/ws/v1/student/{}/{resource}", ctx.external_id));
        let mut results = Vec::new();
        let mut page: u32 = 1;

        loop {
            let query = [
                ("page", page.to_string()),
                ("pagesize", self.page_size.to_string()),
            ];
            let value = self.http.get_json(&url, &auth, &query, &ctx.cancel).await?;
            let items = unwrap_collection(&value, plural, singular)?;
            let count = items.len();
            results.extend(items);

            if (count as u32) < self.page_size {
                debug!(resource, page, count, "Last page received");
                break;
            }
            page += 1;
        }

        Ok(results)
    }
}

/// PowerSchool returns a bare object instead of a one-element array, and an
/// empty string or null for empty collections.
fn unwrap_collection(value: &Value, plural: &str, singular: &str) -> Result<Vec<Value>> {
    let inner = match value.get(plural) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(s)) if s.is_empty() => return Ok(Vec::new()),
        Some(Value::Object(map)) => map.get(singular),
        Some(_) => return Err(TrunchbullError::malformed(plural, "expected an object")),
    };
    match inner {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(item @ Value::Object(_)) => Ok(vec![item.clone()]),
        Some(_) => Err(TrunchbullError::malformed(
            singular,
            "expected an array or object",
        )),
    }
}

#[async_trait]
impl ProviderClient for PowerSchoolClient {
    fn source(&self) -> Source {
        Source::PowerSchool
    }

    async fn fetch_courses(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let sections = self.get_all("section", "sections", "section", ctx).await?;
        info!(count = sections.len(), "Fetched PowerSchool sections");
        Ok(sections)
    }

    async fn fetch_assignments(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let assignments = self
            .get_all("assignment", "assignments", "assignment", ctx)
            .await?;
        info!(count = assignments.len(), "Fetched PowerSchool assignments");
        Ok(assignments)
    }

    async fn fetch_grades(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let grades = self.get_all("grade", "grades", "grade", ctx).await?;
        info!(count = grades.len(), "Fetched PowerSchool grades");
        Ok(grades)
    }

    async fn fetch_events(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        self.get_all("event", "events", "event", ctx).await
    }

    async fn fetch_messages(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        self.get_all("notification", "notifications", "notification", ctx)
            .await
    }
}
