pub mod mapper;
pub mod models;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{Result, TrunchbullError};
use crate::models::common::Source;
use crate::normalizer::decode;
use crate::providers::http::ProviderHttp;
use crate::providers::{FetchContext, ProviderClient, RawRecord};
use crate::rate_limit::RateLimiter;

use self::models::{Page, SectionGrades};

const PAGE_SIZE: u32 = 200;

/// Schoology LMS client. Collections are paged with `start`/`limit` and
/// followed through `links.next`.
pub struct SchoologyClient {
    http: ProviderHttp,
    page_size: u32,
}

impl SchoologyClient {
    pub fn new(
        config: &ProviderConfig,
        limiter: Arc<RateLimiter>,
        request_timeout: Duration,
        permit_timeout: Duration,
    ) -> Result<Self> {
        let http = ProviderHttp::new(
            Source::Schoology,
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

    fn authorization(access_token: &str) -> String {
        format!("OAuth oauth_token=\"{access_token}\"")
    }

    /// Fetch every page of a collection endpoint; `key` is the JSON array
    /// holding the items.
    async fn get_all(&self, path: &str, key: &str, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let auth = Self::authorization(&ctx.access_token);
        let first_query = [
            ("start", "0".to_string()),
            ("limit", self.page_size.to_string()),
        ];
        let mut url = self.http.url(path);
        let mut query: &[(&str, String)] = &first_query;
        let mut results = Vec::new();

        loop {
            let value = self.http.get_json(&url, &auth, query, &ctx.cancel).await?;
            let items = items_under(&value, key)?;
            let page: Page = decode(&value)?;
            let count = items.len();
            results.extend(items);

            match page.links.next {
                Some(next) if count > 0 => {
                    debug!(path, fetched = results.len(), total = ?page.total, "Following next link");
                    url = self.http.url(&next);
                    query = &[];
                }
                _ => break,
            }
        }

        Ok(results)
    }
}

fn items_under(value: &Value, key: &str) -> Result<Vec<Value>> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(TrunchbullError::malformed(key, "expected an array")),
    }
}

/// Add `fields` to a JSON object without overwriting what the provider sent.
fn with_fields(mut record: Value, fields: &[(&str, &Value)]) -> Value {
    if let Value::Object(ref mut map) = record {
        for (k, v) in fields {
            map.entry(k.to_string()).or_insert_with(|| (*v).clone());
        }
    }
    record
}

fn flatten_section_grades(section: SectionGrades) -> Vec<RawRecord> {
    let section_id = Value::String(section.section_id.clone());
    let mut rows = Vec::new();
    let mut titles = Vec::new();

    for period in section.period {
        let period_id = period.period_id.map(Value::String).unwrap_or(Value::Null);
        let period_title = period
            .period_title
            .map(Value::String)
            .unwrap_or(Value::Null);
        titles.push((period_id.clone(), period_title.clone()));
        for assignment in period.assignment {
            rows.push(with_fields(
                assignment,
                &[
                    ("section_id", &section_id),
                    ("period_id", &period_id),
                    ("period_title", &period_title),
                ],
            ));
        }
    }

    for final_grade in section.final_grade {
        let title = final_grade
            .get("period_id")
            .and_then(|pid| titles.iter().find(|(id, _)| id == pid))
            .map(|(_, title)| title.clone())
            .unwrap_or(Value::Null);
        rows.push(with_fields(
            final_grade,
            &[("section_id", &section_id), ("period_title", &title)],
        ));
    }

    rows
}

#[async_trait]
impl ProviderClient for SchoologyClient {
    fn source(&self) -> Source {
        Source::Schoology
    }

    async fn fetch_courses(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let path = format!("/users/{}/sections", ctx.external_id);
        let sections = self.get_all(&path, "section", ctx).await?;
        info!(count = sections.len(), "Fetched Schoology sections");
        Ok(sections)
    }

    async fn fetch_assignments(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let sections = self.fetch_courses(ctx).await?;
        let mut assignments = Vec::new();
        for section in sections {
            let Some(section_id) = section.get("id").filter(|v| !v.is_null()).cloned() else {
                continue;
            };
            let sid = match section_id {
                Value::String(ref s) => s.clone(),
                ref other => other.to_string(),
            };
            let path = format!("/sections/{sid}/assignments");
            for a in self.get_all(&path, "assignment", ctx).await? {
                assignments.push(with_fields(a, &[("section_id", &section_id)]));
            }
        }
        info!(count = assignments.len(), "Fetched Schoology assignments");
        Ok(assignments)
    }

    async fn fetch_grades(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let path = format!("/users/{}/grades", ctx.external_id);
        let sections = self.get_all(&path, "section", ctx).await?;
        let mut grades = Vec::new();
        for raw in sections {
            match decode::<SectionGrades>(&raw) {
                Ok(section) => grades.extend(flatten_section_grades(section)),
                // Passed through whole so the normalizer rejects it as one record.
                Err(e) => {
                    warn!(error = %e, "Unreadable Schoology grade section");
                    grades.push(raw);
                }
            }
        }
        info!(count = grades.len(), "Fetched Schoology grades");
        Ok(grades)
    }

    async fn fetch_events(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        let path = format!("/users/{}/events", ctx.external_id);
        self.get_all(&path, "event", ctx).await
    }

    async fn fetch_messages(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>> {
        self.get_all("/messages/inbox", "message", ctx).await
    }
}
