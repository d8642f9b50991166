use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, TrunchbullError};
use crate::models::common::Source;
use crate::rate_limit::RateLimiter;
use crate::sync::cancel::CancelToken;

/// Shared transport for provider APIs: every request is gated by the
/// provider's rate-limit bucket and failures are mapped onto the error taxonomy.
pub struct ProviderHttp {
    source: Source,
    base_url: String,
    http: Client,
    limiter: Arc<RateLimiter>,
    permit_timeout: Duration,
}

impl ProviderHttp {
    pub fn new(
        source: Source,
        base_url: &str,
        limiter: Arc<RateLimiter>,
        request_timeout: Duration,
        permit_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TrunchbullError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(
            source,
            base_url,
            http,
            limiter,
            permit_timeout,
        ))
    }

    /// Create a transport with a custom reqwest::Client (useful for testing).
    pub fn with_http_client(
        source: Source,
        base_url: &str,
        http: Client,
        limiter: Arc<RateLimiter>,
        permit_timeout: Duration,
    ) -> Self {
        Self {
            source,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            limiter,
            permit_timeout,
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Resolve a path against the base URL. Absolute URLs (pagination links)
    /// pass through unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{path}", self.base_url)
        }
    }

    /// GET a JSON document.
    pub async fn get_json(
        &self,
        url: &str,
        authorization: &str,
        query: &[(&str, String)],
        cancel: &CancelToken,
    ) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(TrunchbullError::Cancelled);
        }
        self.limiter.acquire(self.source, self.permit_timeout).await?;

        debug!(provider = %self.source, url = %url, "Fetching page");
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, authorization)
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers(), Utc::now());
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %self.source, status = %status, url = %url, "API request failed");
            return Err(status_error(self.source, status, retry_after, &body));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            TrunchbullError::malformed("body", format!("response from {url} is not JSON: {e}"))
        })
    }
}

/// `Retry-After` as delay-seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

pub(crate) fn status_error(
    source: Source,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> TrunchbullError {
    let provider = source.to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TrunchbullError::AuthExpired { provider }
        }
        StatusCode::TOO_MANY_REQUESTS => TrunchbullError::RateLimited { retry_after },
        _ => TrunchbullError::UpstreamUnavailable {
            message: format!("{provider} returned {status}: {}", truncate(body, 200)),
            retry_after,
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
