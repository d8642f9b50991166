//! Per-student OAuth credentials: lookup and refresh.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::TrunchbullConfig;
use crate::db::repository::TokenRepository;
use crate::error::{Result, TrunchbullError};
use crate::models::common::Source;
use crate::models::token::OAuthToken;

/// Source of valid access tokens for the sync engine. The OAuth redirect
/// flow lives outside the engine; it only ever reads and refreshes.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fails with [`TrunchbullError::NotAuthenticated`] when the student
    /// never linked the provider.
    async fn get_token(&self, student_id: &str, source: Source) -> Result<OAuthToken>;

    /// Fails with [`TrunchbullError::AuthExpired`] when the provider refuses
    /// the refresh.
    async fn refresh_token(&self, student_id: &str, source: Source) -> Result<OAuthToken>;
}

/// OAuth token endpoint credentials for one provider.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token store backed by the repository, refreshing through each provider's
/// OAuth token endpoint with the `refresh_token` grant.
pub struct OAuthTokenStore {
    repo: Arc<dyn TokenRepository>,
    http: Client,
    endpoints: HashMap<Source, TokenEndpoint>,
    expiry_skew: Duration,
}

impl OAuthTokenStore {
    pub fn new(repo: Arc<dyn TokenRepository>, endpoints: HashMap<Source, TokenEndpoint>) -> Self {
        Self::with_http_client(repo, endpoints, Client::new())
    }

    /// Create a store with a custom reqwest::Client (useful for testing).
    pub fn with_http_client(
        repo: Arc<dyn TokenRepository>,
        endpoints: HashMap<Source, TokenEndpoint>,
        http: Client,
    ) -> Self {
        Self {
            repo,
            http,
            endpoints,
            expiry_skew: Duration::seconds(60),
        }
    }

    pub fn from_config(repo: Arc<dyn TokenRepository>, config: &TrunchbullConfig) -> Self {
        let endpoints = config
            .enabled_sources()
            .into_iter()
            .filter_map(|source| {
                let p = config.provider(source);
                p.token_url.as_ref().map(|url| {
                    (
                        source,
                        TokenEndpoint {
                            token_url: url.clone(),
                            client_id: p.client_id.clone(),
                            client_secret: p.client_secret.clone(),
                        },
                    )
                })
            })
            .collect();
        Self::new(repo, endpoints)
    }

    async fn stored(&self, student_id: &str, source: Source) -> Result<OAuthToken> {
        self.repo
            .get_token(student_id, source)
            .await?
            .ok_or_else(|| TrunchbullError::NotAuthenticated {
                provider: source.to_string(),
            })
    }
}

#[async_trait]
impl TokenStore for OAuthTokenStore {
    async fn get_token(&self, student_id: &str, source: Source) -> Result<OAuthToken> {
        let token = self.stored(student_id, source).await?;
        if !token.is_expired(Utc::now(), self.expiry_skew) {
            return Ok(token);
        }
        if token.refresh_token.is_none() {
            return Err(TrunchbullError::NotAuthenticated {
                provider: source.to_string(),
            });
        }
        debug!(student_id, provider = %source, "Stored token expired, refreshing");
        self.refresh_token(student_id, source).await
    }

    async fn refresh_token(&self, student_id: &str, source: Source) -> Result<OAuthToken> {
        let expired = || TrunchbullError::AuthExpired {
            provider: source.to_string(),
        };
        let current = self.stored(student_id, source).await?;
        let refresh = current.refresh_token.clone().ok_or_else(expired)?;
        let endpoint = self.endpoints.get(&source).ok_or_else(|| {
            warn!(provider = %source, "No token endpoint configured for refresh");
            expired()
        })?;

        let response = self
            .http
            .post(&endpoint.token_url)
            .basic_auth(&endpoint.client_id, Some(&endpoint.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(student_id, provider = %source, status = %status, body = %body, "Token refresh rejected");
            return Err(expired());
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            TrunchbullError::malformed("access_token", format!("bad token response: {e}"))
        })?;

        let token = OAuthToken {
            student_id: student_id.to_string(),
            source,
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.or(current.refresh_token),
            expires_at: parsed
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        };
        self.repo.save_token(&token).await?;
        info!(student_id, provider = %source, "Access token refreshed");
        Ok(token)
    }
}
