pub mod init;
pub mod serve;
pub mod status;
pub mod sync;

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use trunchbull_core::config::TrunchbullConfig;
use trunchbull_core::crypto;
use trunchbull_core::db::sqlite::SqliteRepository;
use trunchbull_core::db::DatabasePool;
use trunchbull_core::providers::clients_from_config;
use trunchbull_core::rate_limit::RateLimiter;
use trunchbull_core::sync::SyncOrchestrator;
use trunchbull_core::token_store::OAuthTokenStore;

/// Load the config file, apply `TRUNCHBULL_*` overrides and validate.
pub(crate) fn load_config(config_path: &str) -> anyhow::Result<TrunchbullConfig> {
    let config = TrunchbullConfig::load_with_env(Path::new(config_path))?;
    config.validate()?;
    info!("Loaded configuration from {}", config_path);
    Ok(config)
}

/// Open the database (running migrations) and attach the token key if one is configured.
pub(crate) async fn open_repository(config: &TrunchbullConfig) -> anyhow::Result<SqliteRepository> {
    let pool = DatabasePool::new_sqlite(&config.database.path).await?;
    let repo = SqliteRepository::new(pool.into_sqlite());
    match config.database.encryption_key {
        Some(ref key) => Ok(repo.with_token_key(crypto::decode_key(key)?)),
        None => Ok(repo),
    }
}

/// Wire the token store, rate limiter and provider clients into an orchestrator.
pub(crate) fn build_orchestrator(
    repo: SqliteRepository,
    config: &TrunchbullConfig,
) -> anyhow::Result<SyncOrchestrator<SqliteRepository>> {
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limits));
    let tokens = OAuthTokenStore::from_config(Arc::new(repo.clone()), config);
    let mut orchestrator = SyncOrchestrator::new(repo, Arc::new(tokens), config);
    for client in clients_from_config(config, limiter)?.into_values() {
        orchestrator = orchestrator.with_client(client);
    }
    Ok(orchestrator)
}
