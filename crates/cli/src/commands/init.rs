use std::path::Path;

use trunchbull_core::config::TrunchbullConfig;
use trunchbull_core::crypto;
use trunchbull_core::db::DatabasePool;
use tracing::info;

/// Run the `init` command: write a default config and set up the database.
pub async fn run(config_path: &str, data_dir: &str, force: bool) -> anyhow::Result<()> {
    let config_file = Path::new(config_path);
    if config_file.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            config_file.display()
        );
    }

    let data_path = Path::new(data_dir);
    if !data_path.exists() {
        std::fs::create_dir_all(data_path)?;
        info!("Created data directory: {}", data_dir);
    }

    let db_path = data_path.join("trunchbull.db");
    let db_path_str = db_path.to_string_lossy().to_string();

    let mut config = TrunchbullConfig::generate_default();
    config.database.path = db_path_str.clone();
    config.database.encryption_key = Some(crypto::encode_key(&crypto::generate_key()));

    if let Some(parent) = config_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let toml_str = toml::to_string_pretty(&config)?;
    std::fs::write(config_file, &toml_str)?;
    info!("Wrote configuration to {}", config_file.display());

    DatabasePool::new_sqlite(&db_path_str).await?;
    info!("Database initialized at {}", db_path_str);

    println!("Trunchbull initialized successfully!");
    println!("  Configuration: {}", config_file.display());
    println!("  Database:      {}", db_path_str);
    println!();
    println!("Next steps:");
    println!("  1. Enable [schoology] and/or [powerschool] and fill in client credentials");
    println!("  2. Run 'trunchbull serve' to start the API and scheduler");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_writes_config_and_database() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("trunchbull.toml");
        let data_dir = dir.path().join("data");

        run(
            &config_path.to_string_lossy(),
            &data_dir.to_string_lossy(),
            false,
        )
        .await
        .unwrap();

        let config = TrunchbullConfig::load(&config_path).unwrap();
        config.validate().unwrap();
        assert!(config.database.path.ends_with("trunchbull.db"));
        assert!(config.database.encryption_key.is_some());
        assert!(data_dir.join("trunchbull.db").exists());
    }

    #[tokio::test]
    async fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("trunchbull.toml");
        std::fs::write(&config_path, "# existing").unwrap();
        let config_str = config_path.to_string_lossy().to_string();
        let data_dir = dir.path().join("data").to_string_lossy().to_string();

        assert!(run(&config_str, &data_dir, false).await.is_err());
        run(&config_str, &data_dir, true).await.unwrap();
        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("[database]"));
    }
}
