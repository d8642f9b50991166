pub mod repository;
pub mod sqlite;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::Result;

pub enum DatabasePool {
    Sqlite(SqlitePool),
}

impl DatabasePool {
    /// Open (creating if missing) a SQLite database file and run migrations.
    pub async fn new_sqlite(path: &str) -> Result<Self> {
        info!(path, "Opening database");
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(DatabasePool::Sqlite(pool))
    }

    /// Create a new in-memory SQLite database pool and run migrations. Useful for testing.
    pub async fn new_sqlite_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")?.foreign_keys(true);
        // One connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(DatabasePool::Sqlite(pool))
    }

    pub fn into_sqlite(self) -> SqlitePool {
        match self {
            DatabasePool::Sqlite(pool) => pool,
        }
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(pool)
            .await?;

        let migrations: &[&str] = &[include_str!(
            "../../../../migrations/sqlite/001_initial_schema.sql"
        )];

        for (i, migration_sql) in migrations.iter().enumerate() {
            debug!(migration = i + 1, total = migrations.len(), "Running migration");
            for statement in migration_sql.split(';') {
                let trimmed = statement.trim();
                if is_blank_or_comment(trimmed) || trimmed.starts_with("PRAGMA") {
                    continue;
                }
                sqlx::query(trimmed).execute(pool).await?;
            }
        }
        info!("Database migrations completed");
        Ok(())
    }
}

fn is_blank_or_comment(statement: &str) -> bool {
    statement
        .lines()
        .all(|line| line.trim().is_empty() || line.trim_start().starts_with("--"))
}
