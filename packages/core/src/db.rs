//! SQLite connection pool and schema migrations.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Migrations embedded from `packages/core/migrations` at compile time.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connection settings for the relational backend.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Directory to load migrations from instead of the embedded set.
    pub migrations: Option<PathBuf>,
}

impl DbConfig {
    /// A private in-memory database. Pinned to one connection, since every
    /// SQLite `:memory:` connection is its own database.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            migrations: None,
        }
    }
}

/// Open a pool for `config.url`, creating the database file if needed.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_with(options)
        .await
}

/// Apply pending migrations from `source`, or the embedded set when `None`.
pub async fn run_migrations(pool: &SqlitePool, source: Option<&Path>) -> Result<(), MigrateError> {
    match source {
        Some(dir) => Migrator::new(dir).await?.run(pool).await,
        None => MIGRATOR.run(pool).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedded_migrations_create_events_table() {
        let pool = create_pool(&DbConfig::in_memory()).await.unwrap();
        run_migrations(&pool, None).await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = create_pool(&DbConfig::in_memory()).await.unwrap();
        run_migrations(&pool, None).await.unwrap();
        assert!(run_migrations(&pool, None).await.is_ok());
    }

    #[tokio::test]
    async fn missing_migration_directory_is_an_error() {
        let pool = create_pool(&DbConfig::in_memory()).await.unwrap();
        let result = run_migrations(&pool, Some(Path::new("/definitely/not/here"))).await;
        assert!(result.is_err());
    }
}
