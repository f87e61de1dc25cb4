use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::str::FromStr;

/// Database wrapper
#[derive(Debug, Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations.
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        log::debug!("[Database] opening {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create database directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| {
                if e.to_string().contains("unable to open database file") {
                    log::error!(
                        "[Database] SQLite cannot open {}: check permissions and free space",
                        db_path.display()
                    );
                }
                anyhow::anyhow!("Failed to connect to database: {}", e)
            })?;

        let db = Self { pool };
        db.run_migrations().await?;
        log::info!("[Database] ready at {}", db_path.display());
        Ok(db)
    }

    /// Private in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        // One connection: every new connection to `:memory:` is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS app_configs (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                config_type TEXT NOT NULL DEFAULT 'string',
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS games (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                shop TEXT NOT NULL,
                object_id TEXT NOT NULL,
                display_name TEXT,
                custom_save_path TEXT,
                wine_prefix TEXT,
                backup_count INTEGER NOT NULL DEFAULT 0,
                last_backup_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_games_shop_object ON games(shop, object_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_name ON games(name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get database pool reference
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Close database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Execute a health check on the database
    pub async fn health_check(&self) -> Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;

        Ok(row.0 == 1)
    }
}
