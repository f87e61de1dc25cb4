use crate::{models::*, Database};
use anyhow::Result;
use chrono::{DateTime, Utc};
use save_vault_core::GameKey;
use uuid::Uuid;

/// Tracked games, one row per `(shop, object_id)`.
#[derive(Debug, Clone)]
pub struct GameRegistry {
    db: Database,
}

impl GameRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn add(&self, game: NewGame) -> Result<GameRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO games (
                id, name, shop, object_id, display_name, custom_save_path, wine_prefix,
                backup_count, last_backup_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8, ?8)
            "#,
        )
        .bind(id.to_string())
        .bind(&game.name)
        .bind(game.shop.as_str())
        .bind(&game.object_id)
        .bind(&game.display_name)
        .bind(&game.custom_save_path)
        .bind(&game.wine_prefix)
        .bind(&now)
        .execute(&self.db.pool)
        .await?;

        log::info!("[Database] registered game {} ({}:{})", game.name, game.shop, game.object_id);
        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Game {} vanished after insert", id))
    }

    pub async fn get(&self, id: &Uuid) -> Result<Option<GameRecord>> {
        let game = sqlx::query_as::<_, GameRecord>("SELECT * FROM games WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.db.pool)
            .await?;

        Ok(game)
    }

    pub async fn find_by_key(&self, key: &GameKey) -> Result<Option<GameRecord>> {
        let game = sqlx::query_as::<_, GameRecord>("SELECT * FROM games WHERE shop = ?1 AND object_id = ?2")
            .bind(key.shop.as_str())
            .bind(&key.object_id)
            .fetch_optional(&self.db.pool)
            .await?;

        Ok(game)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<GameRecord>> {
        let game = sqlx::query_as::<_, GameRecord>("SELECT * FROM games WHERE name = ?1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.db.pool)
            .await?;

        Ok(game)
    }

    /// All games in registration order.
    pub async fn list(&self) -> Result<Vec<GameRecord>> {
        let games = sqlx::query_as::<_, GameRecord>("SELECT * FROM games ORDER BY created_at, name")
            .fetch_all(&self.db.pool)
            .await?;

        Ok(games)
    }

    pub async fn remove(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM games WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Bump the backup count and stamp the last backup time.
    pub async fn record_backup(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE games
            SET backup_count = backup_count + 1, last_backup_at = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.db.pool)
        .await?;

        Ok(())
    }

    pub async fn set_backup_count(&self, id: &Uuid, count: u32) -> Result<()> {
        sqlx::query("UPDATE games SET backup_count = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(i64::from(count))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await?;

        Ok(())
    }
}
