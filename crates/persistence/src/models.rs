use chrono::{DateTime, Utc};
use save_vault_core::{GameKey, Shop};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// Application-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppConfig {
    pub key: String,
    pub value: String,
    pub config_type: String, // "string", "json", "boolean", "number"
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tracked game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub id: Uuid,
    pub name: String,
    pub shop: Shop,
    pub object_id: String,
    pub display_name: Option<String>,
    pub custom_save_path: Option<String>,
    pub wine_prefix: Option<String>,
    pub backup_count: u32,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameRecord {
    pub fn key(&self) -> GameKey {
        GameKey::new(self.shop, self.object_id.clone())
    }

    /// Display name when set, otherwise the name.
    pub fn title(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Fields supplied when registering a game.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGame {
    pub name: String,
    pub shop: Shop,
    pub object_id: String,
    pub display_name: Option<String>,
    pub custom_save_path: Option<String>,
    pub wine_prefix: Option<String>,
}

fn parse_timestamp(index: &str, raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: index.to_string(),
            source: Box::new(e),
        })
}

// Ids and timestamps are stored as TEXT.
impl FromRow<'_, sqlx::sqlite::SqliteRow> for GameRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let id_str: String = row.try_get("id")?;
        let id = Uuid::parse_str(&id_str).map_err(|e| sqlx::Error::ColumnDecode {
            index: "id".to_string(),
            source: Box::new(e),
        })?;

        let shop_str: String = row.try_get("shop")?;
        let backup_count: i64 = row.try_get("backup_count")?;

        let last_backup_at = match row.try_get::<Option<String>, _>("last_backup_at")? {
            Some(s) => Some(parse_timestamp("last_backup_at", &s)?),
            None => None,
        };
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(GameRecord {
            id,
            name: row.try_get("name")?,
            shop: Shop::parse(&shop_str),
            object_id: row.try_get("object_id")?,
            display_name: row.try_get("display_name")?,
            custom_save_path: row.try_get("custom_save_path")?,
            wine_prefix: row.try_get("wine_prefix")?,
            backup_count: u32::try_from(backup_count).unwrap_or(0),
            last_backup_at,
            created_at: parse_timestamp("created_at", &created_at)?,
            updated_at: parse_timestamp("updated_at", &updated_at)?,
        })
    }
}
