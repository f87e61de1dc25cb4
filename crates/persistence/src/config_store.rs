use crate::{models::*, Database};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;

/// Well-known configuration keys.
pub mod keys {
    pub const BACKUP_ROOT_PATH: &str = "backup.root_path";
    pub const LUDUSAVI_BINARY_PATH: &str = "ludusavi.binary_path";
    pub const LUDUSAVI_CONFIG_PATH: &str = "ludusavi.config_path";
    pub const CLOUD_ENABLED: &str = "cloud.enabled";
    pub const CLOUD_CREDENTIALS_PATH: &str = "cloud.credentials_path";
    pub const CLOUD_ACCESS_TOKEN: &str = "cloud.access_token";
    pub const CLOUD_REFRESH_TOKEN: &str = "cloud.refresh_token";
    pub const CLOUD_DEFAULT_FOLDER_ID: &str = "cloud.default_folder_id";
    pub const CLOUD_DEFAULT_FOLDER_NAME: &str = "cloud.default_folder_name";
}

/// Configuration store
#[derive(Debug, Clone)]
pub struct ConfigStore {
    db: Database,
}

impl ConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Set application configuration
    pub async fn set_app_config(&self, key: &str, value: &str, config_type: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO app_configs (key, value, config_type, created_at, updated_at)
            VALUES (?1, ?2, ?3, COALESCE((SELECT created_at FROM app_configs WHERE key = ?1), ?4), ?4)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(config_type)
        .bind(&now)
        .execute(&self.db.pool)
        .await?;

        Ok(())
    }

    /// Get application configuration
    pub async fn get_app_config(&self, key: &str) -> Result<Option<AppConfig>> {
        let config = sqlx::query_as::<_, AppConfig>("SELECT * FROM app_configs WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.db.pool)
            .await?;

        Ok(config)
    }

    pub async fn get_all_app_configs(&self) -> Result<Vec<AppConfig>> {
        let configs = sqlx::query_as::<_, AppConfig>("SELECT * FROM app_configs ORDER BY key")
            .fetch_all(&self.db.pool)
            .await?;

        Ok(configs)
    }

    /// Delete application configuration
    pub async fn delete_app_config(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM app_configs WHERE key = ?1")
            .bind(key)
            .execute(&self.db.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_string_config(&self, key: &str, value: &str) -> Result<()> {
        self.set_app_config(key, value, "string").await
    }

    pub async fn get_string_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_app_config(key).await?.map(|config| config.value))
    }

    /// Store `Some` as a string, delete the key for `None`.
    pub async fn set_optional_string_config(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.set_string_config(key, value).await,
            None => self.delete_app_config(key).await.map(|_| ()),
        }
    }

    pub async fn set_bool_config(&self, key: &str, value: bool) -> Result<()> {
        self.set_app_config(key, &value.to_string(), "boolean").await
    }

    pub async fn get_bool_config(&self, key: &str) -> Result<Option<bool>> {
        match self.get_app_config(key).await? {
            Some(config) => Ok(Some(config.value.parse::<bool>()?)),
            None => Ok(None),
        }
    }

    pub async fn set_number_config(&self, key: &str, value: i64) -> Result<()> {
        self.set_app_config(key, &value.to_string(), "number").await
    }

    pub async fn get_number_config(&self, key: &str) -> Result<Option<i64>> {
        match self.get_app_config(key).await? {
            Some(config) => Ok(Some(config.value.parse::<i64>()?)),
            None => Ok(None),
        }
    }

    pub async fn set_json_config(&self, key: &str, value: &Value) -> Result<()> {
        let json_str = serde_json::to_string(value)?;
        self.set_app_config(key, &json_str, "json").await
    }

    pub async fn get_json_config(&self, key: &str) -> Result<Option<Value>> {
        match self.get_app_config(key).await? {
            Some(config) => Ok(Some(serde_json::from_str(&config.value)?)),
            None => Ok(None),
        }
    }
}
