use anyhow::Result;
use save_vault_cloud::{DriveTokens, OAuthClientSecrets};
use save_vault_core::ToolConfig;
use save_vault_persistence::{keys, ConfigStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Cloud folder remembered across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultFolder {
    pub id: String,
    pub name: String,
}

/// Settings loaded once at startup and handed to every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub backup_root: PathBuf,
    pub ludusavi_binary: PathBuf,
    pub ludusavi_config: Option<PathBuf>,
    pub cloud_enabled: bool,
    pub cloud_credentials_path: Option<PathBuf>,
    pub cloud_access_token: Option<String>,
    pub cloud_refresh_token: Option<String>,
    pub default_folder: Option<DefaultFolder>,
}

impl AppSettings {
    /// Defaults rooted at the application data directory.
    pub fn defaults_in(data_dir: &Path) -> Self {
        let tool = ToolConfig::in_dir(&data_dir.join("ludusavi"));
        Self {
            backup_root: data_dir.join("backups"),
            ludusavi_binary: tool.binary_path,
            ludusavi_config: tool.config_file,
            cloud_enabled: false,
            cloud_credentials_path: None,
            cloud_access_token: None,
            cloud_refresh_token: None,
            default_folder: None,
        }
    }

    pub async fn load(store: &ConfigStore, data_dir: &Path) -> Result<Self> {
        let mut settings = Self::defaults_in(data_dir);

        if let Some(root) = store.get_string_config(keys::BACKUP_ROOT_PATH).await? {
            settings.backup_root = PathBuf::from(root);
        }
        if let Some(binary) = store.get_string_config(keys::LUDUSAVI_BINARY_PATH).await? {
            settings.ludusavi_binary = PathBuf::from(binary);
        }
        if let Some(config) = store.get_string_config(keys::LUDUSAVI_CONFIG_PATH).await? {
            settings.ludusavi_config = Some(PathBuf::from(config));
        }
        settings.cloud_enabled = store.get_bool_config(keys::CLOUD_ENABLED).await?.unwrap_or(false);
        settings.cloud_credentials_path = store
            .get_string_config(keys::CLOUD_CREDENTIALS_PATH)
            .await?
            .map(PathBuf::from);
        settings.cloud_access_token = store.get_string_config(keys::CLOUD_ACCESS_TOKEN).await?;
        settings.cloud_refresh_token = store.get_string_config(keys::CLOUD_REFRESH_TOKEN).await?;

        // Only a complete pair counts.
        let folder_id = store.get_string_config(keys::CLOUD_DEFAULT_FOLDER_ID).await?;
        let folder_name = store.get_string_config(keys::CLOUD_DEFAULT_FOLDER_NAME).await?;
        settings.default_folder = match (folder_id, folder_name) {
            (Some(id), Some(name)) if !id.is_empty() && !name.is_empty() => Some(DefaultFolder { id, name }),
            _ => None,
        };

        Ok(settings)
    }

    pub async fn save(&self, store: &ConfigStore) -> Result<()> {
        store
            .set_string_config(keys::BACKUP_ROOT_PATH, &self.backup_root.to_string_lossy())
            .await?;
        store
            .set_string_config(keys::LUDUSAVI_BINARY_PATH, &self.ludusavi_binary.to_string_lossy())
            .await?;
        let config = self.ludusavi_config.as_ref().map(|p| p.to_string_lossy().into_owned());
        store
            .set_optional_string_config(keys::LUDUSAVI_CONFIG_PATH, config.as_deref())
            .await?;
        store.set_bool_config(keys::CLOUD_ENABLED, self.cloud_enabled).await?;
        let credentials = self
            .cloud_credentials_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        store
            .set_optional_string_config(keys::CLOUD_CREDENTIALS_PATH, credentials.as_deref())
            .await?;
        self.save_tokens(store).await?;
        self.save_default_folder(store).await
    }

    pub async fn save_tokens(&self, store: &ConfigStore) -> Result<()> {
        store
            .set_optional_string_config(keys::CLOUD_ACCESS_TOKEN, self.cloud_access_token.as_deref())
            .await?;
        store
            .set_optional_string_config(keys::CLOUD_REFRESH_TOKEN, self.cloud_refresh_token.as_deref())
            .await
    }

    pub async fn save_default_folder(&self, store: &ConfigStore) -> Result<()> {
        let folder = self.default_folder.as_ref();
        store
            .set_optional_string_config(keys::CLOUD_DEFAULT_FOLDER_ID, folder.map(|f| f.id.as_str()))
            .await?;
        store
            .set_optional_string_config(keys::CLOUD_DEFAULT_FOLDER_NAME, folder.map(|f| f.name.as_str()))
            .await
    }

    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig::new(self.ludusavi_binary.clone(), self.ludusavi_config.clone())
    }

    /// Stored session, if any access token was saved.
    pub fn drive_tokens(&self) -> Option<DriveTokens> {
        self.cloud_access_token.as_ref().map(|access| DriveTokens {
            access_token: access.clone(),
            refresh_token: self.cloud_refresh_token.clone(),
        })
    }

    pub fn set_drive_tokens(&mut self, tokens: &DriveTokens) {
        self.cloud_access_token = Some(tokens.access_token.clone());
        self.cloud_refresh_token = tokens.refresh_token.clone();
    }

    /// OAuth client from the credentials file. Without it tokens cannot be
    /// refreshed, but an unexpired access token still works.
    pub fn client_secrets(&self) -> Option<OAuthClientSecrets> {
        let path = self.cloud_credentials_path.as_ref()?;
        match OAuthClientSecrets::from_file(path) {
            Ok(secrets) => Some(secrets),
            Err(e) => {
                log::warn!("[BackupManager] unusable credentials file {}: {e:#}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use save_vault_persistence::Database;
    use tempfile::TempDir;

    async fn store() -> ConfigStore {
        ConfigStore::new(Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_defaults_when_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let settings = AppSettings::load(&store().await, dir.path()).await.unwrap();

        assert_eq!(settings.backup_root, dir.path().join("backups"));
        assert!(settings.ludusavi_binary.starts_with(dir.path().join("ludusavi")));
        assert!(!settings.cloud_enabled);
        assert!(settings.drive_tokens().is_none());
        assert!(settings.default_folder.is_none());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = store().await;

        let mut settings = AppSettings::defaults_in(dir.path());
        settings.backup_root = dir.path().join("elsewhere");
        settings.cloud_enabled = true;
        settings.cloud_access_token = Some("access".into());
        settings.cloud_refresh_token = Some("refresh".into());
        settings.default_folder = Some(DefaultFolder {
            id: "folder-1".into(),
            name: "My Saves".into(),
        });
        settings.save(&store).await.unwrap();

        let loaded = AppSettings::load(&store, dir.path()).await.unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.drive_tokens().unwrap().refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn test_half_set_default_folder_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store().await;
        store.set_string_config(keys::CLOUD_DEFAULT_FOLDER_ID, "only-id").await.unwrap();

        let loaded = AppSettings::load(&store, dir.path()).await.unwrap();
        assert!(loaded.default_folder.is_none());
    }

    #[test]
    fn test_client_secrets_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"installed":{"client_id":"id","client_secret":"s"}}"#).unwrap();

        let mut settings = AppSettings::defaults_in(dir.path());
        assert!(settings.client_secrets().is_none());

        settings.cloud_credentials_path = Some(path);
        assert_eq!(settings.client_secrets().unwrap().client_id, "id");

        settings.cloud_credentials_path = Some(dir.path().join("missing.json"));
        assert!(settings.client_secrets().is_none());
    }
}
