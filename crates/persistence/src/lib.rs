pub mod config_store;
pub mod database;
pub mod game_registry;
pub mod models;

pub use config_store::*;
pub use database::*;
pub use game_registry::*;
pub use models::*;

use anyhow::Result;
use std::path::PathBuf;

pub const DATABASE_FILE: &str = "save-vault.db";

/// Initialize the persistence layer
pub async fn initialize_persistence() -> Result<PersistenceManager> {
    let data_dir = get_data_directory()?;
    log::debug!("[Database] data directory: {}", data_dir.display());

    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        log::info!("[Database] created data directory {}", data_dir.display());
    }

    let db = Database::new(data_dir.join(DATABASE_FILE)).await?;
    Ok(PersistenceManager::new(db))
}

/// Get the application data directory
pub fn get_data_directory() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
        .join("save-vault");
    Ok(data_dir)
}

/// Main persistence manager
pub struct PersistenceManager {
    pub database: Database,
    pub config_store: ConfigStore,
    pub games: GameRegistry,
}

impl PersistenceManager {
    pub fn new(database: Database) -> Self {
        let config_store = ConfigStore::new(database.clone());
        let games = GameRegistry::new(database.clone());

        Self {
            database,
            config_store,
            games,
        }
    }
}
