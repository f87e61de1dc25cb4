use crate::settings::{AppSettings, DefaultFolder};
use crate::ManagerError;
use anyhow::{Context, Result};
use chrono::Utc;
use save_vault_cloud::{CloudBackupStore, CloudError, DriveBackend, RemoteFile, ROOT_FOLDER_ID};
use save_vault_core::models::default_label;
use save_vault_core::{
    Achievement, BackupError, BackupRecord, BackupRef, GameKey, LocalBackupStore, SaveTool, ScanCancel,
    ScanProgress, ScanReport,
};
use save_vault_persistence::{ConfigStore, GameRecord, GameRegistry, NewGame};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Scratch directory under the backup root for cloud restores.
pub const RESTORE_SCRATCH_DIR: &str = "temp-restore";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    Detecting,
    BackingUp,
    Uploading,
    Restoring,
    Complete,
    Error,
}

/// Progress event for long-running operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    /// `None` for events that concern no single game.
    pub game_id: Option<Uuid>,
    pub status: BackupStatus,
    pub progress: u8,
    pub message: String,
}

impl BackupProgress {
    pub fn new(game_id: Option<Uuid>, status: BackupStatus, progress: u8, message: impl Into<String>) -> Self {
        Self {
            game_id,
            status,
            progress,
            message: message.into(),
        }
    }
}

pub type ProgressSink = dyn Fn(BackupProgress) + Send + Sync;

/// Upload progress as a percentage.
pub type PercentProgress<'a> = dyn Fn(u8) + Send + Sync + 'a;

/// One game and all its backups, newest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameBackups {
    pub game: GameRecord,
    pub backups: Vec<BackupRecord>,
}

/// Outcome of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: Vec<(Uuid, String)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// Overall progress while item `index` of `total` is at `inner` percent.
fn batch_percent(index: usize, total: usize, inner: u8) -> u8 {
    if total == 0 {
        return 100;
    }
    let overall = ((index * 100) as f64 + f64::from(inner)) / total as f64;
    overall.round().min(100.0) as u8
}

/// Removed on drop, whatever the outcome of the work done inside it.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    async fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("Failed to clear {}", path.display()))?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("[BackupManager] removed {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::error!("[BackupManager] failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// Coordinates the game registry, the local store and the cloud store.
pub struct BackupManager {
    settings: RwLock<AppSettings>,
    config_store: ConfigStore,
    games: GameRegistry,
    local: LocalBackupStore,
    cloud: Option<CloudBackupStore>,
}

impl BackupManager {
    pub fn new(
        settings: AppSettings,
        config_store: ConfigStore,
        games: GameRegistry,
        tool: Arc<dyn SaveTool>,
        drive: Option<Arc<dyn DriveBackend>>,
    ) -> Self {
        let local = LocalBackupStore::new(settings.backup_root.clone(), tool);
        Self {
            settings: RwLock::new(settings),
            config_store,
            games,
            local,
            cloud: drive.map(CloudBackupStore::new),
        }
    }

    pub async fn settings(&self) -> AppSettings {
        self.settings.read().await.clone()
    }

    pub fn local_store(&self) -> &LocalBackupStore {
        &self.local
    }

    pub fn cloud_store(&self) -> Option<&CloudBackupStore> {
        self.cloud.as_ref()
    }

    pub fn ensure_backup_directory(&self) -> Result<()> {
        self.local.ensure_layout()?;
        log::debug!("[BackupManager] backup root ready at {}", self.local.root().display());
        Ok(())
    }

    async fn game(&self, id: &Uuid) -> Result<GameRecord> {
        self.games
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::GameNotFound(id.to_string()).into())
    }

    /// The cloud store, if cloud storage is enabled and configured.
    async fn require_cloud(&self) -> Result<&CloudBackupStore> {
        if !self.settings.read().await.cloud_enabled {
            return Err(ManagerError::CloudDisabled.into());
        }
        self.cloud
            .as_ref()
            .ok_or_else(|| anyhow::Error::from(ManagerError::CloudDisabled))
    }

    /// The cloud store when it is usable for listings right now.
    async fn cloud_if_ready(&self) -> Option<&CloudBackupStore> {
        let cloud = self.require_cloud().await.ok()?;
        if cloud.is_authenticated().await {
            Some(cloud)
        } else {
            log::warn!("[BackupManager] cloud storage enabled but not authenticated, skipping cloud backups");
            None
        }
    }

    /// Cloud store for recounting. `Ok(None)` when cloud storage is off;
    /// an error when it is on but unreachable, since local totals alone
    /// would then understate the count.
    async fn counting_cloud(&self) -> Result<Option<&CloudBackupStore>> {
        let Ok(cloud) = self.require_cloud().await else {
            return Ok(None);
        };
        if !cloud.is_authenticated().await {
            return Err(CloudError::NotAuthenticated.into());
        }
        Ok(Some(cloud))
    }

    async fn preferred_parent(&self) -> Option<String> {
        self.settings
            .read()
            .await
            .default_folder
            .as_ref()
            .map(|folder| folder.id.clone())
    }

    async fn main_folder(&self, folder_name: Option<&str>) -> Option<String> {
        match folder_name {
            Some(name) => Some(name.to_string()),
            None => self
                .settings
                .read()
                .await
                .default_folder
                .as_ref()
                .map(|folder| folder.name.clone()),
        }
    }

    // Games

    /// Register a game. An empty object id falls back to the name; a custom
    /// save path is also registered with the save tool.
    pub async fn add_game(&self, mut game: NewGame) -> Result<GameRecord> {
        if game.object_id.trim().is_empty() {
            game.object_id = game.name.clone();
        }
        if self.games.find_by_name(&game.name).await?.is_some() {
            return Err(ManagerError::DuplicateGame(game.name).into());
        }
        let key = GameKey::new(game.shop, game.object_id.clone());
        if self.games.find_by_key(&key).await?.is_some() {
            return Err(ManagerError::DuplicateGame(key.to_string()).into());
        }

        if let Some(path) = game.custom_save_path.as_deref() {
            self.local
                .tool()
                .add_custom_game(&game.object_id, Path::new(path))
                .await?;
        }

        let record = self.games.add(game).await?;
        log::info!("[BackupManager] added game {} ({})", record.title(), record.key());
        Ok(record)
    }

    pub async fn remove_game(&self, id: &Uuid) -> Result<()> {
        let game = self.game(id).await?;
        if game.custom_save_path.is_some() {
            if let Err(e) = self.local.tool().remove_custom_game(&game.object_id).await {
                log::warn!("[BackupManager] could not remove custom game {}: {e:#}", game.object_id);
            }
        }
        self.games.remove(id).await?;
        log::info!("[BackupManager] removed game {}", game.title());
        Ok(())
    }

    pub async fn list_games(&self) -> Result<Vec<GameRecord>> {
        self.games.list().await
    }

    // Tool pass-through

    pub async fn preview(&self, game_id: &Uuid) -> Result<ScanReport> {
        let game = self.game(game_id).await?;
        self.local.tool().preview(&game.key()).await
    }

    pub async fn scan_all(&self, on_progress: &ScanProgress, cancel: &ScanCancel) -> Result<ScanReport> {
        self.local.tool().scan_all(on_progress, cancel).await
    }

    pub async fn find_installed_games(&self) -> Vec<String> {
        self.local.tool().find_installed_games().await
    }

    // Backups

    pub async fn create_local_backup(
        &self,
        game_id: &Uuid,
        label: Option<&str>,
        on_progress: &ProgressSink,
    ) -> Result<BackupRecord> {
        let game = self.game(game_id).await?;
        match self.backup_game(&game, label, on_progress).await {
            Ok(record) => Ok(record),
            Err(e) => {
                on_progress(BackupProgress::new(
                    Some(game.id),
                    BackupStatus::Error,
                    0,
                    format!("Backup of {} failed: {e}", game.title()),
                ));
                Err(e)
            }
        }
    }

    async fn backup_game(&self, game: &GameRecord, label: Option<&str>, on_progress: &ProgressSink) -> Result<BackupRecord> {
        let key = game.key();
        on_progress(BackupProgress::new(
            Some(game.id),
            BackupStatus::Detecting,
            0,
            format!("Detecting save files for {}...", game.title()),
        ));
        on_progress(BackupProgress::new(
            Some(game.id),
            BackupStatus::BackingUp,
            30,
            "Creating backup...",
        ));

        let record = self
            .local
            .create_backup(&key, label, game.wine_prefix.as_deref(), &[])
            .await?;
        self.games.record_backup(&game.id, record.created_at).await?;

        on_progress(BackupProgress::new(
            Some(game.id),
            BackupStatus::Complete,
            100,
            "Backup completed successfully",
        ));
        log::info!("[BackupManager] backup {} created for {}", record.id, game.title());
        Ok(record)
    }

    /// Upload an existing local backup. Returns the remote folder id.
    pub async fn upload_existing_backup(
        &self,
        backup_id: &str,
        key: &GameKey,
        on_progress: &PercentProgress<'_>,
        folder_name: Option<&str>,
    ) -> Result<String> {
        let cloud = self.require_cloud().await?;
        let backup_dir = self.local.backup_dir(key, backup_id);
        if !backup_dir.is_dir() {
            return Err(BackupError::BackupDirectoryNotFound(backup_dir).into());
        }

        let main = self.main_folder(folder_name).await;
        let report = |done: usize, total: usize| on_progress(percent(done, total));
        let remote_id = cloud
            .upload_backup(key, &backup_dir, backup_id, main.as_deref(), &report)
            .await?;

        log::info!("[BackupManager] uploaded backup {} of {} as {}", backup_id, key, remote_id);
        Ok(remote_id)
    }

    /// Back up straight to the cloud through a temporary directory that is
    /// removed whether or not the upload succeeds.
    pub async fn create_ephemeral_and_upload(
        &self,
        game_id: &Uuid,
        label: Option<&str>,
        on_progress: &PercentProgress<'_>,
        folder_name: Option<&str>,
    ) -> Result<String> {
        let game = self.game(game_id).await?;
        let cloud = self.require_cloud().await?;
        let key = game.key();
        let main = self.main_folder(folder_name).await;
        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| default_label(Utc::now()));

        let ephemeral = self.local.create_ephemeral_backup(&key).await?;
        log::info!(
            "[BackupManager] uploading \"{}\" for {} as ephemeral backup {}",
            label,
            game.title(),
            ephemeral.id
        );

        let report = |done: usize, total: usize| on_progress(percent(done, total));
        let result = cloud
            .upload_backup(&key, &ephemeral.backup_dir, &ephemeral.id, main.as_deref(), &report)
            .await;

        let temp_root = ephemeral.temp_root().to_path_buf();
        match ephemeral.cleanup() {
            Ok(()) => log::debug!("[BackupManager] removed ephemeral backup {}", temp_root.display()),
            Err(e) => log::error!("[BackupManager] failed to remove ephemeral backup: {e:#}"),
        }

        result
    }

    /// Restore a local or cloud backup. Cloud backups are downloaded into a
    /// scratch directory under the backup root first.
    pub async fn restore_backup(
        &self,
        backup: &BackupRef,
        key: &GameKey,
        on_progress: &ProgressSink,
    ) -> Result<Vec<Achievement>> {
        let (game_id, wine_prefix) = match self.games.find_by_key(key).await? {
            Some(game) => (Some(game.id), game.wine_prefix),
            None => (None, None),
        };
        let emit = |status: BackupStatus, progress: u8, message: &str| {
            on_progress(BackupProgress::new(game_id, status, progress, message))
        };

        emit(BackupStatus::Restoring, 0, "Preparing restore...");
        let result = match backup {
            BackupRef::Local(id) => {
                emit(BackupStatus::Restoring, 50, "Restoring files...");
                self.local
                    .restore_backup(key, id, wine_prefix.as_deref(), None)
                    .await
            }
            BackupRef::Cloud(remote_id) => {
                self.restore_from_cloud(key, remote_id, wine_prefix.as_deref(), &emit)
                    .await
            }
        };

        match result {
            Ok(achievements) => {
                emit(BackupStatus::Complete, 100, "Restore completed successfully");
                log::info!("[BackupManager] restored {} for {}", backup, key);
                Ok(achievements)
            }
            Err(e) => {
                emit(BackupStatus::Error, 0, &format!("Restore failed: {e}"));
                Err(e)
            }
        }
    }

    async fn restore_from_cloud(
        &self,
        key: &GameKey,
        remote_id: &str,
        wine_prefix: Option<&str>,
        emit: &(dyn Fn(BackupStatus, u8, &str) + Send + Sync),
    ) -> Result<Vec<Achievement>> {
        let cloud = self.require_cloud().await?;

        emit(BackupStatus::Restoring, 20, "Downloading backup from cloud storage...");
        let scratch = ScratchDir::create(self.local.root().join(RESTORE_SCRATCH_DIR)).await?;
        cloud.download_backup(key, remote_id, scratch.path()).await?;

        emit(BackupStatus::Restoring, 50, "Restoring files...");
        self.local
            .restore_backup(key, remote_id, wine_prefix, Some(scratch.path()))
            .await
    }

    /// Delete a backup from wherever it lives, then recount the game.
    pub async fn delete_backup(&self, backup: &BackupRef, key: &GameKey) -> Result<()> {
        match backup {
            BackupRef::Local(id) => self.local.delete_backup(key, id).await?,
            BackupRef::Cloud(remote_id) => {
                self.require_cloud()
                    .await?
                    .delete_backup(key, remote_id)
                    .await?
            }
        }

        if let Some(game) = self.games.find_by_key(key).await? {
            let parent = self.preferred_parent().await;
            let count = match self.counting_cloud().await {
                Ok(cloud) => self.count_backups(key, cloud, parent.as_deref()).await,
                Err(e) => Err(e),
            };
            match count {
                Ok(count) => {
                    self.games.set_backup_count(&game.id, count).await?;
                    log::debug!("[BackupManager] {} now has {} backups", game.title(), count);
                }
                Err(e) => log::warn!(
                    "[BackupManager] backup count of {} left unchanged: {e:#}",
                    game.title()
                ),
            }
        }
        log::info!("[BackupManager] deleted backup {} of {}", backup, key);
        Ok(())
    }

    /// Local plus cloud backups. A failed cloud listing fails the count.
    async fn count_backups(
        &self,
        key: &GameKey,
        cloud: Option<&CloudBackupStore>,
        preferred_parent: Option<&str>,
    ) -> Result<u32> {
        let local = self.local.list_backups(key).await?.len();
        let remote = match cloud {
            Some(cloud) => cloud
                .list_backups(key, preferred_parent)
                .await
                .with_context(|| format!("Cloud listing for {key} failed"))?
                .len(),
            None => 0,
        };
        Ok(u32::try_from(local + remote).unwrap_or(u32::MAX))
    }

    pub async fn mark_backup_cloud_only(&self, backup_id: &str, key: &GameKey) -> Result<()> {
        self.local.mark_cloud_only(key, backup_id).await
    }

    pub async fn local_backups(&self, key: &GameKey) -> Result<Vec<BackupRecord>> {
        self.local.list_backups(key).await
    }

    /// Cloud backups of one game. Empty when cloud storage is unavailable.
    pub async fn cloud_backups(&self, key: &GameKey) -> Result<Vec<BackupRecord>> {
        match self.cloud_if_ready().await {
            Some(cloud) => {
                let parent = self.preferred_parent().await;
                cloud.list_backup_records(key, parent.as_deref()).await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Every game with at least one backup, local and cloud merged.
    pub async fn get_all_backups(&self) -> Result<Vec<GameBackups>> {
        let games = self.games.list().await?;
        let cloud = self.cloud_if_ready().await;
        let parent = self.preferred_parent().await;

        let mut out = Vec::new();
        for game in games {
            let key = game.key();
            let mut backups = match self.local.list_backups(&key).await {
                Ok(backups) => backups,
                Err(e) => {
                    log::warn!("[BackupManager] local listing for {} failed: {e:#}", game.title());
                    Vec::new()
                }
            };
            if let Some(cloud) = cloud {
                match cloud.list_backup_records(&key, parent.as_deref()).await {
                    Ok(records) => backups.extend(records),
                    Err(e) => log::warn!("[BackupManager] cloud listing for {} failed: {e:#}", game.title()),
                }
            }

            if backups.is_empty() {
                continue;
            }
            backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            out.push(GameBackups { game, backups });
        }
        Ok(out)
    }

    /// Recount every game's backups and store the counts that changed.
    /// Returns how many games were updated.
    pub async fn sync_backup_counts(&self) -> Result<usize> {
        let games = self.games.list().await?;
        let cloud = match self.counting_cloud().await {
            Ok(cloud) => cloud,
            Err(e) => {
                log::warn!("[BackupManager] cloud storage unreachable, backup counts left unchanged: {e:#}");
                return Ok(0);
            }
        };
        let parent = self.preferred_parent().await;

        let mut updated = 0;
        for game in &games {
            let count = match self.count_backups(&game.key(), cloud, parent.as_deref()).await {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("[BackupManager] could not count backups of {}: {e:#}", game.title());
                    continue;
                }
            };
            if count == game.backup_count {
                continue;
            }
            match self.games.set_backup_count(&game.id, count).await {
                Ok(()) => {
                    log::info!(
                        "[BackupManager] backup count of {} corrected from {} to {}",
                        game.title(),
                        game.backup_count,
                        count
                    );
                    updated += 1;
                }
                Err(e) => log::warn!("[BackupManager] could not store count for {}: {e:#}", game.title()),
            }
        }
        Ok(updated)
    }

    /// Back up every registered game in turn.
    pub async fn create_all_local_backups(&self, on_progress: &ProgressSink) -> Result<BatchReport> {
        let games = self.games.list().await?;
        let total = games.len();
        let mut report = BatchReport::default();

        for (index, game) in games.iter().enumerate() {
            on_progress(BackupProgress::new(
                Some(game.id),
                BackupStatus::Detecting,
                percent(index, total),
                format!("Processing {}/{}: {}", index + 1, total, game.title()),
            ));
            let label = format!("{} - {}", default_label(Utc::now()), game.title());

            match self.backup_game(game, Some(label.as_str()), on_progress).await {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    log::error!("[BackupManager] backup of {} failed: {e:#}", game.title());
                    on_progress(BackupProgress::new(
                        Some(game.id),
                        BackupStatus::Error,
                        percent(index, total),
                        format!("Backup of {} failed: {e}", game.title()),
                    ));
                    report.failed.push((game.id, format!("{e:#}")));
                }
            }
        }

        on_progress(BackupProgress::new(
            None,
            BackupStatus::Complete,
            100,
            format!("Backed up {} of {} games", report.succeeded, total),
        ));
        Ok(report)
    }

    /// Upload an ephemeral backup of every registered game in turn.
    pub async fn create_all_ephemeral_and_upload(
        &self,
        on_progress: &ProgressSink,
        folder_name: Option<&str>,
    ) -> Result<BatchReport> {
        self.require_cloud().await?;
        let games = self.games.list().await?;
        let total = games.len();
        let mut report = BatchReport::default();

        for (index, game) in games.iter().enumerate() {
            let title = game.title();
            let game_id = game.id;
            on_progress(BackupProgress::new(
                Some(game_id),
                BackupStatus::Uploading,
                batch_percent(index, total, 0),
                format!("Processing {}/{}: {}", index + 1, total, title),
            ));

            let label = format!("{} - {}", default_label(Utc::now()), title);
            let per_game = move |inner: u8| {
                on_progress(BackupProgress::new(
                    Some(game_id),
                    BackupStatus::Uploading,
                    batch_percent(index, total, inner),
                    format!("Uploading {}...", title),
                ))
            };

            match self
                .create_ephemeral_and_upload(&game_id, Some(label.as_str()), &per_game, folder_name)
                .await
            {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    log::error!("[BackupManager] cloud backup of {} failed: {e:#}", title);
                    on_progress(BackupProgress::new(
                        Some(game_id),
                        BackupStatus::Error,
                        batch_percent(index, total, 0),
                        format!("Cloud backup of {} failed: {e}", title),
                    ));
                    report.failed.push((game_id, format!("{e:#}")));
                }
            }
        }

        on_progress(BackupProgress::new(
            None,
            BackupStatus::Complete,
            100,
            format!("Uploaded {} of {} games", report.succeeded, total),
        ));
        Ok(report)
    }

    // Default cloud folder

    pub async fn set_default_folder(&self, id: &str, name: &str) -> Result<()> {
        let mut settings = self.settings.write().await;
        let mut updated = settings.clone();
        updated.default_folder = Some(DefaultFolder {
            id: id.to_string(),
            name: name.to_string(),
        });
        updated.save_default_folder(&self.config_store).await?;
        *settings = updated;
        log::info!("[BackupManager] default cloud folder set to {} ({})", name, id);
        Ok(())
    }

    pub async fn default_folder(&self) -> Option<DefaultFolder> {
        self.settings.read().await.default_folder.clone()
    }

    pub async fn clear_default_folder(&self) -> Result<()> {
        let mut settings = self.settings.write().await;
        let mut updated = settings.clone();
        updated.default_folder = None;
        updated.save_default_folder(&self.config_store).await?;
        *settings = updated;
        log::info!("[BackupManager] default cloud folder cleared");
        Ok(())
    }

    /// Folders under `parent`, or under the drive root.
    pub async fn list_cloud_folders(&self, parent: Option<&str>) -> Result<Vec<RemoteFile>> {
        let cloud = self.require_cloud().await?;
        cloud.list_folders(parent.unwrap_or(ROOT_FOLDER_ID)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use save_vault_cloud::memory::MemoryDrive;
    use save_vault_cloud::CloudError;
    use save_vault_core::mock::FakeSaveTool;
    use save_vault_core::{BackupSource, Shop};
    use save_vault_persistence::Database;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        store: ConfigStore,
        tool: Arc<FakeSaveTool>,
        drive: Arc<MemoryDrive>,
        manager: BackupManager,
    }

    async fn fixture_with(cloud_enabled: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        let store = ConfigStore::new(db.clone());

        let mut settings = AppSettings::defaults_in(dir.path());
        settings.cloud_enabled = cloud_enabled;
        let tool = Arc::new(FakeSaveTool::new());
        let drive = Arc::new(MemoryDrive::new());

        let manager = BackupManager::new(
            settings.clone(),
            store.clone(),
            GameRegistry::new(db),
            tool.clone(),
            Some(drive.clone() as Arc<dyn DriveBackend>),
        );
        manager.ensure_backup_directory().unwrap();

        Fixture {
            _dir: dir,
            root: settings.backup_root,
            store,
            tool,
            drive,
            manager,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(true).await
    }

    fn steam_game(name: &str, object_id: &str) -> NewGame {
        NewGame {
            name: name.into(),
            shop: Shop::Steam,
            object_id: object_id.into(),
            ..NewGame::default()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<BackupProgress>>>, impl Fn(BackupProgress) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            move |event: BackupProgress| events.lock().unwrap().push(event)
        };
        (events, sink)
    }

    fn percents() -> (Arc<Mutex<Vec<u8>>>, impl Fn(u8) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |p: u8| seen.lock().unwrap().push(p)
        };
        (seen, sink)
    }

    fn ephemeral_root(tool: &FakeSaveTool) -> PathBuf {
        // Payload sits at <temp>/{folder}/{id}/{folder}.
        tool.backup_targets()
            .last()
            .and_then(|target| target.ancestors().nth(3))
            .map(Path::to_path_buf)
            .unwrap()
    }

    #[test]
    fn test_percent_helpers() {
        assert_eq!(percent(1, 2), 50);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(batch_percent(0, 4, 0), 0);
        assert_eq!(batch_percent(1, 4, 50), 38);
        assert_eq!(batch_percent(3, 4, 100), 100);
    }

    #[tokio::test]
    async fn test_local_backup_updates_counters_and_progress() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (events, sink) = recorder();

        let record = fx
            .manager
            .create_local_backup(&game.id, Some("Before boss"), &sink)
            .await
            .unwrap();
        assert_eq!(record.label, "Before boss");

        let events = events.lock().unwrap().clone();
        let steps: Vec<(BackupStatus, u8)> = events.iter().map(|e| (e.status, e.progress)).collect();
        assert_eq!(
            steps,
            vec![
                (BackupStatus::Detecting, 0),
                (BackupStatus::BackingUp, 30),
                (BackupStatus::Complete, 100)
            ]
        );
        assert!(events.iter().all(|e| e.game_id == Some(game.id)));

        let stored = fx.manager.list_games().await.unwrap().remove(0);
        assert_eq!(stored.backup_count, 1);
        assert!(stored.last_backup_at.is_some());

        let local = fx.manager.local_backups(&game.key()).await.unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].size_bytes, fx.tool.payload_bytes());
    }

    #[tokio::test]
    async fn test_unknown_game_is_reported() {
        let fx = fixture().await;
        let (_, sink) = recorder();

        let err = fx
            .manager
            .create_local_backup(&Uuid::new_v4(), None, &sink)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManagerError>(),
            Some(ManagerError::GameNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_backup_emits_error_and_keeps_count() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        fx.tool.fail_backups(true);
        let (events, sink) = recorder();

        let err = fx.manager.create_local_backup(&game.id, None, &sink).await.unwrap_err();
        assert!(err.downcast_ref::<BackupError>().is_some());
        assert_eq!(events.lock().unwrap().last().unwrap().status, BackupStatus::Error);
        assert_eq!(fx.manager.list_games().await.unwrap()[0].backup_count, 0);
    }

    #[tokio::test]
    async fn test_add_game_rejects_duplicates_and_registers_custom_games() {
        let fx = fixture().await;
        fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();

        for duplicate in [steam_game("Hades", "999"), steam_game("Hades II", "1145360")] {
            let err = fx.manager.add_game(duplicate).await.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ManagerError>(),
                Some(ManagerError::DuplicateGame(_))
            ));
        }

        let custom = fx
            .manager
            .add_game(NewGame {
                name: "Homebrew RPG".into(),
                shop: Shop::Custom,
                custom_save_path: Some("/home/me/rpg/saves".into()),
                ..NewGame::default()
            })
            .await
            .unwrap();
        assert_eq!(custom.object_id, "Homebrew RPG");
        assert_eq!(
            fx.tool.custom_games().get("Homebrew RPG"),
            Some(&PathBuf::from("/home/me/rpg/saves"))
        );

        fx.manager.remove_game(&custom.id).await.unwrap();
        assert!(fx.tool.custom_games().is_empty());
        assert_eq!(fx.manager.list_games().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cloud_round_trip_restores_original_files() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let key = game.key();
        let (_, sink) = recorder();

        let record = fx.manager.create_local_backup(&game.id, None, &sink).await.unwrap();
        let (seen, pct) = percents();
        let remote_id = fx
            .manager
            .upload_existing_backup(record.id.raw_id(), &key, &pct, Some("Saves"))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&100));
        assert_eq!(fx.drive.find_live(ROOT_FOLDER_ID, "Saves").len(), 1);

        fx.manager.delete_backup(&record.id, &key).await.unwrap();
        assert!(fx.manager.local_backups(&key).await.unwrap().is_empty());
        // Local copy gone, cloud copy still counted.
        assert_eq!(fx.manager.list_games().await.unwrap()[0].backup_count, 1);

        let cloud = fx.manager.cloud_backups(&key).await.unwrap();
        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud[0].id, BackupRef::Cloud(remote_id.clone()));

        let (events, sink) = recorder();
        fx.manager
            .restore_backup(&BackupRef::Cloud(remote_id), &key, &sink)
            .await
            .unwrap();

        let restored = fx.tool.restored_snapshots();
        assert_eq!(restored.last(), Some(&fx.tool.expected_snapshot()));
        assert!(!fx.root.join(RESTORE_SCRATCH_DIR).exists());

        let steps: Vec<u8> = events.lock().unwrap().iter().map(|e| e.progress).collect();
        assert_eq!(steps, vec![0, 20, 50, 100]);
    }

    #[tokio::test]
    async fn test_cloud_restore_brings_back_achievements() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let key = game.key();
        let achievements = vec![serde_json::json!({"name": "ESCAPED", "unlockTime": 1700000000})];

        let record = fx
            .manager
            .local_store()
            .create_backup(&key, None, None, &achievements)
            .await
            .unwrap();
        let (_, pct) = percents();
        let remote_id = fx
            .manager
            .upload_existing_backup(record.id.raw_id(), &key, &pct, None)
            .await
            .unwrap();
        fx.manager.delete_backup(&record.id, &key).await.unwrap();

        let (_, sink) = recorder();
        let restored = fx
            .manager
            .restore_backup(&BackupRef::Cloud(remote_id), &key, &sink)
            .await
            .unwrap();

        assert_eq!(restored, achievements);
        assert_eq!(fx.tool.restored_snapshots().last(), Some(&fx.tool.expected_snapshot()));
    }

    #[tokio::test]
    async fn test_delete_keeps_count_while_cloud_is_unreachable() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (_, sink) = recorder();
        let first = fx.manager.create_local_backup(&game.id, None, &sink).await.unwrap();
        fx.manager.create_local_backup(&game.id, None, &sink).await.unwrap();

        fx.drive.set_authenticated(false);
        fx.manager.delete_backup(&first.id, &game.key()).await.unwrap();

        assert_eq!(fx.manager.local_backups(&game.key()).await.unwrap().len(), 1);
        assert_eq!(fx.manager.list_games().await.unwrap()[0].backup_count, 2);
    }

    #[tokio::test]
    async fn test_restore_local_backup() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (_, sink) = recorder();
        let record = fx.manager.create_local_backup(&game.id, None, &sink).await.unwrap();

        let (events, sink) = recorder();
        let achievements = fx
            .manager
            .restore_backup(&record.id, &game.key(), &sink)
            .await
            .unwrap();
        assert!(achievements.is_empty());
        assert_eq!(fx.tool.restored_snapshots().last(), Some(&fx.tool.expected_snapshot()));

        let events = events.lock().unwrap();
        assert_eq!(events.last().unwrap().status, BackupStatus::Complete);
        assert!(events.iter().all(|e| e.game_id == Some(game.id)));
    }

    #[tokio::test]
    async fn test_failed_cloud_restore_removes_scratch() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (events, sink) = recorder();

        let err = fx
            .manager
            .restore_backup(&BackupRef::Cloud("missing".into()), &game.key(), &sink)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloudError>(),
            Some(CloudError::FolderNotFound(_))
        ));
        assert!(!fx.root.join(RESTORE_SCRATCH_DIR).exists());
        assert_eq!(events.lock().unwrap().last().unwrap().status, BackupStatus::Error);
        assert!(fx.tool.restored_sources().is_empty());
    }

    #[tokio::test]
    async fn test_upload_of_missing_backup_fails() {
        let fx = fixture().await;
        let (_, pct) = percents();
        let err = fx
            .manager
            .upload_existing_backup("nope", &GameKey::new(Shop::Steam, "1"), &pct, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::BackupDirectoryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ephemeral_upload_cleans_up_on_success() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (seen, pct) = percents();

        fx.manager
            .create_ephemeral_and_upload(&game.id, None, &pct, None)
            .await
            .unwrap();

        assert!(!ephemeral_root(&fx.tool).exists());
        assert_eq!(seen.lock().unwrap().as_slice(), &[50, 100]);
        assert_eq!(fx.drive.find_live(ROOT_FOLDER_ID, "CloudSaves").len(), 1);
        assert!(fx.manager.local_backups(&game.key()).await.unwrap().is_empty());
        assert_eq!(fx.manager.cloud_backups(&game.key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_upload_cleans_up_on_failure() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (_, pct) = percents();

        fx.drive.set_authenticated(false);
        let err = fx
            .manager
            .create_ephemeral_and_upload(&game.id, None, &pct, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloudError>(),
            Some(CloudError::NotAuthenticated)
        ));
        assert!(!ephemeral_root(&fx.tool).exists());

        fx.drive.set_authenticated(true);
        fx.tool.fail_backups(true);
        assert!(fx
            .manager
            .create_ephemeral_and_upload(&game.id, None, &pct, None)
            .await
            .is_err());
        assert!(!ephemeral_root(&fx.tool).exists());
        assert_eq!(fx.drive.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cloud_disabled() {
        let fx = fixture_with(false).await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (_, pct) = percents();

        let err = fx
            .manager
            .create_ephemeral_and_upload(&game.id, None, &pct, None)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ManagerError>(), Some(ManagerError::CloudDisabled)));
        assert!(fx.manager.cloud_backups(&game.key()).await.unwrap().is_empty());
        assert!(fx.manager.list_cloud_folders(None).await.is_err());
        assert!(fx.tool.backup_targets().is_empty());
    }

    #[tokio::test]
    async fn test_sync_backup_counts_corrects_drift() {
        let fx = fixture().await;
        let hades = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let celeste = fx.manager.add_game(steam_game("Celeste", "504230")).await.unwrap();
        let (_, sink) = recorder();

        fx.manager.create_local_backup(&hades.id, None, &sink).await.unwrap();
        fx.manager.games.set_backup_count(&hades.id, 5).await.unwrap();

        let main = fx.drive.insert_folder(ROOT_FOLDER_ID, "CloudSaves");
        let folder = fx.drive.insert_folder(&main, &celeste.key().folder_name());
        fx.drive.insert_folder(&folder, &Uuid::new_v4().to_string());

        assert_eq!(fx.manager.sync_backup_counts().await.unwrap(), 2);
        let mut counts: Vec<(String, u32)> = fx
            .manager
            .list_games()
            .await
            .unwrap()
            .into_iter()
            .map(|g| (g.name, g.backup_count))
            .collect();
        counts.sort();
        assert_eq!(counts, vec![("Celeste".to_string(), 1), ("Hades".to_string(), 1)]);

        assert_eq!(fx.manager.sync_backup_counts().await.unwrap(), 0);

        // An unreachable cloud leaves the stored counts alone.
        fx.drive.set_authenticated(false);
        assert_eq!(fx.manager.sync_backup_counts().await.unwrap(), 0);
        let celeste = fx.manager.games.get(&celeste.id).await.unwrap().unwrap();
        assert_eq!(celeste.backup_count, 1);
    }

    #[tokio::test]
    async fn test_batch_local_backups_tolerate_failures() {
        let fx = fixture().await;
        let hades = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let broken = fx.manager.add_game(steam_game("Broken", "666")).await.unwrap();
        let celeste = fx.manager.add_game(steam_game("Celeste", "504230")).await.unwrap();
        fx.tool.fail_for("666");
        let (events, sink) = recorder();

        let report = fx.manager.create_all_local_backups(&sink).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, broken.id);
        assert!(!report.is_complete());

        for game in [&hades, &celeste] {
            let backups = fx.manager.local_backups(&game.key()).await.unwrap();
            assert_eq!(backups.len(), 1);
            assert!(backups[0].label.ends_with(&format!(" - {}", game.name)));
        }

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.status == BackupStatus::Error && e.game_id == Some(broken.id)));
        let last = events.last().unwrap();
        assert_eq!((last.status, last.progress, last.game_id), (BackupStatus::Complete, 100, None));
    }

    #[tokio::test]
    async fn test_batch_ephemeral_upload() {
        let fx = fixture().await;
        let hades = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let broken = fx.manager.add_game(steam_game("Broken", "666")).await.unwrap();
        fx.tool.fail_for("666");
        let (events, sink) = recorder();

        let report = fx
            .manager
            .create_all_ephemeral_and_upload(&sink, Some("Batch"))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed[0].0, broken.id);

        assert_eq!(fx.drive.find_live(ROOT_FOLDER_ID, "Batch").len(), 1);
        assert_eq!(fx.manager.cloud_backups(&hades.key()).await.unwrap().len(), 1);
        assert!(fx.manager.cloud_backups(&broken.key()).await.unwrap().is_empty());

        let events = events.lock().unwrap();
        let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(events.last().unwrap().status, BackupStatus::Complete);
    }

    #[tokio::test]
    async fn test_batch_ephemeral_requires_cloud() {
        let fx = fixture_with(false).await;
        fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (events, sink) = recorder();

        assert!(fx.manager.create_all_ephemeral_and_upload(&sink, None).await.is_err());
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_folder_is_persisted_and_used() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let folder_id = fx.drive.insert_folder(ROOT_FOLDER_ID, "My Saves");

        fx.manager.set_default_folder(&folder_id, "My Saves").await.unwrap();
        let reloaded = AppSettings::load(&fx.store, Path::new("/unused")).await.unwrap();
        assert_eq!(reloaded.default_folder, fx.manager.default_folder().await);

        let (_, pct) = percents();
        fx.manager
            .create_ephemeral_and_upload(&game.id, None, &pct, None)
            .await
            .unwrap();
        assert_eq!(fx.drive.find_live(ROOT_FOLDER_ID, "My Saves").len(), 1);
        assert!(fx.drive.find_live(ROOT_FOLDER_ID, "CloudSaves").is_empty());
        assert_eq!(fx.manager.cloud_backups(&game.key()).await.unwrap().len(), 1);

        let folders = fx.manager.list_cloud_folders(None).await.unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, folder_id);

        fx.manager.clear_default_folder().await.unwrap();
        assert!(fx.manager.default_folder().await.is_none());
        let reloaded = AppSettings::load(&fx.store, Path::new("/unused")).await.unwrap();
        assert!(reloaded.default_folder.is_none());
    }

    #[tokio::test]
    async fn test_all_backups_merges_sources_and_skips_empty_games() {
        let fx = fixture().await;
        let hades = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        fx.manager.add_game(steam_game("Celeste", "504230")).await.unwrap();
        let (_, sink) = recorder();
        let (_, pct) = percents();

        fx.manager.create_local_backup(&hades.id, None, &sink).await.unwrap();
        fx.manager
            .create_ephemeral_and_upload(&hades.id, None, &pct, None)
            .await
            .unwrap();

        let all = fx.manager.get_all_backups().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].game.id, hades.id);
        let sources: Vec<BackupSource> = all[0].backups.iter().map(|b| b.source()).collect();
        // Drive timestamps come from a 2024 clock, so local sorts first.
        assert_eq!(sources, vec![BackupSource::Local, BackupSource::Cloud]);

        fx.drive.set_authenticated(false);
        let all = fx.manager.get_all_backups().await.unwrap();
        assert_eq!(all[0].backups.len(), 1);
        assert!(!all[0].backups[0].is_cloud());
    }

    #[tokio::test]
    async fn test_cloud_only_backups_leave_local_listing() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();
        let (_, sink) = recorder();
        let record = fx.manager.create_local_backup(&game.id, None, &sink).await.unwrap();

        fx.manager
            .mark_backup_cloud_only(record.id.raw_id(), &game.key())
            .await
            .unwrap();
        assert!(fx.manager.local_backups(&game.key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preview_and_installed_games() {
        let fx = fixture().await;
        let game = fx.manager.add_game(steam_game("Hades", "1145360")).await.unwrap();

        let report = fx.manager.preview(&game.id).await.unwrap();
        assert!(report.games.contains_key("1145360"));

        let progress = |_: u8| {};
        let scan = fx.manager.scan_all(&progress, &ScanCancel::new()).await.unwrap();
        assert_eq!(scan.overall.total_games, 1);
    }
}
