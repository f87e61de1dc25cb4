use crate::error::BackupError;
use crate::identity::GameKey;
use crate::ludusavi::SaveTool;
use crate::models::{
    default_label, resolve_label, Achievement, BackupRecord, LocalBackupMetadata, ACHIEVEMENTS_FILE,
    CLOUD_ONLY_MARKER, LOCAL_HOSTNAME, METADATA_FILE,
};
use crate::walk;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Directory under the backup root holding every game folder.
pub const CLOUD_SAVES_DIR: &str = "CloudSaves";
pub const EPHEMERAL_PREFIX: &str = "cloud-save-ephemeral-";

/// Produces one place a backup payload might live.
type Candidate = fn(&Path, &GameKey, &str) -> PathBuf;

fn alt_canonical(alt: &Path, key: &GameKey, _id: &str) -> PathBuf {
    alt.join(key.folder_name())
}

fn alt_legacy(alt: &Path, key: &GameKey, _id: &str) -> PathBuf {
    alt.join(key.legacy_folder_name())
}

fn alt_id_canonical(alt: &Path, key: &GameKey, id: &str) -> PathBuf {
    alt.join(id).join(key.folder_name())
}

fn alt_id_legacy(alt: &Path, key: &GameKey, id: &str) -> PathBuf {
    alt.join(id).join(key.legacy_folder_name())
}

fn mirrored_canonical(root: &Path, key: &GameKey, id: &str) -> PathBuf {
    root.join(CLOUD_SAVES_DIR)
        .join(key.folder_name())
        .join(id)
        .join(key.folder_name())
}

fn mirrored_legacy_leaf(root: &Path, key: &GameKey, id: &str) -> PathBuf {
    root.join(CLOUD_SAVES_DIR)
        .join(key.folder_name())
        .join(id)
        .join(key.legacy_folder_name())
}

fn mirrored_without_id(root: &Path, key: &GameKey, _id: &str) -> PathBuf {
    root.join(CLOUD_SAVES_DIR)
        .join(key.folder_name())
        .join(key.folder_name())
}

fn legacy_game_folder(root: &Path, key: &GameKey, id: &str) -> PathBuf {
    root.join(CLOUD_SAVES_DIR)
        .join(key.legacy_folder_name())
        .join(id)
        .join(key.legacy_folder_name())
}

/// Search order inside a downloaded cloud backup.
const ALTERNATE_ROOT_CANDIDATES: &[Candidate] = &[
    alt_canonical,
    alt_legacy,
    alt_id_canonical,
    alt_id_legacy,
    mirrored_canonical,
    mirrored_legacy_leaf,
    mirrored_without_id,
];

/// Search order for a backup made on this machine.
const LOCAL_CANDIDATES: &[Candidate] = &[mirrored_canonical, legacy_game_folder, mirrored_legacy_leaf];

/// Every candidate path in order, with duplicates removed.
pub fn candidate_paths(candidates: &[Candidate], root: &Path, key: &GameKey, id: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .map(|candidate| candidate(root, key, id))
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// First candidate that exists on disk.
pub fn resolve_payload(paths: &[PathBuf]) -> Result<PathBuf> {
    for path in paths {
        log::debug!("[LocalStore] checking {}", path.display());
        if path.is_dir() {
            return Ok(path.clone());
        }
    }
    let last = paths.last().cloned().unwrap_or_default();
    Err(BackupError::BackupDirectoryNotFound(last).into())
}

fn check_backup_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(BackupError::InvalidBackupId(id.to_string()).into());
    }
    Ok(())
}

/// A backup materialized in a private temp directory for upload.
/// Dropping it removes the directory.
#[derive(Debug)]
pub struct EphemeralBackup {
    pub id: String,
    /// `<temp>/{folder}/{id}`, laid out like a backup under the root.
    pub backup_dir: PathBuf,
    /// Directory holding the save files, `{backup_dir}/{folder}`.
    pub payload_path: PathBuf,
    temp_dir: TempDir,
}

impl EphemeralBackup {
    pub fn temp_root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn cleanup(self) -> Result<()> {
        let root = self.temp_dir.path().to_path_buf();
        self.temp_dir
            .close()
            .with_context(|| format!("Failed to remove {}", root.display()))
    }
}

/// Backups on disk under `root/CloudSaves/{shop}-{id}/{backupId}/`.
#[derive(Clone)]
pub struct LocalBackupStore {
    root: PathBuf,
    tool: Arc<dyn SaveTool>,
}

impl LocalBackupStore {
    pub fn new(root: impl Into<PathBuf>, tool: Arc<dyn SaveTool>) -> Self {
        Self {
            root: root.into(),
            tool,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tool(&self) -> &Arc<dyn SaveTool> {
        &self.tool
    }

    pub fn game_dir(&self, key: &GameKey) -> PathBuf {
        self.root.join(CLOUD_SAVES_DIR).join(key.folder_name())
    }

    pub fn backup_dir(&self, key: &GameKey, backup_id: &str) -> PathBuf {
        self.game_dir(key).join(backup_id)
    }

    pub fn payload_dir(&self, key: &GameKey, backup_id: &str) -> PathBuf {
        self.backup_dir(key, backup_id).join(key.folder_name())
    }

    /// Create the backup root and its fixed subdirectories.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join(CLOUD_SAVES_DIR),
            self.root.join("config"),
        ] {
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Run the tool into `{backup_dir}/{folder}` after clearing leftovers.
    async fn bundle(&self, key: &GameKey, backup_dir: &Path, wine_prefix: Option<&str>) -> Result<PathBuf> {
        let payload = backup_dir.join(key.folder_name());
        if payload.exists() {
            tokio::fs::remove_dir_all(&payload)
                .await
                .with_context(|| format!("Failed to remove stale backup at {}", payload.display()))?;
        }
        self.tool.backup(key, &payload, wine_prefix).await?;
        Ok(payload)
    }

    pub async fn create_backup(
        &self,
        key: &GameKey,
        label: Option<&str>,
        wine_prefix: Option<&str>,
        achievements: &[Achievement],
    ) -> Result<BackupRecord> {
        let id = Uuid::new_v4().to_string();
        let backup_dir = self.backup_dir(key, &id);
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .with_context(|| format!("Failed to create {}", backup_dir.display()))?;

        let result = self
            .fill_backup(key, &id, &backup_dir, label, wine_prefix, achievements)
            .await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_dir_all(&backup_dir).await {
                log::warn!("[LocalStore] could not remove failed backup {}: {}", backup_dir.display(), e);
            }
        }
        result
    }

    /// Payload, sidecars and metadata of a new backup. Any error leaves
    /// `backup_dir` for the caller to remove.
    async fn fill_backup(
        &self,
        key: &GameKey,
        id: &str,
        backup_dir: &Path,
        label: Option<&str>,
        wine_prefix: Option<&str>,
        achievements: &[Achievement],
    ) -> Result<BackupRecord> {
        let payload = self.bundle(key, backup_dir, wine_prefix).await?;

        if !achievements.is_empty() {
            let raw = serde_json::to_vec(achievements)?;
            tokio::fs::write(backup_dir.join(ACHIEVEMENTS_FILE), raw).await?;
        }

        let size = walk::dir_size_blocking(&payload).await?;
        let created_at = Utc::now();
        let metadata = LocalBackupMetadata {
            id: id.to_string(),
            label: Some(resolve_label(label, created_at)),
            created_at,
            download_option_title: None,
            artifact_length_in_bytes: size,
            hostname: LOCAL_HOSTNAME.to_string(),
        };
        write_metadata(backup_dir, &metadata).await?;

        log::info!("[LocalStore] created backup {} for {} ({} bytes)", id, key, size);
        Ok(metadata.into_record())
    }

    /// Same as [`create_backup`](Self::create_backup) but outside the backup
    /// root. The result is never listed; the caller owns its cleanup.
    pub async fn create_ephemeral_backup(&self, key: &GameKey) -> Result<EphemeralBackup> {
        let temp_dir = tempfile::Builder::new()
            .prefix(EPHEMERAL_PREFIX)
            .tempdir()
            .context("Failed to create ephemeral backup directory")?;

        let id = Uuid::new_v4().to_string();
        let backup_dir = temp_dir.path().join(key.folder_name()).join(&id);
        tokio::fs::create_dir_all(&backup_dir).await?;

        let payload_path = self.bundle(key, &backup_dir, None).await?;
        log::info!("[LocalStore] ephemeral backup {} for {} at {}", id, key, payload_path.display());

        Ok(EphemeralBackup {
            id,
            backup_dir,
            payload_path,
            temp_dir,
        })
    }

    /// Locate the payload, hand it to the tool and return any stored
    /// achievements. `alternate_root` points at a downloaded cloud backup.
    pub async fn restore_backup(
        &self,
        key: &GameKey,
        backup_id: &str,
        wine_prefix: Option<&str>,
        alternate_root: Option<&Path>,
    ) -> Result<Vec<Achievement>> {
        check_backup_id(backup_id)?;

        let paths = match alternate_root {
            Some(alt) => candidate_paths(ALTERNATE_ROOT_CANDIDATES, alt, key, backup_id),
            None => candidate_paths(LOCAL_CANDIDATES, &self.root, key, backup_id),
        };
        let payload = resolve_payload(&paths)?;
        log::info!("[LocalStore] restoring {} for {} from {}", backup_id, key, payload.display());

        self.tool.restore(key, &payload, wine_prefix).await?;

        let achievements_path = payload
            .parent()
            .map(|dir| dir.join(ACHIEVEMENTS_FILE))
            .filter(|path| path.is_file());
        match achievements_path {
            Some(path) => {
                let raw = tokio::fs::read(&path).await?;
                Ok(serde_json::from_slice(&raw)
                    .with_context(|| format!("Failed to parse {}", path.display()))?)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Remove a backup directory. Missing backups are not an error.
    pub async fn delete_backup(&self, key: &GameKey, backup_id: &str) -> Result<()> {
        check_backup_id(backup_id)?;

        for folder in key.candidate_folder_names() {
            let dir = self.root.join(CLOUD_SAVES_DIR).join(folder).join(backup_id);
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .with_context(|| format!("Failed to delete {}", dir.display()))?;
                log::info!("[LocalStore] deleted {}", dir.display());
            }
        }
        Ok(())
    }

    /// Backups of one game, newest first. Searches the canonical and the
    /// legacy game folder and repairs missing metadata on the way.
    pub async fn list_backups(&self, key: &GameKey) -> Result<Vec<BackupRecord>> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for folder in key.candidate_folder_names() {
            let game_dir = self.root.join(CLOUD_SAVES_DIR).join(&folder);
            if !game_dir.is_dir() {
                continue;
            }

            let mut dirs = Vec::new();
            let mut read_dir = tokio::fs::read_dir(&game_dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    dirs.push(entry);
                }
            }
            dirs.sort_by_key(|entry| entry.file_name());

            for entry in dirs {
                let backup_id = entry.file_name().to_string_lossy().into_owned();
                if !seen.insert(backup_id.clone()) {
                    continue;
                }
                let backup_dir = entry.path();
                if backup_dir.join(CLOUD_ONLY_MARKER).exists() {
                    log::debug!("[LocalStore] skipping cloud-only backup {}", backup_id);
                    continue;
                }

                match read_or_heal_metadata(&backup_dir, &backup_id, &folder).await {
                    Ok(Some(metadata)) => records.push(metadata.into_record()),
                    Ok(None) => log::debug!("[LocalStore] {} has no payload, skipping", backup_dir.display()),
                    Err(e) => log::warn!("[LocalStore] unreadable backup {}: {e:#}", backup_dir.display()),
                }
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Flag a backup as stored only in the cloud.
    pub async fn mark_cloud_only(&self, key: &GameKey, backup_id: &str) -> Result<()> {
        check_backup_id(backup_id)?;
        let dir = self.backup_dir(key, backup_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(CLOUD_ONLY_MARKER), "This backup exists only in the cloud").await?;
        Ok(())
    }
}

async fn write_metadata(backup_dir: &Path, metadata: &LocalBackupMetadata) -> Result<()> {
    let path = backup_dir.join(METADATA_FILE);
    let raw = serde_json::to_string_pretty(metadata)?;
    tokio::fs::write(&path, raw)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Read `metadata.json`, or rebuild and persist it from the payload
/// directory when it is missing.
async fn read_or_heal_metadata(
    backup_dir: &Path,
    backup_id: &str,
    folder: &str,
) -> Result<Option<LocalBackupMetadata>> {
    let path = backup_dir.join(METADATA_FILE);
    if path.is_file() {
        let raw = tokio::fs::read(&path).await?;
        let metadata: LocalBackupMetadata = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        return Ok(Some(metadata));
    }

    let payload = backup_dir.join(folder);
    if !payload.is_dir() {
        return Ok(None);
    }

    let fs_meta = tokio::fs::metadata(&payload).await?;
    let created_at: DateTime<Utc> = fs_meta
        .created()
        .or_else(|_| fs_meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    let metadata = LocalBackupMetadata {
        id: backup_id.to_string(),
        label: Some(default_label(created_at)),
        created_at,
        download_option_title: None,
        artifact_length_in_bytes: walk::dir_size_blocking(&payload).await?,
        hostname: LOCAL_HOSTNAME.to_string(),
    };
    write_metadata(backup_dir, &metadata).await?;
    log::info!("[LocalStore] rebuilt missing metadata for {}", backup_dir.display());
    Ok(Some(metadata))
}
