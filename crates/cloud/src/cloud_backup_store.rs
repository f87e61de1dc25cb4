use crate::{CloudError, DriveBackend, FileQuery, OrderBy, RemoteFile, ROOT_FOLDER_ID};
use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use save_vault_core::models::{default_label, CLOUD_ONLY_MARKER};
use save_vault_core::walk::{self, EntryKind};
use save_vault_core::{BackupError, BackupRecord, BackupRef, GameKey, CLOUD_SAVES_DIR};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Main folder used when the caller names none.
pub const DEFAULT_MAIN_FOLDER: &str = "CloudSaves";

/// Page size for listings that must be read to the end.
pub const PAGE_SIZE: u32 = 1000;

/// Called with `(files_uploaded, total_files)` after each file.
pub type UploadProgress<'a> = dyn Fn(usize, usize) + Send + Sync + 'a;

/// Convert a remote backup folder into a record.
///
/// Folders named with a bare UUID get a generated label. Size is not
/// enumerated remotely and is always 0.
pub fn to_backup_record(folder: &RemoteFile) -> BackupRecord {
    let created_at = folder
        .created_time
        .or(folder.modified_time)
        .unwrap_or_else(Utc::now);
    let label = if Uuid::parse_str(&folder.name).is_ok() {
        default_label(created_at)
    } else {
        folder.name.clone()
    };
    BackupRecord {
        id: BackupRef::Cloud(folder.id.clone()),
        label,
        created_at,
        size_bytes: 0,
        source_hostname: None,
        download_option_title: None,
    }
}

/// Backups stored as `MainFolder/{shop}-{id}/{backupId}/...` on a drive,
/// each backup folder mirroring the local `{backupId}` directory.
#[derive(Clone)]
pub struct CloudBackupStore {
    backend: Arc<dyn DriveBackend>,
    /// Folder ids by `(parent, name)`, filled by [`Self::ensure_folder`].
    folders: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl CloudBackupStore {
    pub fn new(backend: Arc<dyn DriveBackend>) -> Self {
        Self {
            backend,
            folders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DriveBackend> {
        &self.backend
    }

    pub async fn is_authenticated(&self) -> bool {
        match self.backend.about().await {
            Ok(user) => {
                log::debug!("[CloudStore] signed in as {}", user);
                true
            }
            Err(e) => {
                log::debug!("[CloudStore] auth probe failed: {}", e);
                false
            }
        }
    }

    /// Id of the folder `name` under `parent`, created if missing.
    /// Answers are remembered for the lifetime of the store.
    pub async fn ensure_folder(&self, parent: &str, name: &str) -> Result<String> {
        let cache_key = (parent.to_string(), name.to_string());
        if let Some(id) = self.folders.lock().await.get(&cache_key) {
            return Ok(id.clone());
        }

        let query = FileQuery::children(parent)
            .name(name)
            .folders()
            .order(OrderBy::CreatedDesc);
        let id = match self.first_match(query).await? {
            Some(existing) => existing.id,
            None => {
                let created = self.backend.create_folder(parent, name).await?;
                log::debug!("[CloudStore] created folder {} ({})", name, created.id);
                created.id
            }
        };
        self.folders.lock().await.insert(cache_key, id.clone());
        Ok(id)
    }

    /// Drop remembered ids of `folder_id` and everything cached below it.
    async fn forget_folder(&self, folder_id: &str) {
        let mut folders = self.folders.lock().await;
        let mut gone = vec![folder_id.to_string()];
        while let Some(id) = gone.pop() {
            folders.retain(|(parent, _), child| {
                if *child == id {
                    return false;
                }
                if *parent == id {
                    gone.push(child.clone());
                    return false;
                }
                true
            });
        }
    }

    /// Mirror a local `{backupId}` directory (payload folder plus metadata
    /// and achievements) into `main/{folder}/{backup_id}` and return the
    /// backup folder id. The cloud-only marker stays local.
    pub async fn upload_backup(
        &self,
        key: &GameKey,
        backup_dir: &Path,
        backup_id: &str,
        main_folder: Option<&str>,
        on_progress: &UploadProgress<'_>,
    ) -> Result<String> {
        let is_dir = tokio::fs::metadata(backup_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(BackupError::BackupDirectoryNotFound(backup_dir.to_path_buf()).into());
        }

        let main_name = main_folder.unwrap_or(DEFAULT_MAIN_FOLDER);
        let main_id = self.ensure_folder(ROOT_FOLDER_ID, main_name).await?;
        let game_id = self.ensure_folder(&main_id, &key.folder_name()).await?;
        let backup_folder = self.ensure_folder(&game_id, backup_id).await?;

        let mut entries = walk::entries_blocking(backup_dir).await?;
        entries.retain(|entry| entry.relative != Path::new(CLOUD_ONLY_MARKER));
        let total = entries.iter().filter(|e| e.kind == EntryKind::File).count();
        log::info!(
            "[CloudStore] uploading {} files for {} into {}/{}",
            total,
            key,
            main_name,
            backup_id
        );

        let mut folder_ids: HashMap<PathBuf, String> = HashMap::new();
        folder_ids.insert(PathBuf::new(), backup_folder.clone());
        let mut uploaded = 0usize;

        for entry in &entries {
            let parent_rel = entry.relative.parent().unwrap_or(Path::new(""));
            let parent_id = folder_ids
                .get(parent_rel)
                .cloned()
                .ok_or_else(|| anyhow!("No remote folder for {}", parent_rel.display()))?;
            let name = entry
                .relative
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            match entry.kind {
                EntryKind::Dir => {
                    let id = self.ensure_folder(&parent_id, &name).await?;
                    folder_ids.insert(entry.relative.clone(), id);
                }
                EntryKind::File => {
                    self.backend.upload_file(&parent_id, &name, &entry.path).await?;
                    uploaded += 1;
                    on_progress(uploaded, total);
                }
            }
        }

        Ok(backup_folder)
    }

    /// Download a backup into `dest_root/CloudSaves/{folder}/{id}/`, the
    /// layout a local restore with an alternate root looks for, and return
    /// the payload directory inside it. Backups uploaded as a bare payload
    /// are placed one level down so they end up in the same shape.
    pub async fn download_backup(&self, key: &GameKey, remote_backup_id: &str, dest_root: &Path) -> Result<PathBuf> {
        let source = self.resolve_backup_folder(remote_backup_id).await?;
        let backup_dir = dest_root
            .join(CLOUD_SAVES_DIR)
            .join(key.folder_name())
            .join(remote_backup_id);

        let children = self
            .list_all(FileQuery::children(&source.id).folders().page_size(PAGE_SIZE))
            .await?;
        let nested = key
            .candidate_folder_names()
            .into_iter()
            .find(|name| children.iter().any(|child| &child.name == name));

        let (target, leaf) = match nested {
            Some(name) => (backup_dir.clone(), backup_dir.join(name)),
            None => {
                log::debug!("[CloudStore] {} holds a bare payload", remote_backup_id);
                let leaf = backup_dir.join(key.folder_name());
                (leaf.clone(), leaf)
            }
        };
        tokio::fs::create_dir_all(&leaf).await?;

        let count = self.download_tree(&source.id, &target).await?;
        log::info!("[CloudStore] downloaded {} files for {} to {}", count, key, target.display());
        Ok(leaf)
    }

    /// Remove every file, then every subfolder bottom-up, then the folder.
    pub async fn delete_backup(&self, key: &GameKey, remote_backup_id: &str) -> Result<()> {
        let folder = self.resolve_backup_folder(remote_backup_id).await?;
        self.purge(&folder.id).await?;
        self.delete_or_trash(&folder).await?;
        self.forget_folder(&folder.id).await;
        log::info!("[CloudStore] deleted backup {} of {}", remote_backup_id, key);
        Ok(())
    }

    /// Backup folders of a game, newest first. A game without a folder has
    /// no backups.
    pub async fn list_backups(&self, key: &GameKey, preferred_parent: Option<&str>) -> Result<Vec<RemoteFile>> {
        let Some(game_folder) = self.find_game_folder(key, preferred_parent).await? else {
            log::debug!("[CloudStore] no folder for {}", key);
            return Ok(Vec::new());
        };
        let query = FileQuery::children(&game_folder.id)
            .folders()
            .order(OrderBy::CreatedDesc)
            .page_size(PAGE_SIZE);
        self.list_all(query).await
    }

    pub async fn list_backup_records(&self, key: &GameKey, preferred_parent: Option<&str>) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .list_backups(key, preferred_parent)
            .await?
            .iter()
            .map(to_backup_record)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    pub async fn list_folders(&self, parent: &str) -> Result<Vec<RemoteFile>> {
        let query = FileQuery::children(parent)
            .folders()
            .order(OrderBy::Name)
            .page_size(PAGE_SIZE);
        self.list_all(query).await
    }

    pub async fn list_root_folders(&self) -> Result<Vec<RemoteFile>> {
        self.list_folders(ROOT_FOLDER_ID).await
    }

    /// Preferred parent first, then anywhere by canonical name, then
    /// anywhere by the pre-normalization name. Newest match wins.
    async fn find_game_folder(&self, key: &GameKey, preferred_parent: Option<&str>) -> Result<Option<RemoteFile>> {
        let canonical = key.folder_name();

        if let Some(parent) = preferred_parent {
            let query = FileQuery::children(parent).name(&canonical).folders();
            if let Some(found) = self.first_match(query.order(OrderBy::CreatedDesc)).await? {
                return Ok(Some(found));
            }
        }

        for name in key.candidate_folder_names() {
            let query = FileQuery::named(&name).folders().order(OrderBy::CreatedDesc);
            if let Some(found) = self.first_match(query).await? {
                if name != canonical {
                    log::debug!("[CloudStore] found legacy folder {} for {}", name, key);
                }
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// By id when it names a live folder, otherwise by folder name.
    async fn resolve_backup_folder(&self, remote_backup_id: &str) -> Result<RemoteFile> {
        if let Some(file) = self.backend.get(remote_backup_id).await? {
            if file.is_folder() && !file.trashed {
                return Ok(file);
            }
        }
        let query = FileQuery::named(remote_backup_id)
            .folders()
            .order(OrderBy::CreatedDesc);
        self.first_match(query)
            .await?
            .ok_or_else(|| CloudError::FolderNotFound(remote_backup_id.to_string()).into())
    }

    async fn first_match(&self, query: FileQuery) -> Result<Option<RemoteFile>> {
        let page = self.backend.list(&query.page_size(1), None).await?;
        Ok(page.files.into_iter().next())
    }

    async fn list_all(&self, query: FileQuery) -> Result<Vec<RemoteFile>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.backend.list(&query, token.as_deref()).await?;
            out.extend(page.files);
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(out)
    }

    async fn delete_or_trash(&self, file: &RemoteFile) -> Result<()> {
        if let Err(e) = self.backend.delete(&file.id).await {
            log::warn!("[CloudStore] delete of {} rejected, trashing instead: {}", file.name, e);
            self.backend.trash(&file.id).await?;
        }
        Ok(())
    }

    fn purge<'a>(&'a self, folder_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            // Listings are taken in full before deleting so page tokens stay valid.
            let files = self
                .list_all(FileQuery::children(folder_id).files().page_size(PAGE_SIZE))
                .await?;
            for file in &files {
                self.delete_or_trash(file).await?;
            }

            let folders = self
                .list_all(FileQuery::children(folder_id).folders().page_size(PAGE_SIZE))
                .await?;
            for folder in &folders {
                self.purge(&folder.id).await?;
                self.delete_or_trash(folder).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn download_tree<'a>(&'a self, folder_id: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<usize>> {
        async move {
            tokio::fs::create_dir_all(dest).await?;
            let children = self
                .list_all(FileQuery::children(folder_id).page_size(PAGE_SIZE))
                .await?;

            let mut count = 0;
            for child in &children {
                if !is_plain_name(&child.name) {
                    log::warn!("[CloudStore] skipping entry with unusable name {:?}", child.name);
                    continue;
                }
                let target = dest.join(&child.name);
                if child.is_folder() {
                    count += self.download_tree(&child.id, &target).await?;
                } else {
                    self.backend.download_file(&child.id, &target).await?;
                    count += 1;
                }
            }
            Ok(count)
        }
        .boxed()
    }
}

/// A single normal path component, so remote names cannot escape `dest`.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDrive;
    use save_vault_core::Shop;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn store_with(drive: &Arc<MemoryDrive>) -> CloudBackupStore {
        CloudBackupStore::new(drive.clone())
    }

    /// A local `{backupId}` directory: payload folder plus metadata.
    fn write_backup(root: &Path, key: &GameKey) {
        let payload = root.join(key.folder_name());
        std::fs::create_dir_all(payload.join("profile")).unwrap();
        std::fs::write(payload.join("slot1.sav"), b"one").unwrap();
        std::fs::write(payload.join("slot2.sav"), b"two").unwrap();
        std::fs::write(payload.join("profile/options.ini"), b"volume=7").unwrap();
        std::fs::write(root.join("metadata.json"), b"{}").unwrap();
    }

    fn no_progress() -> Box<UploadProgress<'static>> {
        Box::new(|_, _| {})
    }

    #[tokio::test]
    async fn test_ensure_folder_is_idempotent() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);

        let first = store.ensure_folder(ROOT_FOLDER_ID, "CloudSaves").await.unwrap();
        let second = store.ensure_folder(ROOT_FOLDER_ID, "CloudSaves").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(drive.find_live(ROOT_FOLDER_ID, "CloudSaves").len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_folder_remembers_ids() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);

        let first = store.ensure_folder(ROOT_FOLDER_ID, "CloudSaves").await.unwrap();
        // A newer duplicate would win a fresh lookup.
        drive.insert_folder(ROOT_FOLDER_ID, "CloudSaves");
        assert_eq!(store.ensure_folder(ROOT_FOLDER_ID, "CloudSaves").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_reupload_after_delete_recreates_backup_folder() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let source = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Steam, "7");
        write_backup(source.path(), &key);

        let first = store
            .upload_backup(&key, source.path(), "b-1", None, no_progress().as_ref())
            .await
            .unwrap();
        store.delete_backup(&key, &first).await.unwrap();
        let second = store
            .upload_backup(&key, source.path(), "b-1", None, no_progress().as_ref())
            .await
            .unwrap();

        assert_ne!(first, second);
        let listed = store.list_backups(&key, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second);
    }

    #[tokio::test]
    async fn test_upload_mirrors_tree_and_reports_progress() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let dir = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Steam, "1145360");
        write_backup(dir.path(), &key);
        std::fs::write(dir.path().join(".cloud-only"), b"marker").unwrap();

        let calls: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let progress: Box<UploadProgress> =
            Box::new(move |done: usize, total: usize| sink.lock().unwrap().push((done, total)));

        let backup_folder = store
            .upload_backup(&key, dir.path(), "b-1", None, progress.as_ref())
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);

        let main = drive.find_live(ROOT_FOLDER_ID, DEFAULT_MAIN_FOLDER);
        assert_eq!(main.len(), 1);
        let game = drive.find_live(&main[0].id, "steam-1145360");
        assert_eq!(game.len(), 1);
        let backup = drive.find_live(&game[0].id, "b-1");
        assert_eq!(backup[0].id, backup_folder);

        assert_eq!(drive.find_live(&backup_folder, "metadata.json").len(), 1);
        assert!(drive.find_live(&backup_folder, ".cloud-only").is_empty());
        let payload = drive.find_live(&backup_folder, "steam-1145360");
        assert_eq!(payload.len(), 1);
        let profile = drive.find_live(&payload[0].id, "profile");
        assert_eq!(profile.len(), 1);
        let options = drive.find_live(&profile[0].id, "options.ini");
        assert_eq!(drive.content(&options[0].id).unwrap(), b"volume=7");
    }

    #[tokio::test]
    async fn test_upload_into_named_main_folder_reuses_chain() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let dir = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Gog, "Hades");
        write_backup(dir.path(), &key);

        store
            .upload_backup(&key, dir.path(), "b-1", Some("Saves"), no_progress().as_ref())
            .await
            .unwrap();
        store
            .upload_backup(&key, dir.path(), "b-2", Some("Saves"), no_progress().as_ref())
            .await
            .unwrap();

        let main = drive.find_live(ROOT_FOLDER_ID, "Saves");
        assert_eq!(main.len(), 1);
        assert_eq!(drive.find_live(&main[0].id, "gog-Hades").len(), 1);
        assert!(drive.find_live(ROOT_FOLDER_ID, DEFAULT_MAIN_FOLDER).is_empty());
    }

    #[tokio::test]
    async fn test_upload_missing_payload_fails() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let dir = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Steam, "1");

        let err = store
            .upload_backup(&key, &dir.path().join("nope"), "b", None, no_progress().as_ref())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::BackupDirectoryNotFound(_))
        ));
        assert_eq!(drive.live_count(), 0);
    }

    #[tokio::test]
    async fn test_download_recreates_restore_layout() {
        let drive = Arc::new(MemoryDrive::new().with_page_cap(2));
        let store = store_with(&drive);
        let source = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Custom, "My Game");
        write_backup(source.path(), &key);

        let remote_id = store
            .upload_backup(&key, source.path(), "b-1", None, no_progress().as_ref())
            .await
            .unwrap();

        let dest = TempDir::new().unwrap();
        let leaf = store.download_backup(&key, &remote_id, dest.path()).await.unwrap();

        let expected = dest
            .path()
            .join("CloudSaves/custom-My_Game")
            .join(&remote_id)
            .join("custom-My_Game");
        assert_eq!(leaf, expected);
        assert_eq!(std::fs::read(leaf.join("slot1.sav")).unwrap(), b"one");
        assert_eq!(std::fs::read(leaf.join("slot2.sav")).unwrap(), b"two");
        assert_eq!(std::fs::read(leaf.join("profile/options.ini")).unwrap(), b"volume=7");
        assert!(leaf.parent().unwrap().join("metadata.json").is_file());
        assert!(!leaf.join("metadata.json").exists());
    }

    #[tokio::test]
    async fn test_download_places_bare_payload_under_game_folder() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let key = GameKey::new(Shop::Steam, "42");

        let main = drive.insert_folder(ROOT_FOLDER_ID, DEFAULT_MAIN_FOLDER);
        let game = drive.insert_folder(&main, "steam-42");
        let backup = drive.insert_folder(&game, "old-style");
        drive.insert_file(&backup, "slot1.sav", b"one");

        let dest = TempDir::new().unwrap();
        let leaf = store.download_backup(&key, &backup, dest.path()).await.unwrap();

        assert_eq!(leaf, dest.path().join("CloudSaves/steam-42").join(&backup).join("steam-42"));
        assert_eq!(std::fs::read(leaf.join("slot1.sav")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_download_resolves_folder_by_name() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let source = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Steam, "42");
        write_backup(source.path(), &key);

        store
            .upload_backup(&key, source.path(), "named-backup", None, no_progress().as_ref())
            .await
            .unwrap();

        let dest = TempDir::new().unwrap();
        let leaf = store.download_backup(&key, "named-backup", dest.path()).await.unwrap();
        assert!(leaf.join("slot1.sav").is_file());

        let err = store.download_backup(&key, "missing", dest.path()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloudError>(),
            Some(CloudError::FolderNotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn test_delete_purges_bottom_up() {
        let drive = Arc::new(MemoryDrive::new().with_page_cap(1));
        let store = store_with(&drive);
        let source = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Steam, "7");
        write_backup(source.path(), &key);

        let remote_id = store
            .upload_backup(&key, source.path(), "b-1", None, no_progress().as_ref())
            .await
            .unwrap();
        // main + game folders survive
        let before = drive.live_count();
        store.delete_backup(&key, &remote_id).await.unwrap();

        assert_eq!(before, 2 + 1 + 2 + 4);
        assert_eq!(drive.live_count(), 2);
        assert!(store.list_backups(&key, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_falls_back_to_trash() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let source = TempDir::new().unwrap();
        let key = GameKey::new(Shop::Steam, "7");
        write_backup(source.path(), &key);

        let remote_id = store
            .upload_backup(&key, source.path(), "b-1", None, no_progress().as_ref())
            .await
            .unwrap();
        drive.reject_hard_delete(true);
        store.delete_backup(&key, &remote_id).await.unwrap();

        assert_eq!(drive.trashed_count(), 7);
        assert!(store.list_backups(&key, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_prefers_default_parent() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let key = GameKey::new(Shop::Steam, "100");

        let chosen = drive.insert_folder(ROOT_FOLDER_ID, "Chosen");
        let in_chosen = drive.insert_folder(&chosen, "steam-100");
        drive.insert_folder(&in_chosen, "from-chosen");
        // Newer folder elsewhere loses against the preferred parent.
        let other = drive.insert_folder(ROOT_FOLDER_ID, "Other");
        let elsewhere = drive.insert_folder(&other, "steam-100");
        drive.insert_folder(&elsewhere, "from-elsewhere");

        let names: Vec<String> = store
            .list_backups(&key, Some(&chosen))
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["from-chosen"]);

        // Without a preference the newest global match wins.
        let names: Vec<String> = store
            .list_backups(&key, None)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["from-elsewhere"]);
    }

    #[tokio::test]
    async fn test_list_finds_legacy_folder() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        let key = GameKey::new(Shop::Custom, "Hades II: Test");

        let main = drive.insert_folder(ROOT_FOLDER_ID, "CloudSaves");
        let legacy = drive.insert_folder(&main, "custom-Hades II: Test");
        drive.insert_folder(&legacy, "old-1");
        drive.insert_folder(&legacy, "old-2");

        let names: Vec<String> = store
            .list_backups(&key, Some(&main))
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["old-2", "old-1"]);

        assert!(store
            .list_backups(&GameKey::new(Shop::Custom, "Nothing"), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_listing_paginates_to_the_end() {
        let drive = Arc::new(MemoryDrive::new().with_page_cap(2));
        let store = store_with(&drive);
        for i in 0..5 {
            drive.insert_folder(ROOT_FOLDER_ID, &format!("folder-{i}"));
        }
        let names: Vec<String> = store
            .list_root_folders()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["folder-0", "folder-1", "folder-2", "folder-3", "folder-4"]);
    }

    #[test]
    fn test_record_labels() {
        let uuid_named = RemoteFile {
            id: "remote-1".into(),
            name: Uuid::new_v4().to_string(),
            mime_type: crate::FOLDER_MIME_TYPE.into(),
            parents: vec![],
            created_time: None,
            modified_time: Some(Utc::now()),
            trashed: false,
        };
        let record = to_backup_record(&uuid_named);
        assert_eq!(record.id.to_string(), "cloud-remote-1");
        assert!(record.label.starts_with("Backup of "));
        assert_eq!(record.created_at, uuid_named.modified_time.unwrap());
        assert_eq!(record.size_bytes, 0);

        let named = RemoteFile {
            name: "Before final boss".into(),
            ..uuid_named
        };
        assert_eq!(to_backup_record(&named).label, "Before final boss");
    }

    #[tokio::test]
    async fn test_auth_probe() {
        let drive = Arc::new(MemoryDrive::new());
        let store = store_with(&drive);
        assert!(store.is_authenticated().await);
        drive.set_authenticated(false);
        assert!(!store.is_authenticated().await);
    }

    #[test]
    fn test_plain_names_only() {
        assert!(is_plain_name("slot1.sav"));
        assert!(!is_plain_name("../escape"));
        assert!(!is_plain_name("a/b"));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name(""));
    }
}
