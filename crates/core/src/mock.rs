//! In-process stand-in for ludusavi, for tests in this and dependent crates.

use crate::error::BackupError;
use crate::identity::GameKey;
use crate::ludusavi::{FileReport, GameReport, SaveTool, ScanCancel, ScanProgress, ScanReport};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Files captured from a restore source, keyed by relative path.
pub type Snapshot = BTreeMap<PathBuf, Vec<u8>>;

pub struct FakeSaveTool {
    files: Vec<(PathBuf, Vec<u8>)>,
    fail_backups: AtomicBool,
    failing_games: Mutex<HashSet<String>>,
    backup_targets: Mutex<Vec<PathBuf>>,
    restores: Mutex<Vec<(PathBuf, Snapshot)>>,
    custom_games: Mutex<BTreeMap<String, PathBuf>>,
}

impl Default for FakeSaveTool {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSaveTool {
    pub fn new() -> Self {
        Self::with_files(vec![
            ("saves/slot1.sav", b"slot-one-data".to_vec()),
            ("saves/profile/options.ini", b"volume=7".to_vec()),
        ])
    }

    pub fn with_files(files: Vec<(&str, Vec<u8>)>) -> Self {
        Self {
            files: files.into_iter().map(|(p, c)| (PathBuf::from(p), c)).collect(),
            fail_backups: AtomicBool::new(false),
            failing_games: Mutex::new(HashSet::new()),
            backup_targets: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
            custom_games: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn fail_backups(&self, fail: bool) {
        self.fail_backups.store(fail, Ordering::SeqCst);
    }

    /// Fail backups of one object id only.
    pub fn fail_for(&self, object_id: &str) {
        lock(&self.failing_games).insert(object_id.to_string());
    }

    /// Bytes written by one backup.
    pub fn payload_bytes(&self) -> u64 {
        self.files.iter().map(|(_, c)| c.len() as u64).sum()
    }

    /// Files written by one backup.
    pub fn expected_snapshot(&self) -> Snapshot {
        self.files.iter().cloned().collect()
    }

    pub fn backup_targets(&self) -> Vec<PathBuf> {
        lock(&self.backup_targets).clone()
    }

    pub fn restored_sources(&self) -> Vec<PathBuf> {
        lock(&self.restores).iter().map(|(p, _)| p.clone()).collect()
    }

    /// Contents of each restore source at the time it was restored.
    pub fn restored_snapshots(&self) -> Vec<Snapshot> {
        lock(&self.restores).iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn custom_games(&self) -> BTreeMap<String, PathBuf> {
        lock(&self.custom_games).clone()
    }

    fn report(&self, key: &GameKey) -> ScanReport {
        let files = self
            .files
            .iter()
            .map(|(path, content)| {
                (
                    path.to_string_lossy().into_owned(),
                    FileReport {
                        change: Some("New".into()),
                        bytes: content.len() as u64,
                    },
                )
            })
            .collect();
        let mut report = ScanReport::default();
        report.overall.total_games = 1;
        report.overall.total_bytes = self.payload_bytes();
        report.games.insert(
            key.object_id.clone(),
            GameReport {
                files,
                ..GameReport::default()
            },
        );
        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn snapshot(root: &Path) -> Result<Snapshot> {
    let mut out = Snapshot::new();
    for entry in crate::walk::entries(root)? {
        if entry.kind == crate::walk::EntryKind::File {
            out.insert(entry.relative.clone(), std::fs::read(&entry.path)?);
        }
    }
    Ok(out)
}

#[async_trait]
impl SaveTool for FakeSaveTool {
    async fn preview(&self, key: &GameKey) -> Result<ScanReport> {
        let mut report = self.report(key);
        report.custom_backup_path = lock(&self.custom_games)
            .get(&key.object_id)
            .map(|p| p.to_string_lossy().into_owned());
        Ok(report)
    }

    async fn scan_all(&self, on_progress: &ScanProgress, cancel: &ScanCancel) -> Result<ScanReport> {
        if cancel.is_cancelled() {
            return Err(BackupError::ScanCancelled.into());
        }
        on_progress(10);
        on_progress(100);
        Ok(self.report(&GameKey::new(Default::default(), "Fake Game")))
    }

    async fn backup(&self, key: &GameKey, target: &Path, _wine_prefix: Option<&str>) -> Result<ScanReport> {
        lock(&self.backup_targets).push(target.to_path_buf());
        if self.fail_backups.load(Ordering::SeqCst) || lock(&self.failing_games).contains(&key.object_id) {
            return Err(BackupError::ToolFailed {
                args: format!("backup {}", key.object_id),
                code: Some(1),
                stderr: "simulated failure".into(),
            }
            .into());
        }
        for (relative, content) in &self.files {
            let path = target.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }
        Ok(self.report(key))
    }

    async fn restore(&self, _key: &GameKey, source: &Path, _wine_prefix: Option<&str>) -> Result<()> {
        if !source.is_dir() {
            return Err(BackupError::BackupDirectoryNotFound(source.to_path_buf()).into());
        }
        let files = snapshot(source)?;
        lock(&self.restores).push((source.to_path_buf(), files));
        Ok(())
    }

    async fn add_custom_game(&self, name: &str, save_path: &Path) -> Result<()> {
        lock(&self.custom_games).insert(name.to_string(), save_path.to_path_buf());
        Ok(())
    }

    async fn remove_custom_game(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.custom_games).remove(name).is_some())
    }
}
