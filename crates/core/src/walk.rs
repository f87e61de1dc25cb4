use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// One entry below a walked root, visited parents-before-children.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    /// Path relative to the walk root.
    pub relative: PathBuf,
    pub kind: EntryKind,
    /// File length in bytes, 0 for directories.
    pub len: u64,
}

/// Walk every entry under `root` (the root itself excluded) in a stable,
/// name-sorted order and hand each one to `visit`.
pub fn walk<F>(root: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(&WalkEntry) -> Result<()>,
{
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            continue;
        };

        let len = match kind {
            EntryKind::File => entry.metadata().map(|m| m.len()).unwrap_or(0),
            EntryKind::Dir => 0,
        };
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();

        visit(&WalkEntry {
            path: entry.path().to_path_buf(),
            relative,
            kind,
            len,
        })?;
    }
    Ok(())
}

/// Collect the walk into a list, for callers that need to await per entry.
pub fn entries(root: &Path) -> Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    walk(root, |entry| {
        out.push(entry.clone());
        Ok(())
    })?;
    Ok(out)
}

/// Total bytes of all files under `root`. A missing directory counts as 0.
pub fn dir_size(root: &Path) -> Result<u64> {
    if !root.exists() {
        log::warn!("[Walk] size requested for missing directory {}", root.display());
        return Ok(0);
    }
    let mut total = 0u64;
    walk(root, |entry| {
        total += entry.len;
        Ok(())
    })?;
    Ok(total)
}

/// [`entries`] on the blocking pool, for async callers.
pub async fn entries_blocking(root: &Path) -> Result<Vec<WalkEntry>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || entries(&root)).await?
}

/// [`dir_size`] on the blocking pool, for async callers.
pub async fn dir_size_blocking(root: &Path) -> Result<u64> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size(&root)).await?
}
