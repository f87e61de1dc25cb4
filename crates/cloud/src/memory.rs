//! In-memory drive for store and orchestrator tests.

use crate::{CloudError, DriveBackend, FilePage, FileQuery, OrderBy, RemoteFile, FOLDER_MIME_TYPE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

struct Entry {
    meta: RemoteFile,
    content: Vec<u8>,
}

struct State {
    entries: Vec<Entry>,
    next_id: u64,
    clock: DateTime<Utc>,
    authenticated: bool,
    reject_hard_delete: bool,
    page_cap: usize,
}

pub struct MemoryDrive {
    state: Mutex<State>,
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: Vec::new(),
                next_id: 1,
                clock: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now),
                authenticated: true,
                reject_hard_delete: false,
                page_cap: usize::MAX,
            }),
        }
    }

    /// Cap every page at `cap` entries regardless of the requested size.
    pub fn with_page_cap(self, cap: usize) -> Self {
        self.lock().page_cap = cap.max(1);
        self
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.lock().authenticated = authenticated;
    }

    /// Make hard deletes fail with 403 so callers fall back to trash.
    pub fn reject_hard_delete(&self, reject: bool) {
        self.lock().reject_hard_delete = reject;
    }

    /// Create a folder directly, bypassing any lookup.
    pub fn insert_folder(&self, parent: &str, name: &str) -> String {
        let mut state = self.lock();
        insert(&mut state, parent, name, FOLDER_MIME_TYPE, Vec::new()).id
    }

    pub fn insert_file(&self, parent: &str, name: &str, content: &[u8]) -> String {
        let mut state = self.lock();
        insert(&mut state, parent, name, "application/octet-stream", content.to_vec()).id
    }

    /// Live (non-trashed) entries with this parent and name.
    pub fn find_live(&self, parent: &str, name: &str) -> Vec<RemoteFile> {
        let query = FileQuery::children(parent).name(name);
        self.lock()
            .entries
            .iter()
            .filter(|e| query.matches(&e.meta))
            .map(|e| e.meta.clone())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.lock().entries.iter().filter(|e| !e.meta.trashed).count()
    }

    pub fn trashed_count(&self) -> usize {
        self.lock().entries.iter().filter(|e| e.meta.trashed).count()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.meta.id == id)
            .map(|e| e.content.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn insert(state: &mut State, parent: &str, name: &str, mime_type: &str, content: Vec<u8>) -> RemoteFile {
    let id = format!("mem-{}", state.next_id);
    state.next_id += 1;
    // Strictly increasing so "most recently created" is well defined.
    state.clock += Duration::seconds(1);
    let meta = RemoteFile {
        id,
        name: name.to_string(),
        mime_type: mime_type.to_string(),
        parents: vec![parent.to_string()],
        created_time: Some(state.clock),
        modified_time: Some(state.clock),
        trashed: false,
    };
    state.entries.push(Entry {
        meta: meta.clone(),
        content,
    });
    meta
}

#[async_trait]
impl DriveBackend for MemoryDrive {
    async fn list(&self, query: &FileQuery, page_token: Option<&str>) -> Result<FilePage> {
        let state = self.lock();
        if !state.authenticated {
            return Err(CloudError::NotAuthenticated.into());
        }
        let mut matches: Vec<RemoteFile> = state
            .entries
            .iter()
            .filter(|e| query.matches(&e.meta))
            .map(|e| e.meta.clone())
            .collect();
        match query.order_by {
            OrderBy::CreatedDesc => matches.sort_by(|a, b| b.created_time.cmp(&a.created_time)),
            OrderBy::Name => matches.sort_by(|a, b| a.name.cmp(&b.name)),
            OrderBy::Unspecified => {}
        }

        let offset = match page_token {
            Some(token) => token.parse::<usize>().context("bad page token")?,
            None => 0,
        };
        let size = (query.page_size as usize).max(1).min(state.page_cap);
        let end = (offset + size).min(matches.len());
        let files = matches.get(offset..end).map(<[RemoteFile]>::to_vec).unwrap_or_default();
        let next_page_token = (end < matches.len()).then(|| end.to_string());
        Ok(FilePage { files, next_page_token })
    }

    async fn get(&self, id: &str) -> Result<Option<RemoteFile>> {
        Ok(self
            .lock()
            .entries
            .iter()
            .find(|e| e.meta.id == id)
            .map(|e| e.meta.clone()))
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteFile> {
        let mut state = self.lock();
        if !state.authenticated {
            return Err(CloudError::NotAuthenticated.into());
        }
        Ok(insert(&mut state, parent, name, FOLDER_MIME_TYPE, Vec::new()))
    }

    async fn upload_file(&self, parent: &str, name: &str, local_path: &Path) -> Result<RemoteFile> {
        let content = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;
        let mut state = self.lock();
        if !state.authenticated {
            return Err(CloudError::NotAuthenticated.into());
        }
        Ok(insert(&mut state, parent, name, "application/octet-stream", content))
    }

    async fn download_file(&self, id: &str, dest: &Path) -> Result<()> {
        let content = self.content(id).ok_or_else(|| CloudError::Api {
            status: 404,
            body: format!("File not found: {id}"),
        })?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, content).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.reject_hard_delete {
            return Err(CloudError::Api {
                status: 403,
                body: "insufficientFilePermissions".into(),
            }
            .into());
        }
        let before = state.entries.len();
        state.entries.retain(|e| e.meta.id != id);
        if state.entries.len() == before {
            return Err(CloudError::Api {
                status: 404,
                body: format!("File not found: {id}"),
            }
            .into());
        }
        Ok(())
    }

    async fn trash(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.meta.id == id)
            .ok_or_else(|| CloudError::Api {
                status: 404,
                body: format!("File not found: {id}"),
            })?;
        entry.meta.trashed = true;
        Ok(())
    }

    async fn about(&self) -> Result<String> {
        if self.lock().authenticated {
            Ok("Memory Drive".to_string())
        } else {
            Err(CloudError::NotAuthenticated.into())
        }
    }
}
