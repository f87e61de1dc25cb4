use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod cloud_backup_store;
pub mod drive;
#[cfg(any(test, feature = "mock"))]
pub mod memory;

pub use cloud_backup_store::*;
pub use drive::{DriveTokens, GoogleDriveBackend, OAuthClientSecrets};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Alias Drive accepts for the top of "My Drive".
pub const ROOT_FOLDER_ID: &str = "root";

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Not authenticated with cloud storage")]
    NotAuthenticated,
    #[error("Cloud folder not found: {0}")]
    FolderNotFound(String),
    #[error("Cloud API error: HTTP {status} - {body}")]
    Api { status: u16, body: String },
    #[error("Invalid OAuth credentials: {0}")]
    InvalidCredentials(String),
}

impl CloudError {
    pub fn is_status(err: &anyhow::Error, code: u16) -> bool {
        matches!(err.downcast_ref::<CloudError>(), Some(CloudError::Api { status, .. }) if *status == code)
    }
}

/// A file or folder as Drive reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trashed: bool,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
    Any,
    Folders,
    Files,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Unspecified,
    CreatedDesc,
    Name,
}

impl OrderBy {
    pub fn as_param(&self) -> Option<&'static str> {
        match self {
            OrderBy::Unspecified => None,
            OrderBy::CreatedDesc => Some("createdTime desc"),
            OrderBy::Name => Some("name"),
        }
    }
}

/// Structured form of a Drive `q` search. Trashed entries never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileQuery {
    pub parent: Option<String>,
    pub name: Option<String>,
    pub kind: KindFilter,
    pub order_by: OrderBy,
    pub page_size: u32,
}

impl Default for FileQuery {
    fn default() -> Self {
        Self {
            parent: None,
            name: None,
            kind: KindFilter::Any,
            order_by: OrderBy::Unspecified,
            page_size: 100,
        }
    }
}

impl FileQuery {
    pub fn children(parent: &str) -> Self {
        Self {
            parent: Some(parent.to_string()),
            ..Self::default()
        }
    }

    /// Search all of the drive by exact name.
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn folders(mut self) -> Self {
        self.kind = KindFilter::Folders;
        self
    }

    pub fn files(mut self) -> Self {
        self.kind = KindFilter::Files;
        self
    }

    pub fn order(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn to_drive_q(&self) -> String {
        let mut clauses = Vec::new();
        if let Some(parent) = &self.parent {
            clauses.push(format!("'{}' in parents", escape_query_value(parent)));
        }
        if let Some(name) = &self.name {
            clauses.push(format!("name='{}'", escape_query_value(name)));
        }
        match self.kind {
            KindFilter::Folders => clauses.push(format!("mimeType='{FOLDER_MIME_TYPE}'")),
            KindFilter::Files => clauses.push(format!("mimeType!='{FOLDER_MIME_TYPE}'")),
            KindFilter::Any => {}
        }
        clauses.push("trashed=false".to_string());
        clauses.join(" and ")
    }

    /// Same predicate as [`FileQuery::to_drive_q`], evaluated locally.
    pub fn matches(&self, file: &RemoteFile) -> bool {
        if file.trashed {
            return false;
        }
        if let Some(parent) = &self.parent {
            if !file.parents.iter().any(|p| p == parent) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &file.name != name {
                return false;
            }
        }
        match self.kind {
            KindFilter::Folders => file.is_folder(),
            KindFilter::Files => !file.is_folder(),
            KindFilter::Any => true,
        }
    }
}

/// Escape a literal for use inside a single-quoted Drive query string.
pub fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Minimal surface of a hierarchical drive the backup store needs.
#[async_trait]
pub trait DriveBackend: Send + Sync {
    async fn list(&self, query: &FileQuery, page_token: Option<&str>) -> Result<FilePage>;
    /// `None` when no file has this id.
    async fn get(&self, id: &str) -> Result<Option<RemoteFile>>;
    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteFile>;
    async fn upload_file(&self, parent: &str, name: &str, local_path: &Path) -> Result<RemoteFile>;
    async fn download_file(&self, id: &str, dest: &Path) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn trash(&self, id: &str) -> Result<()>;
    /// Name of the signed-in account. Doubles as the session liveness probe.
    async fn about(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(name: &str, parent: &str) -> RemoteFile {
        RemoteFile {
            id: format!("id-{name}"),
            name: name.to_string(),
            mime_type: FOLDER_MIME_TYPE.to_string(),
            parents: vec![parent.to_string()],
            created_time: None,
            modified_time: None,
            trashed: false,
        }
    }

    #[test]
    fn test_folder_query_string() {
        let q = FileQuery::children("abc").name("steam-Hades").folders().to_drive_q();
        assert_eq!(
            q,
            "'abc' in parents and name='steam-Hades' and mimeType='application/vnd.google-apps.folder' and trashed=false"
        );
    }

    #[test]
    fn test_query_values_are_escaped() {
        assert_eq!(escape_query_value("Baldur's Gate"), "Baldur\\'s Gate");
        assert_eq!(escape_query_value("a\\b"), "a\\\\b");

        let q = FileQuery::named("Assassin's Creed").to_drive_q();
        assert_eq!(q, "name='Assassin\\'s Creed' and trashed=false");
    }

    #[test]
    fn test_local_match_mirrors_query() {
        let query = FileQuery::children("root").name("CloudSaves").folders();
        let mut file = folder("CloudSaves", "root");
        assert!(query.matches(&file));

        file.trashed = true;
        assert!(!query.matches(&file));

        assert!(!query.matches(&folder("CloudSaves", "other")));
        assert!(!FileQuery::children("root").files().matches(&folder("x", "root")));
    }

    #[test]
    fn test_error_status_check() {
        let err: anyhow::Error = CloudError::Api {
            status: 404,
            body: "missing".into(),
        }
        .into();
        assert!(CloudError::is_status(&err, 404));
        assert!(!CloudError::is_status(&err, 403));
        assert!(err.to_string().contains("HTTP 404"));
    }
}
