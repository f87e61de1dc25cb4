use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix that marks a backup id as living in cloud storage.
pub const CLOUD_ID_PREFIX: &str = "cloud-";

/// Hostname recorded for backups made on this machine.
pub const LOCAL_HOSTNAME: &str = "local";

pub const METADATA_FILE: &str = "metadata.json";
pub const ACHIEVEMENTS_FILE: &str = "achievements.json";
pub const CLOUD_ONLY_MARKER: &str = ".cloud-only";

/// Unlock records are passed through untouched.
pub type Achievement = serde_json::Value;

/// Where a backup lives. Parsed once from the prefixed id string at the
/// API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum BackupRef {
    Local(String),
    Cloud(String),
}

impl BackupRef {
    pub fn parse(id: &str) -> Self {
        match id.strip_prefix(CLOUD_ID_PREFIX) {
            Some(remote) => BackupRef::Cloud(remote.to_string()),
            None => BackupRef::Local(id.to_string()),
        }
    }

    /// The id without any source prefix.
    pub fn raw_id(&self) -> &str {
        match self {
            BackupRef::Local(id) | BackupRef::Cloud(id) => id,
        }
    }

    pub fn source(&self) -> BackupSource {
        match self {
            BackupRef::Local(_) => BackupSource::Local,
            BackupRef::Cloud(_) => BackupSource::Cloud,
        }
    }
}

impl fmt::Display for BackupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupRef::Local(id) => f.write_str(id),
            BackupRef::Cloud(id) => write!(f, "{CLOUD_ID_PREFIX}{id}"),
        }
    }
}

impl From<String> for BackupRef {
    fn from(value: String) -> Self {
        BackupRef::parse(&value)
    }
}

impl From<BackupRef> for String {
    fn from(value: BackupRef) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupSource {
    Local,
    Cloud,
}

/// A backup as presented to callers, local or cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: BackupRef,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub source_hostname: Option<String>,
    pub download_option_title: Option<String>,
}

impl BackupRecord {
    pub fn source(&self) -> BackupSource {
        self.id.source()
    }

    pub fn is_cloud(&self) -> bool {
        self.source() == BackupSource::Cloud
    }
}

/// On-disk `metadata.json` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackupMetadata {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub download_option_title: Option<String>,
    #[serde(default)]
    pub artifact_length_in_bytes: u64,
    #[serde(default = "local_hostname")]
    pub hostname: String,
}

fn local_hostname() -> String {
    LOCAL_HOSTNAME.to_string()
}

impl LocalBackupMetadata {
    pub fn into_record(self) -> BackupRecord {
        let label = resolve_label(self.label.as_deref(), self.created_at);
        BackupRecord {
            id: BackupRef::Local(self.id),
            label,
            created_at: self.created_at,
            size_bytes: self.artifact_length_in_bytes,
            source_hostname: Some(self.hostname),
            download_option_title: self.download_option_title,
        }
    }
}

pub fn default_label(created_at: DateTime<Utc>) -> String {
    format!(
        "Backup of {}",
        created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
    )
}

/// Labels older releases wrote when no label was given.
pub fn is_placeholder_label(label: &str) -> bool {
    let label = label.trim();
    label.is_empty() || label == "null" || label == "undefined"
}

/// Keep a real label, regenerate anything that is missing or a placeholder.
pub fn resolve_label(label: Option<&str>, created_at: DateTime<Utc>) -> String {
    match label {
        Some(label) if !is_placeholder_label(label) => label.to_string(),
        _ => default_label(created_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_ref_prefix() {
        assert_eq!(BackupRef::parse("cloud-abc"), BackupRef::Cloud("abc".into()));
        assert_eq!(BackupRef::parse("1234-uuid"), BackupRef::Local("1234-uuid".into()));
        assert_eq!(BackupRef::Cloud("abc".into()).to_string(), "cloud-abc");

        let json = serde_json::to_string(&BackupRef::Cloud("xyz".into())).unwrap();
        assert_eq!(json, "\"cloud-xyz\"");
        let back: BackupRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back.raw_id(), "xyz");
    }

    #[test]
    fn test_placeholder_labels_are_regenerated() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        for bad in [None, Some(""), Some("null"), Some("undefined"), Some("  ")] {
            assert!(resolve_label(bad, at).starts_with("Backup of "));
        }
        assert_eq!(resolve_label(Some("Before boss"), at), "Before boss");
    }

    #[test]
    fn test_metadata_reads_legacy_json() {
        let raw = r#"{
            "id": "b1",
            "label": "null",
            "createdAt": "2023-11-05T10:20:30.000Z",
            "downloadOptionTitle": null,
            "artifactLengthInBytes": 42,
            "hostname": "local"
        }"#;
        let meta: LocalBackupMetadata = serde_json::from_str(raw).unwrap();
        let record = meta.into_record();

        assert_eq!(record.id, BackupRef::Local("b1".into()));
        assert_eq!(record.size_bytes, 42);
        assert!(record.label.starts_with("Backup of "));
        assert_eq!(record.source_hostname.as_deref(), Some(LOCAL_HOSTNAME));
    }
}
