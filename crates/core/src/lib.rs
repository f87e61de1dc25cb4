pub mod error;
pub mod identity;
pub mod local_store;
pub mod ludusavi;
pub mod models;
pub mod walk;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::BackupError;
pub use identity::{normalize_object_id, GameKey, Shop, UNKNOWN_GAME};
pub use local_store::{EphemeralBackup, LocalBackupStore, CLOUD_SAVES_DIR};
pub use ludusavi::{LudusaviTool, SaveTool, ScanCancel, ScanProgress, ScanReport, ToolConfig};
pub use models::{Achievement, BackupRecord, BackupRef, BackupSource, LocalBackupMetadata};
