use std::path::PathBuf;

/// Failures callers may want to tell apart. These travel inside
/// `anyhow::Error` and can be recovered with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("ludusavi {args} failed (exit code {code:?}): {stderr}")]
    ToolFailed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("ludusavi produced unreadable output: {0}")]
    ToolOutput(String),
    #[error("ludusavi scan timed out")]
    ScanTimeout,
    #[error("Scan cancelled by user")]
    ScanCancelled,
    #[error("Backup directory not found: {}", .0.display())]
    BackupDirectoryNotFound(PathBuf),
    #[error("Invalid backup id: {0}")]
    InvalidBackupId(String),
}
