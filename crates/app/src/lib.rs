pub mod backup_manager;
pub mod settings;

pub use backup_manager::*;
pub use settings::{AppSettings, DefaultFolder};

/// Orchestrator failures callers may want to match on.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Game not found: {0}")]
    GameNotFound(String),
    #[error("Cloud storage is not enabled")]
    CloudDisabled,
    #[error("Game already registered: {0}")]
    DuplicateGame(String),
}
