use anyhow::Result;
use save_vault_app::{AppSettings, BackupManager, GameBackups};
use save_vault_cloud::{DriveBackend, GoogleDriveBackend};
use save_vault_core::{LudusaviTool, SaveTool};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let persistence = save_vault_persistence::initialize_persistence().await?;
    if !persistence.database.health_check().await? {
        anyhow::bail!("Database health check failed");
    }
    let data_dir = save_vault_persistence::get_data_directory()?;
    let mut settings = AppSettings::load(&persistence.config_store, &data_dir).await?;
    log::info!("[BackupManager] backup root: {}", settings.backup_root.display());

    let tool = LudusaviTool::new(settings.tool_config());
    if !tool.is_available() {
        log::warn!(
            "[Ludusavi] binary not found at {}, backups will fail until it is installed",
            settings.ludusavi_binary.display()
        );
    }
    tool.ensure_config_file().await?;

    let drive = match settings.drive_tokens() {
        Some(tokens) if settings.cloud_enabled => {
            Some(Arc::new(GoogleDriveBackend::new(settings.client_secrets(), tokens)))
        }
        _ => {
            if settings.cloud_enabled {
                log::warn!("[GoogleDrive] cloud storage enabled but no tokens stored, sign in again");
            }
            None
        }
    };

    let manager = BackupManager::new(
        settings.clone(),
        persistence.config_store.clone(),
        persistence.games.clone(),
        Arc::new(tool) as Arc<dyn SaveTool>,
        drive.clone().map(|d| d as Arc<dyn DriveBackend>),
    );
    manager.ensure_backup_directory()?;

    let updated = manager.sync_backup_counts().await?;
    log::info!("[BackupManager] backup counts synced, {} games updated", updated);

    let all = manager.get_all_backups().await?;
    if std::env::args().any(|arg| arg == "--json") {
        println!("{}", serde_json::to_string_pretty(&all)?);
    } else {
        print_listing(&all);
    }

    // A refresh during this run replaces the stored access token.
    if let Some(drive) = drive {
        let tokens = drive.tokens().await;
        if settings.drive_tokens().as_ref() != Some(&tokens) {
            settings.set_drive_tokens(&tokens);
            settings.save_tokens(&persistence.config_store).await?;
            log::debug!("[GoogleDrive] stored refreshed tokens");
        }
    }

    persistence.database.close().await;
    Ok(())
}

fn print_listing(all: &[GameBackups]) {
    if all.is_empty() {
        println!("No backups found.");
    }
    for entry in all {
        println!("{} ({}) - {} backups", entry.game.title(), entry.game.key(), entry.backups.len());
        for backup in &entry.backups {
            println!(
                "  [{:?}] {}  {}  {}",
                backup.source(),
                backup.created_at.format("%Y-%m-%d %H:%M"),
                backup.label,
                backup.id
            );
        }
    }
}
