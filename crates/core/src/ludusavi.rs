use crate::error::BackupError;
use crate::identity::GameKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};

/// Hard limit for a whole-system scan.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(120);
const PROGRESS_TICK: Duration = Duration::from_millis(200);
const PROGRESS_START: u8 = 10;
const PROGRESS_CAP: u8 = 90;
const PROGRESS_STEP: u8 = 2;
const PROGRESS_EXITED: u8 = 95;

/// Synthetic scan progress sink, 0..=100.
pub type ScanProgress = dyn Fn(u8) + Send + Sync;

/// Location of the ludusavi binary and its configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub binary_path: PathBuf,
    pub config_file: Option<PathBuf>,
}

impl ToolConfig {
    pub fn new(binary_path: impl Into<PathBuf>, config_file: Option<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            config_file,
        }
    }

    /// Binary and `config.yaml` side by side in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            binary_path: dir.join(Self::binary_name()),
            config_file: Some(dir.join("config.yaml")),
        }
    }

    /// Per-user install location, `<data dir>/save-vault/ludusavi`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("save-vault").join("ludusavi"))
    }

    pub fn binary_name() -> &'static str {
        if cfg!(windows) {
            "ludusavi.exe"
        } else {
            "ludusavi"
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    #[serde(default)]
    pub new: u64,
    #[serde(default)]
    pub different: u64,
    #[serde(default)]
    pub same: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallSummary {
    #[serde(default)]
    pub total_games: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub processed_games: u64,
    #[serde(default)]
    pub processed_bytes: u64,
    #[serde(default)]
    pub changed_games: ChangeCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    #[serde(default)]
    pub change: Option<String>,
    #[serde(default)]
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameReport {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub change: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, FileReport>,
    #[serde(default)]
    pub registry: BTreeMap<String, serde_json::Value>,
}

/// Parsed `--api` output of a backup or preview run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    #[serde(default)]
    pub overall: OverallSummary,
    #[serde(default)]
    pub games: BTreeMap<String, GameReport>,
    /// First save path of a matching custom game, filled in by `preview`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_backup_path: Option<String>,
}

impl ScanReport {
    pub fn parse(stdout: &[u8]) -> Result<Self> {
        serde_json::from_slice(stdout).map_err(|e| BackupError::ToolOutput(e.to_string()).into())
    }

    /// Names of games with at least one detected file.
    pub fn games_with_files(&self) -> Vec<String> {
        self.games
            .iter()
            .filter(|(_, game)| !game.files.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Best-effort cancellation for a running whole-system scan.
#[derive(Debug, Clone, Default)]
pub struct ScanCancel {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ScanCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Save detection and transfer tool.
#[async_trait]
pub trait SaveTool: Send + Sync {
    /// Dry run for one game.
    async fn preview(&self, key: &GameKey) -> Result<ScanReport>;

    /// Dry run for every game the tool knows about.
    async fn scan_all(&self, on_progress: &ScanProgress, cancel: &ScanCancel) -> Result<ScanReport>;

    /// Copy the detected save files of `key` into `target`.
    async fn backup(&self, key: &GameKey, target: &Path, wine_prefix: Option<&str>) -> Result<ScanReport>;

    /// Copy the files in `source` back to their original locations.
    async fn restore(&self, key: &GameKey, source: &Path, wine_prefix: Option<&str>) -> Result<()>;

    async fn add_custom_game(&self, name: &str, save_path: &Path) -> Result<()>;

    async fn remove_custom_game(&self, name: &str) -> Result<bool>;

    /// Games with saves on this machine. Failures yield an empty list.
    async fn find_installed_games(&self) -> Vec<String> {
        match self.scan_all(&|_| {}, &ScanCancel::new()).await {
            Ok(report) => report.games_with_files(),
            Err(e) => {
                log::error!("[Ludusavi] find installed games failed: {e:#}");
                Vec::new()
            }
        }
    }
}

/// [`SaveTool`] backed by the ludusavi command line.
pub struct LudusaviTool {
    config: ToolConfig,
    scan_timeout: Duration,
    // ludusavi keeps state in a single config file; one invocation at a time.
    lock: Mutex<()>,
}

impl LudusaviTool {
    pub fn new(config: ToolConfig) -> Self {
        Self {
            config,
            scan_timeout: SCAN_TIMEOUT,
            lock: Mutex::new(()),
        }
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.config.binary_path.is_file()
    }

    fn backup_args(object_id: &str, preview: bool, path: Option<&Path>, wine_prefix: Option<&str>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["backup".into(), object_id.into(), "--api".into(), "--force".into()];
        if preview {
            args.push("--preview".into());
        }
        if let Some(path) = path {
            args.push("--path".into());
            args.push(path.into());
        }
        if let Some(prefix) = wine_prefix {
            args.push("--wine-prefix".into());
            args.push(prefix.into());
        }
        args
    }

    fn restore_args(object_id: &str, source: &Path, wine_prefix: Option<&str>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "restore".into(),
            object_id.into(),
            "--path".into(),
            source.into(),
            "--force".into(),
        ];
        if let Some(prefix) = wine_prefix {
            args.push("--wine-prefix".into());
            args.push(prefix.into());
        }
        args
    }

    fn scan_args() -> Vec<OsString> {
        vec!["backup".into(), "--preview".into(), "--api".into()]
    }

    /// `--config <file>` goes in front of the subcommand.
    fn with_config(config_file: &Path, args: &[OsString]) -> Vec<OsString> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push(OsString::from("--config"));
        full.push(config_file.as_os_str().to_os_string());
        full.extend(args.iter().cloned());
        full
    }

    fn describe(args: &[OsString]) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self, args: &[OsString]) -> Command {
        let mut cmd = Command::new(&self.config.binary_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_once(&self, args: &[OsString]) -> Result<Vec<u8>> {
        log::debug!("[Ludusavi] running {} {}", self.config.binary_path.display(), Self::describe(args));

        let output = self
            .command(args)
            .output()
            .await
            .with_context(|| format!("Failed to start ludusavi at {}", self.config.binary_path.display()))?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stderr.trim().is_empty() {
            log::warn!("[Ludusavi] stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            return Err(BackupError::ToolFailed {
                args: Self::describe(args),
                code: output.status.code(),
                stderr,
            }
            .into());
        }
        Ok(output.stdout)
    }

    /// Run with the config file first, then once more with tool defaults.
    async fn run_with_fallback<T, P>(&self, args: Vec<OsString>, parse: P) -> Result<T>
    where
        T: Send,
        P: Fn(&[u8]) -> Result<T> + Send + Sync,
    {
        let _guard = self.lock.lock().await;

        if let Some(config_file) = &self.config.config_file {
            let configured = Self::with_config(config_file, &args);
            match self.run_once(&configured).await.and_then(|out| parse(&out)) {
                Ok(value) => return Ok(value),
                Err(e) => log::warn!("[Ludusavi] command with config failed, trying without config: {e:#}"),
            }
        }

        self.run_once(&args).await.and_then(|out| parse(&out))
    }

    async fn scan_once(&self, args: &[OsString], on_progress: &ScanProgress, cancel: &ScanCancel) -> Result<ScanReport> {
        if cancel.is_cancelled() {
            return Err(BackupError::ScanCancelled.into());
        }

        let mut child = self
            .command(args)
            .spawn()
            .with_context(|| format!("Failed to start ludusavi at {}", self.config.binary_path.display()))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_pipe(stdout_pipe));
        let stderr_task = tokio::spawn(read_pipe(stderr_pipe));

        let mut progress = PROGRESS_START;
        on_progress(progress);

        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.tick().await;
        let deadline = tokio::time::sleep(self.scan_timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status.context("Failed to wait for ludusavi")?,
                _ = ticker.tick() => {
                    if progress < PROGRESS_CAP {
                        progress += PROGRESS_STEP;
                        on_progress(progress);
                    }
                }
                _ = &mut deadline => {
                    log::error!("[Ludusavi] scan timed out after {:?}", self.scan_timeout);
                    let _ = child.kill().await;
                    return Err(BackupError::ScanTimeout.into());
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(BackupError::ScanCancelled.into());
                }
            }
        };

        on_progress(PROGRESS_EXITED);

        let stdout = stdout_task.await.context("stdout reader panicked")??;
        let stderr = String::from_utf8_lossy(&stderr_task.await.context("stderr reader panicked")??).into_owned();
        if !stderr.trim().is_empty() {
            log::warn!("[Ludusavi] stderr: {}", stderr.trim());
        }

        if !status.success() {
            return Err(BackupError::ToolFailed {
                args: Self::describe(args),
                code: status.code(),
                stderr,
            }
            .into());
        }

        let report = ScanReport::parse(&stdout)?;
        log::info!("[Ludusavi] scan found {} games", report.games.len());
        Ok(report)
    }

    async fn read_config(&self) -> Result<YamlValue> {
        let Some(path) = &self.config.config_file else {
            return Ok(YamlValue::Mapping(Mapping::new()));
        };
        if !path.exists() {
            return Ok(default_config());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value: YamlValue =
            serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(match value {
            YamlValue::Null => default_config(),
            other => other,
        })
    }

    async fn write_config(&self, value: &YamlValue) -> Result<()> {
        let path = self
            .config
            .config_file
            .as_ref()
            .context("No ludusavi config file configured")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_yaml::to_string(value)?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Write a minimal config file if none exists yet.
    pub async fn ensure_config_file(&self) -> Result<()> {
        if let Some(path) = &self.config.config_file {
            if !path.exists() {
                log::info!("[Ludusavi] creating default config at {}", path.display());
                self.write_config(&default_config()).await?;
            }
        }
        Ok(())
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn default_config() -> YamlValue {
    let mut manifest = Mapping::new();
    manifest.insert("enable".into(), YamlValue::Bool(false));

    let mut root = Mapping::new();
    root.insert("manifest".into(), YamlValue::Mapping(manifest));
    root.insert("customGames".into(), YamlValue::Sequence(Vec::new()));
    YamlValue::Mapping(root)
}

fn custom_games_mut(config: &mut YamlValue) -> Result<&mut Vec<YamlValue>> {
    let root = config
        .as_mapping_mut()
        .context("ludusavi config is not a mapping")?;
    if !root.get("customGames").is_some_and(YamlValue::is_sequence) {
        root.insert("customGames".into(), YamlValue::Sequence(Vec::new()));
    }
    root.get_mut("customGames")
        .and_then(YamlValue::as_sequence_mut)
        .context("customGames is not a list")
}

fn custom_game_name(entry: &YamlValue) -> Option<&str> {
    entry.get("name").and_then(YamlValue::as_str)
}

fn custom_backup_path(config: &YamlValue, name: &str) -> Option<String> {
    config
        .get("customGames")?
        .as_sequence()?
        .iter()
        .find(|game| custom_game_name(game) == Some(name))?
        .get("files")?
        .as_sequence()?
        .first()?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl SaveTool for LudusaviTool {
    async fn preview(&self, key: &GameKey) -> Result<ScanReport> {
        let args = Self::backup_args(&key.object_id, true, None, None);
        let mut report = self.run_with_fallback(args, ScanReport::parse).await?;

        let config = {
            let _guard = self.lock.lock().await;
            self.read_config().await
        };
        match config {
            Ok(config) => report.custom_backup_path = custom_backup_path(&config, &key.object_id),
            Err(e) => log::warn!("[Ludusavi] could not read config for custom games: {e:#}"),
        }
        Ok(report)
    }

    async fn scan_all(&self, on_progress: &ScanProgress, cancel: &ScanCancel) -> Result<ScanReport> {
        let _guard = self.lock.lock().await;
        let args = Self::scan_args();

        if let Some(config_file) = &self.config.config_file {
            let configured = Self::with_config(config_file, &args);
            match self.scan_once(&configured, on_progress, cancel).await {
                Ok(report) => {
                    on_progress(100);
                    return Ok(report);
                }
                Err(e) if matches!(e.downcast_ref::<BackupError>(), Some(BackupError::ScanCancelled)) => {
                    return Err(e);
                }
                Err(e) => log::warn!("[Ludusavi] scan with config failed, trying without config: {e:#}"),
            }
        }

        let report = self.scan_once(&args, on_progress, cancel).await?;
        on_progress(100);
        Ok(report)
    }

    async fn backup(&self, key: &GameKey, target: &Path, wine_prefix: Option<&str>) -> Result<ScanReport> {
        log::info!("[Ludusavi] backing up {} into {}", key, target.display());
        let args = Self::backup_args(&key.object_id, false, Some(target), wine_prefix);
        self.run_with_fallback(args, ScanReport::parse).await
    }

    async fn restore(&self, key: &GameKey, source: &Path, wine_prefix: Option<&str>) -> Result<()> {
        if !self.is_available() {
            anyhow::bail!(
                "Ludusavi executable not found at: {}",
                self.config.binary_path.display()
            );
        }
        if !source.exists() {
            return Err(BackupError::BackupDirectoryNotFound(source.to_path_buf()).into());
        }
        log::info!("[Ludusavi] restoring {} from {}", key, source.display());
        let args = Self::restore_args(&key.object_id, source, wine_prefix);
        self.run_with_fallback(args, |_| Ok(())).await
    }

    async fn add_custom_game(&self, name: &str, save_path: &Path) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.read_config().await?;
        let games = custom_games_mut(&mut config)?;
        games.retain(|game| custom_game_name(game) != Some(name));

        let mut entry = Mapping::new();
        entry.insert("name".into(), name.into());
        entry.insert(
            "files".into(),
            YamlValue::Sequence(vec![save_path.to_string_lossy().into_owned().into()]),
        );
        entry.insert("registry".into(), YamlValue::Sequence(Vec::new()));
        games.push(YamlValue::Mapping(entry));

        self.write_config(&config).await?;
        log::info!("[Ludusavi] registered custom game {name}");
        Ok(())
    }

    async fn remove_custom_game(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut config = self.read_config().await?;
        let games = custom_games_mut(&mut config)?;
        let before = games.len();
        games.retain(|game| custom_game_name(game) != Some(name));
        let removed = games.len() != before;
        if removed {
            self.write_config(&config).await?;
        }
        Ok(removed)
    }

    async fn find_installed_games(&self) -> Vec<String> {
        let result = {
            let _guard = self.lock.lock().await;
            self.run_once(&Self::scan_args())
                .await
                .and_then(|out| ScanReport::parse(&out))
        };
        match result {
            Ok(report) => report.games_with_files(),
            Err(e) => {
                log::error!("[Ludusavi] find installed games failed: {e:#}");
                Vec::new()
            }
        }
    }
}
