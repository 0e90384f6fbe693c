//! Agent configuration for Hostwarden
//!
//! These are the daemon's own settings (intervals, limits, file locations).
//! The monitored paths, services and pattern lists are kept in separate
//! human-editable policy files managed by [`crate::store::ConfigStore`].

use crate::store::IntegrityMode;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Locations of the policy files
    #[serde(default)]
    pub policy: PolicyFiles,

    /// Polling intervals per engine
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Integrity engine settings
    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Service watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Content scanner settings
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Alert configuration
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Backup ledger configuration
    #[serde(default)]
    pub backup: BackupConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Compile a list of glob patterns, skipping (and logging) invalid ones
pub fn compile_excludes(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!("Ignoring invalid exclude pattern {:?}: {}", pattern, e),
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!("Failed to build exclude set: {}", e);
        GlobSet::empty()
    })
}

/// Policy file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFiles {
    /// Monitored paths, one per line with optional mode marker
    #[serde(default = "default_paths_file")]
    pub paths: PathBuf,

    /// Services kept alive by the watchdog
    #[serde(default = "default_services_file")]
    pub services: PathBuf,

    /// Pattern taxonomy (`category=kw1 kw2` or YAML/JSON mapping)
    #[serde(default = "default_patterns_file")]
    pub patterns: PathBuf,

    /// Directories walked by the content scanner
    #[serde(default = "default_scan_dirs_file")]
    pub scan_dirs: PathBuf,
}

impl Default for PolicyFiles {
    fn default() -> Self {
        Self {
            paths: default_paths_file(),
            services: default_services_file(),
            patterns: default_patterns_file(),
            scan_dirs: default_scan_dirs_file(),
        }
    }
}

/// Per-engine polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval")]
    pub integrity_interval_secs: u64,

    #[serde(default = "default_interval")]
    pub watchdog_interval_secs: u64,

    #[serde(default = "default_interval")]
    pub scanner_interval_secs: u64,

    #[serde(default = "default_true")]
    pub integrity_enabled: bool,

    #[serde(default = "default_true")]
    pub watchdog_enabled: bool,

    #[serde(default = "default_true")]
    pub scanner_enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            integrity_interval_secs: default_interval(),
            watchdog_interval_secs: default_interval(),
            scanner_interval_secs: default_interval(),
            integrity_enabled: true,
            watchdog_enabled: true,
            scanner_enabled: true,
        }
    }
}

/// Integrity engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Mode for path entries without an explicit marker
    #[serde(default)]
    pub default_mode: IntegrityMode,

    /// Read buffer size used while hashing
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Where hash baselines are persisted between runs
    #[serde(default = "default_database")]
    pub database: Option<PathBuf>,

    /// Paths/patterns excluded from hashing
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            default_mode: IntegrityMode::default(),
            chunk_size: default_chunk_size(),
            database: default_database(),
            exclude: Vec::new(),
        }
    }
}

/// Service watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Restart attempts allowed inside the window before a service is
    /// declared flapping
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Sliding window for counting restart attempts
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Lift flapping suppression automatically after this long
    pub cooldown_secs: Option<u64>,
}

impl WatchdogConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Option<Duration> {
        self.cooldown_secs.map(Duration::from_secs)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_secs: default_window_secs(),
            cooldown_secs: None,
        }
    }
}

/// Content scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Files larger than this are skipped
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Paths/patterns to exclude
    #[serde(default = "default_scanner_exclude")]
    pub exclude: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            exclude: default_scanner_exclude(),
        }
    }
}

/// Alert configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertConfig {
    /// Enable desktop notifications
    #[serde(default)]
    pub desktop: bool,

    /// Webhook URL for alerts
    pub webhook: Option<String>,

    /// Slack webhook
    pub slack: Option<String>,
}

impl AlertConfig {
    pub fn any_enabled(&self) -> bool {
        self.desktop || self.webhook.is_some() || self.slack.is_some()
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// PID file path
    #[serde(default = "default_pid_path")]
    pub pid_file: PathBuf,

    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,

    /// Daemon stdout/stderr log
    #[serde(default = "default_log_path")]
    pub log_file: PathBuf,

    /// Append-only security event log
    #[serde(default = "default_event_log_path")]
    pub event_log: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_path(),
            socket: default_socket_path(),
            log_file: default_log_path(),
            event_log: default_event_log_path(),
        }
    }
}

/// Backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Ledger of created archives
    #[serde(default = "default_ledger_path")]
    pub ledger: PathBuf,

    /// Default destination directory for archives
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            ledger: default_ledger_path(),
            archive_dir: default_archive_dir(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_paths_file() -> PathBuf {
    PathBuf::from("/etc/hostwarden/paths.conf")
}

fn default_services_file() -> PathBuf {
    PathBuf::from("/etc/hostwarden/services.conf")
}

fn default_patterns_file() -> PathBuf {
    PathBuf::from("/etc/hostwarden/patterns.conf")
}

fn default_scan_dirs_file() -> PathBuf {
    PathBuf::from("/etc/hostwarden/scan-dirs.conf")
}

fn default_interval() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    8192
}

fn default_database() -> Option<PathBuf> {
    Some(PathBuf::from("/var/lib/hostwarden/baseline.json"))
}

fn default_max_restarts() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    300
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_scanner_exclude() -> Vec<String> {
    vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()]
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("/run/hostwarden.pid")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/hostwarden.sock")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/hostwarden.log")
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from("/var/log/hostwarden-events.log")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("/var/lib/hostwarden/backup.ledger")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/backups/hostwarden")
}
