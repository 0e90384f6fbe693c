//! Hostwarden - host integrity and service watchdog agent
//!
//! This library provides the engines of a small host security agent for
//! Linux servers. Each engine runs on its own interval against a shared,
//! live-editable policy.
//!
//! # Features
//!
//! - **Integrity** - Hash baselines and immutable-attribute enforcement
//! - **Watchdog** - Restart stopped services, with flapping suppression
//! - **Scanner** - Whole-word malicious pattern search in configured trees
//! - **Backup** - Timestamped directory archives and restores
//!
//! # Example
//!
//! ```rust,no_run
//! use hostwarden::{Agent, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let agent = Agent::new(Config::default())?;
//!     agent.start().await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     agent.shutdown().await;
//!
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod daemon;
pub mod detector;
pub mod error;
pub mod platform;
pub mod response;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use detector::{Event, EventKind, Finding, Severity};
pub use error::{ConfigError, PlatformError};
pub use platform::{Platform, SystemPlatform};
pub use response::EventLog;
pub use scheduler::{Coordinator, Engine, EngineKind};
pub use store::{ConfigEdit, ConfigStore, IntegrityMode, Policy, Section};

use anyhow::Context;
use detector::integrity::IntegrityEngine;
use detector::scanner::{ContentScanner, FindingsTable};
use detector::watchdog::ServiceWatchdog;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Main Hostwarden agent
pub struct Agent {
    config: Config,
    platform: Arc<dyn Platform>,
    findings: Arc<FindingsTable>,
    coordinator: Coordinator,
}

impl Agent {
    /// Create an agent backed by the host's own tools
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_platform(config, Arc::new(SystemPlatform::new()))
    }

    /// Create an agent on top of an explicit platform.
    ///
    /// Fails if any policy file cannot be loaded.
    pub fn with_platform(config: Config, platform: Arc<dyn Platform>) -> anyhow::Result<Self> {
        let store = ConfigStore::load(config.policy.clone(), config.integrity.default_mode)
            .context("Failed to load policy")?;

        let log = match EventLog::open(&config.daemon.event_log, config.alerts.clone()) {
            Ok(log) => log,
            Err(e) => {
                warn!(
                    "Cannot open event log {:?} ({}), keeping events in memory only",
                    config.daemon.event_log, e
                );
                EventLog::in_memory()
            }
        };

        let findings = Arc::new(FindingsTable::new());
        let engines = build_engines(&config, platform.clone(), findings.clone());

        let schedule = &config.schedule;
        let intervals = HashMap::from([
            (EngineKind::Integrity, Duration::from_secs(schedule.integrity_interval_secs)),
            (EngineKind::Watchdog, Duration::from_secs(schedule.watchdog_interval_secs)),
            (EngineKind::Scanner, Duration::from_secs(schedule.scanner_interval_secs)),
        ]);

        let coordinator = Coordinator::new(Arc::new(store), Arc::new(log), engines, intervals);

        Ok(Self {
            config,
            platform,
            findings,
            coordinator,
        })
    }

    /// Start every engine enabled in the schedule
    pub async fn start(&self) {
        for kind in EngineKind::ALL {
            if self.is_enabled(kind) {
                self.coordinator.start(kind).await;
            } else {
                info!("{} engine disabled", kind);
            }
        }
    }

    /// Stop all loops and wait for them to exit
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    fn is_enabled(&self, kind: EngineKind) -> bool {
        let schedule = &self.config.schedule;
        match kind {
            EngineKind::Integrity => schedule.integrity_enabled,
            EngineKind::Watchdog => schedule.watchdog_enabled,
            EngineKind::Scanner => schedule.scanner_enabled,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        self.coordinator.store()
    }

    pub fn log(&self) -> &Arc<EventLog> {
        self.coordinator.log()
    }

    pub fn findings(&self) -> &Arc<FindingsTable> {
        &self.findings
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Get current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn build_engines(
    config: &Config,
    platform: Arc<dyn Platform>,
    findings: Arc<FindingsTable>,
) -> Vec<Box<dyn Engine>> {
    vec![
        Box::new(IntegrityEngine::new(config.integrity.clone(), platform.clone())),
        Box::new(ServiceWatchdog::new(config.watchdog.clone(), platform)),
        Box::new(ContentScanner::new(config.scanner.clone(), findings)),
    ]
}
