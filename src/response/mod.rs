//! Event log and escalation
//!
//! Every engine routes its events through one shared [`EventLog`]. Lines are
//! appended atomically (one `write_all` per event under a lock) so output
//! from concurrent loops never interleaves. Events of escalating kinds are
//! additionally pushed through the configured alert channels.

mod alert;

pub use alert::send_alert;

use crate::config::AlertConfig;
use crate::detector::{Event, Severity};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{error, info, warn};

/// Number of events kept in memory for status queries
const RECENT_CAPACITY: usize = 256;

/// Append-only security event sink
pub struct EventLog {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
    recent: Mutex<VecDeque<Event>>,
    alerts: AlertConfig,
}

impl EventLog {
    /// Open (or create) an append-only event log file
    pub fn open(path: &Path, alerts: AlertConfig) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(Mutex::new(file)),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            alerts,
        })
    }

    /// A sink that only mirrors to tracing and memory
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            alerts: AlertConfig::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one event
    pub fn record(&self, event: &Event) {
        match event.severity() {
            Severity::Info => info!("{}: {} ({})", event.kind, event.subject, event.detail),
            Severity::Warning => warn!("{}: {} ({})", event.kind, event.subject, event.detail),
            Severity::Critical => error!("{}: {} ({})", event.kind, event.subject, event.detail),
        }

        if let Some(file) = &self.file {
            let mut line = event.to_string().replace(['\n', '\r'], " ");
            line.push('\n');

            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = file.write_all(line.as_bytes()) {
                error!("Failed to append to event log {:?}: {}", self.path, e);
            }
        }

        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if event.kind.escalates() && self.alerts.any_enabled() {
            let event = event.clone();
            let alerts = self.alerts.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = send_alert(&event, &alerts).await {
                            warn!("Failed to deliver alert: {}", e);
                        }
                    });
                }
                Err(_) => warn!("No runtime available, alert for {} not delivered", event.subject),
            }
        }
    }

    /// Record a batch of events in order
    pub fn record_all(&self, events: &[Event]) {
        for event in events {
            self.record(event);
        }
    }

    /// Most recent events, oldest first
    pub fn recent(&self) -> Vec<Event> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
