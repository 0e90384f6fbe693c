//! Detection engines and the events they emit

pub mod integrity;
pub mod scanner;
pub mod taxonomy;
pub mod watchdog;

use crate::error::PlatformError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Severity classification of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Routine state change
    Info,
    /// Something drifted or failed for a single item
    Warning,
    /// Needs a human
    Critical,
}

/// Kind of event emitted to the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Immutable attribute was missing (and re-asserted if possible)
    PathNotImmutable,
    /// Monitored path does not exist on disk
    PathMissing,
    /// Monitored directory has no entries
    EmptyPath,
    /// Setting or querying the immutable attribute failed
    EnforcementFailed,
    /// Content hash differs from baseline
    HashModified,
    /// File not present in baseline
    HashNew,
    /// Baseline file no longer present
    HashDeleted,
    /// Path was dropped from the policy
    PolicyRemoved,
    ServiceDown,
    ServiceRestarted,
    RestartFailed,
    /// Restart cap exceeded, auto-restart suspended
    ServiceFlapping,
    MaliciousKeywordFound,
    /// A file could not be read
    ScanReadError,
    ConfigUpdated,
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::HashNew
            | EventKind::PolicyRemoved
            | EventKind::ServiceRestarted
            | EventKind::ConfigUpdated => Severity::Info,
            EventKind::PathNotImmutable
            | EventKind::PathMissing
            | EventKind::EmptyPath
            | EventKind::HashDeleted
            | EventKind::ServiceDown
            | EventKind::RestartFailed
            | EventKind::ScanReadError => Severity::Warning,
            EventKind::EnforcementFailed
            | EventKind::HashModified
            | EventKind::ServiceFlapping
            | EventKind::MaliciousKeywordFound => Severity::Critical,
        }
    }

    /// Whether the event is pushed through the alert channels
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            EventKind::ServiceFlapping
                | EventKind::MaliciousKeywordFound
                | EventKind::EnforcementFailed
                | EventKind::HashModified
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Event detail for a failed platform primitive, calling out privilege
/// restrictions separately from other failures
pub(crate) fn failure_detail(action: &str, error: &PlatformError) -> String {
    if error.is_denied() {
        format!("{} denied, insufficient privilege: {}", action, error)
    } else {
        format!("{} failed: {}", action, error)
    }
}

/// A timestamped event naming the affected path, service or file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Path, file or service the event is about
    pub subject: String,
    /// Action attempted / what was observed
    pub detail: String,
}

impl Event {
    pub fn new(kind: EventKind, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn for_path(kind: EventKind, path: &std::path::Path, detail: impl Into<String>) -> Self {
        Self::new(kind, path.display().to_string(), detail)
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}",
            self.timestamp.to_rfc3339(),
            self.kind,
            self.subject,
            self.detail
        )
    }
}

/// A malicious keyword occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub file: PathBuf,
    pub category: String,
    pub keyword: String,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    /// Deduplication key
    pub fn key(&self) -> (PathBuf, String, String) {
        (self.file.clone(), self.category.clone(), self.keyword.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_detail_separates_privilege() {
        let denied = PlatformError::Denied {
            action: "chattr +i",
            target: "/etc/passwd".to_string(),
            message: "Operation not permitted".to_string(),
        };
        let failed = PlatformError::Failed {
            action: "systemctl restart",
            target: "nginx".to_string(),
            message: "Job failed".to_string(),
        };
        let io = PlatformError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));

        assert!(failure_detail("set immutable", &denied).contains("insufficient privilege"));
        assert!(failure_detail("restart", &io).contains("insufficient privilege"));
        assert!(failure_detail("restart", &failed).starts_with("restart failed"));
    }

    #[test]
    fn test_event_line_format() {
        let event = Event::new(EventKind::HashModified, "/etc/hosts", "sha256 changed");
        let line = event.to_string();

        assert!(line.ends_with(" HashModified /etc/hosts: sha256 changed"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_escalation() {
        assert!(EventKind::ServiceFlapping.escalates());
        assert!(!EventKind::HashNew.escalates());
        assert_eq!(EventKind::MaliciousKeywordFound.severity(), Severity::Critical);
    }
}
