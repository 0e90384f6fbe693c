//! Malicious pattern content scanner
//!
//! Walks every configured scan root, reads each regular file as lossy UTF-8
//! and reports the taxonomy rules that occur in it as whole words.

use super::taxonomy::Taxonomy;
use super::{Event, EventKind, Finding};
use crate::config::{compile_excludes, ScannerConfig};
use crate::store::Policy;
use chrono::Utc;
use globset::GlobSet;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};
use walkdir::WalkDir;

type FindingKey = (PathBuf, String, String);

/// Findings accumulated across scan passes, one per `(file, category, keyword)`
#[derive(Debug, Default)]
pub struct FindingsTable {
    entries: RwLock<BTreeMap<FindingKey, Finding>>,
}

impl FindingsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert findings, returning those not already present
    pub fn merge(&self, findings: Vec<Finding>) -> Vec<Finding> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = Vec::new();

        for finding in findings {
            let key = finding.key();
            if !entries.contains_key(&key) {
                entries.insert(key, finding.clone());
                added.push(finding);
            }
        }

        added
    }

    /// All findings ordered by file, category, keyword
    pub fn list(&self) -> Vec<Finding> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Outcome of a single scan pass
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Deduplicated findings of this pass
    pub findings: Vec<Finding>,
    /// Read errors and missing roots
    pub events: Vec<Event>,
    pub files_scanned: usize,
}

/// Content scanner engine
pub struct ContentScanner {
    config: ScannerConfig,
    excludes: GlobSet,
    findings: Arc<FindingsTable>,
}

impl ContentScanner {
    pub fn new(config: ScannerConfig, findings: Arc<FindingsTable>) -> Self {
        Self {
            excludes: compile_excludes(&config.exclude),
            config,
            findings,
        }
    }

    pub fn findings(&self) -> &Arc<FindingsTable> {
        &self.findings
    }

    /// Scan every root once, off the async runtime
    pub async fn scan(&self, policy: &Policy) -> ScanReport {
        if policy.scan_dirs.is_empty() || policy.taxonomy.is_empty() {
            return ScanReport::default();
        }

        let roots = policy.scan_dirs.clone();
        let taxonomy = policy.taxonomy.clone();
        let excludes = self.excludes.clone();
        let max_size = self.config.max_file_size;

        match tokio::task::spawn_blocking(move || scan_roots(&roots, &taxonomy, &excludes, max_size)).await {
            Ok(report) => report,
            Err(e) => {
                error!("Scan task failed: {}", e);
                ScanReport::default()
            }
        }
    }

    /// Run one scan pass and record its findings.
    ///
    /// A `MaliciousKeywordFound` event is produced only for findings that are
    /// new to the findings table.
    pub async fn run_cycle(&mut self, policy: &Policy) -> Vec<Event> {
        let report = self.scan(policy).await;
        debug!(
            "Scanned {} files, {} findings",
            report.files_scanned,
            report.findings.len()
        );

        let mut events = report.events;
        for finding in self.findings.merge(report.findings) {
            events.push(Event::for_path(
                EventKind::MaliciousKeywordFound,
                &finding.file,
                format!("keyword '{}' ({})", finding.keyword, finding.category),
            ));
        }
        events
    }
}

fn scan_roots(roots: &[PathBuf], taxonomy: &Taxonomy, excludes: &GlobSet, max_size: u64) -> ScanReport {
    let mut report = ScanReport::default();
    let mut seen: BTreeSet<FindingKey> = BTreeSet::new();

    for root in roots {
        match fs::metadata(root) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report
                    .events
                    .push(Event::for_path(EventKind::PathMissing, root, "scan root not found"));
                continue;
            }
            Err(e) => {
                report
                    .events
                    .push(Event::for_path(EventKind::ScanReadError, root, format!("stat failed: {}", e)));
                continue;
            }
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !excludes.is_match(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    report
                        .events
                        .push(Event::for_path(EventKind::ScanReadError, &path, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            match entry.metadata() {
                Ok(m) if m.len() > max_size => {
                    debug!("Skipping {:?}: {} bytes exceeds scan limit", path, m.len());
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    report
                        .events
                        .push(Event::for_path(EventKind::ScanReadError, path, e.to_string()));
                    continue;
                }
            }

            match scan_file(path, taxonomy) {
                Ok(findings) => {
                    report.files_scanned += 1;
                    for finding in findings {
                        if seen.insert(finding.key()) {
                            report.findings.push(finding);
                        }
                    }
                }
                Err(e) => report
                    .events
                    .push(Event::for_path(EventKind::ScanReadError, path, e.to_string())),
            }
        }
    }

    report
}

/// Match one file against the taxonomy
pub fn scan_file(path: &Path, taxonomy: &Taxonomy) -> std::io::Result<Vec<Finding>> {
    let bytes = fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let timestamp = Utc::now();

    Ok(taxonomy
        .matches(&content)
        .map(|rule| Finding {
            file: path.to_path_buf(),
            category: rule.category.clone(),
            keyword: rule.keyword.clone(),
            timestamp,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn policy(dirs: Vec<PathBuf>) -> Policy {
        let taxonomy = Taxonomy::new(vec![
            ("php".to_string(), vec!["exec".to_string(), "system".to_string()]),
            ("encoded".to_string(), vec!["base64_decode".to_string()]),
        ])
        .unwrap();

        Policy {
            revision: 0,
            paths: Vec::new(),
            services: Vec::new(),
            taxonomy,
            scan_dirs: dirs,
        }
    }

    fn scanner() -> ContentScanner {
        ContentScanner::new(ScannerConfig::default(), Arc::new(FindingsTable::new()))
    }

    fn keys(findings: &[Finding]) -> Vec<(String, String)> {
        let mut keys: Vec<_> = findings
            .iter()
            .map(|f| (f.category.clone(), f.keyword.clone()))
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_whole_word_boundary() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("job.php"), "$db->execute($sql);").unwrap();

        let report = scanner().scan(&policy(vec![dir.path().to_path_buf()])).await;
        assert!(report.findings.is_empty());
        assert_eq!(report.files_scanned, 1);
    }

    #[tokio::test]
    async fn test_one_finding_per_triple() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("uploads")).unwrap();
        fs::write(
            dir.path().join("uploads/shell.php"),
            "<?php exec($_GET['c']); exec('id'); system(base64_decode($p)); ?>",
        )
        .unwrap();

        let report = scanner().scan(&policy(vec![dir.path().to_path_buf()])).await;
        assert_eq!(
            keys(&report.findings),
            vec![
                ("encoded".to_string(), "base64_decode".to_string()),
                ("php".to_string(), "exec".to_string()),
                ("php".to_string(), "system".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.php"), "exec('id');").unwrap();
        let policy = policy(vec![dir.path().to_path_buf()]);
        let mut scanner = scanner();

        let first = scanner.run_cycle(&policy).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, EventKind::MaliciousKeywordFound);

        let second = scanner.run_cycle(&policy).await;
        assert!(second.is_empty());
        assert_eq!(scanner.findings().len(), 1);

        let rescan = scanner.scan(&policy).await;
        assert_eq!(keys(&rescan.findings), keys(&scanner.findings().list()));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_tolerated() {
        let dir = tempdir().unwrap();
        let mut bytes = vec![0xff, 0xfe, 0x00];
        bytes.extend_from_slice(b" system(\"reboot\")");
        fs::write(dir.path().join("blob.bin"), bytes).unwrap();

        let report = scanner().scan(&policy(vec![dir.path().to_path_buf()])).await;
        assert_eq!(keys(&report.findings), vec![("php".to_string(), "system".to_string())]);
        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_and_single_file_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("x.py");
        fs::write(&file, "exec(code)").unwrap();

        let report = scanner()
            .scan(&policy(vec![dir.path().join("gone"), file.clone()]))
            .await;

        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].kind, EventKind::PathMissing);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].file, file);
    }

    #[tokio::test]
    async fn test_size_limit_and_excludes() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/hook"), "exec").unwrap();
        fs::write(dir.path().join("big.txt"), format!("exec {}", "x".repeat(64))).unwrap();

        let config = ScannerConfig {
            max_file_size: 32,
            ..ScannerConfig::default()
        };
        let scanner = ContentScanner::new(config, Arc::new(FindingsTable::new()));
        let report = scanner.scan(&policy(vec![dir.path().to_path_buf()])).await;

        assert!(report.findings.is_empty());
        assert_eq!(report.files_scanned, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_file_does_not_abort() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let locked = dir.path().join("locked.php");
        fs::write(&locked, "exec").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        fs::write(dir.path().join("open.php"), "system").unwrap();

        let readable = fs::read(&locked).is_ok();
        let report = scanner().scan(&policy(vec![dir.path().to_path_buf()])).await;

        if readable {
            // Running as root
            assert!(report.events.is_empty());
            assert_eq!(report.files_scanned, 2);
        } else {
            assert_eq!(report.events.len(), 1);
            assert_eq!(report.events[0].kind, EventKind::ScanReadError);
            assert_eq!(report.events[0].subject, locked.display().to_string());
            assert_eq!(keys(&report.findings), vec![("php".to_string(), "system".to_string())]);
        }
    }

    #[tokio::test]
    async fn test_unreachable_root_is_a_read_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, "x").unwrap();
        fs::write(dir.path().join("open.php"), "system").unwrap();
        // Stat through a regular file fails with ENOTDIR, even for root
        let unreachable = file.join("www");

        let report = scanner()
            .scan(&policy(vec![unreachable.clone(), dir.path().join("open.php")]))
            .await;

        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].kind, EventKind::ScanReadError);
        assert_eq!(report.events[0].subject, unreachable.display().to_string());
        assert_eq!(keys(&report.findings), vec![("php".to_string(), "system".to_string())]);
    }

    #[test]
    fn test_scan_file_reports_read_failure() {
        let dir = tempdir().unwrap();
        let taxonomy = policy(Vec::new()).taxonomy;

        assert!(scan_file(dir.path(), &taxonomy).is_err());
        assert!(scan_file(&dir.path().join("absent.php"), &taxonomy).is_err());
    }
}
