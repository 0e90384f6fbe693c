//! File integrity engine
//!
//! Each monitored path is checked in one of two modes:
//!
//! - **hash**: every file under the path is hashed (SHA-256, streamed in
//!   fixed-size chunks) and reconciled against the baseline from the
//!   previous cycle. Files are classified as unchanged, modified, new or
//!   deleted.
//! - **immutable**: the immutable attribute is queried and re-applied when
//!   missing. An empty directory is reported instead of being locked.
//!
//! All baseline changes of a cycle are staged and committed at its end, so
//! a cycle abandoned at an await point leaves the baseline untouched.

use super::{failure_detail, Event, EventKind};
use crate::config::{compile_excludes, IntegrityConfig};
use crate::platform::Platform;
use crate::store::{write_atomic, IntegrityMode, Policy};
use globset::GlobSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// File integrity baseline database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineDatabase {
    /// Version for compatibility
    pub version: u32,
    /// When baseline was created
    pub created: chrono::DateTime<chrono::Utc>,
    /// When baseline was last updated
    pub updated: chrono::DateTime<chrono::Utc>,
    /// File entries
    pub entries: HashMap<PathBuf, FileEntry>,
}

/// Entry for a single file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// SHA-256 hash of content
    pub hash: String,
    /// File size in bytes
    pub size: u64,
}

impl BaselineDatabase {
    /// Create a new empty database
    pub fn new() -> Self {
        Self {
            version: 1,
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
            entries: HashMap::new(),
        }
    }

    /// Load database from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let db: BaselineDatabase = serde_json::from_str(&content)?;
        Ok(db)
    }

    /// Save database to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    /// Load if present, otherwise start empty
    fn open(path: &Path) -> Self {
        if !path.exists() {
            return Self::new();
        }
        match Self::load(path) {
            Ok(db) => {
                info!("Loaded baseline with {} files from {:?}", db.entries.len(), path);
                db
            }
            Err(e) => {
                warn!("Ignoring unreadable baseline {:?}: {}", path, e);
                Self::new()
            }
        }
    }
}

impl Default for BaselineDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Status of a file compared to baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Unchanged,
    Modified,
    New,
    Deleted,
}

/// Whether a monitored path is a file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathKind {
    File,
    Directory,
}

/// Per-path state kept between cycles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredPath {
    pub path: PathBuf,
    /// Unknown until the path has been seen on disk
    pub kind: Option<PathKind>,
    pub mode: IntegrityMode,
    pub last_seen_immutable: bool,
}

/// Integrity engine
pub struct IntegrityEngine {
    platform: Arc<dyn Platform>,
    config: IntegrityConfig,
    excludes: GlobSet,
    baseline: BaselineDatabase,
    paths: HashMap<PathBuf, MonitoredPath>,
}

/// Result of walking the hash-mode paths
#[derive(Debug, Default)]
struct Observation {
    files: HashMap<PathBuf, FileEntry>,
    unreadable: Vec<(PathBuf, String)>,
    missing: Vec<PathBuf>,
    kinds: HashMap<PathBuf, PathKind>,
}

impl Observation {
    /// Whether `path` is, or lies below, a path that could not be read
    fn shadows(&self, path: &Path) -> bool {
        self.unreadable.iter().any(|(blocked, _)| path.starts_with(blocked))
    }
}

impl IntegrityEngine {
    /// Create an engine, restoring a persisted baseline if configured
    pub fn new(config: IntegrityConfig, platform: Arc<dyn Platform>) -> Self {
        let baseline = match &config.database {
            Some(path) => BaselineDatabase::open(path),
            None => BaselineDatabase::new(),
        };

        Self {
            platform,
            excludes: compile_excludes(&config.exclude),
            config,
            baseline,
            paths: HashMap::new(),
        }
    }

    pub fn baseline(&self) -> &BaselineDatabase {
        &self.baseline
    }

    pub fn monitored(&self) -> impl Iterator<Item = &MonitoredPath> {
        self.paths.values()
    }

    /// Classify a file against the current baseline
    pub fn status_of(&self, path: &Path, current: Option<&FileEntry>) -> FileStatus {
        match (self.baseline.entries.get(path), current) {
            (None, Some(_)) => FileStatus::New,
            (Some(_), None) => FileStatus::Deleted,
            (Some(old), Some(new)) if old.hash != new.hash => FileStatus::Modified,
            _ => FileStatus::Unchanged,
        }
    }

    /// Record the current state of every hash-mode path without emitting
    /// `HashNew` for files that are not yet in the baseline.
    pub async fn prime(&mut self, policy: &Policy) -> usize {
        let roots = hash_roots(policy);
        let observation = self.observe(roots).await;
        let count = observation.files.len();

        for (path, entry) in observation.files {
            self.baseline.entries.insert(path, entry);
        }
        self.baseline.updated = chrono::Utc::now();
        self.save_baseline();

        info!("Baseline primed with {} files", count);
        count
    }

    /// Run one integrity cycle against `policy`
    pub async fn run_cycle(&mut self, policy: &Policy) -> Vec<Event> {
        let mut events = Vec::new();
        let mut next_paths: HashMap<PathBuf, MonitoredPath> = HashMap::new();

        // Paths the policy no longer lists
        for (path, state) in &self.paths {
            if policy.mode_of(path) != Some(state.mode) {
                if policy.mode_of(path).is_none() {
                    events.push(Event::for_path(
                        EventKind::PolicyRemoved,
                        path,
                        format!("no longer monitored ({} mode)", state.mode),
                    ));
                } else {
                    debug!("Mode of {:?} changed, resetting state", path);
                }
            }
        }

        // Hash mode
        let roots = hash_roots(policy);
        let observation = self.observe(roots.clone()).await;
        let staged = self.reconcile(&roots, &observation, &mut events);

        for rule in policy.paths.iter().filter(|r| r.mode == IntegrityMode::Hash) {
            let previous = self.paths.get(&rule.path).filter(|s| s.mode == rule.mode);
            next_paths.insert(
                rule.path.clone(),
                MonitoredPath {
                    path: rule.path.clone(),
                    kind: observation
                        .kinds
                        .get(&rule.path)
                        .copied()
                        .or_else(|| previous.and_then(|s| s.kind)),
                    mode: IntegrityMode::Hash,
                    last_seen_immutable: false,
                },
            );
        }

        // Immutability mode
        for rule in policy.paths.iter().filter(|r| r.mode == IntegrityMode::Immutable) {
            let previous = self.paths.get(&rule.path).filter(|s| s.mode == rule.mode).cloned();
            let mut state = previous.unwrap_or(MonitoredPath {
                path: rule.path.clone(),
                kind: None,
                mode: IntegrityMode::Immutable,
                last_seen_immutable: false,
            });
            self.enforce(&mut state, &mut events).await;
            next_paths.insert(rule.path.clone(), state);
        }

        // Commit
        let changed = staged != self.baseline.entries;
        self.baseline.entries = staged;
        self.paths = next_paths;
        if changed {
            self.baseline.updated = chrono::Utc::now();
            self.save_baseline();
        }

        events
    }

    /// Walk and hash every file under `roots` off the async runtime
    async fn observe(&self, roots: Vec<PathBuf>) -> Observation {
        if roots.is_empty() {
            return Observation::default();
        }

        let excludes = self.excludes.clone();
        let chunk_size = self.config.chunk_size.max(512);

        match tokio::task::spawn_blocking(move || walk_and_hash(&roots, &excludes, chunk_size)).await {
            Ok(observation) => observation,
            Err(e) => {
                error!("Hashing task failed: {}", e);
                Observation::default()
            }
        }
    }

    /// Three-way reconciliation of baseline against observed files.
    ///
    /// Returns the staged baseline; the caller commits it.
    fn reconcile(
        &self,
        roots: &[PathBuf],
        observation: &Observation,
        events: &mut Vec<Event>,
    ) -> HashMap<PathBuf, FileEntry> {
        let mut staged = HashMap::with_capacity(observation.files.len());

        for root in &observation.missing {
            events.push(Event::for_path(EventKind::PathMissing, root, "hash check skipped, path not found"));
        }

        for (path, entry) in &observation.files {
            match self.status_of(path, Some(entry)) {
                FileStatus::New => {
                    events.push(Event::for_path(
                        EventKind::HashNew,
                        path,
                        format!("sha256 {}", short(&entry.hash)),
                    ));
                }
                FileStatus::Modified => {
                    let old = &self.baseline.entries[path];
                    events.push(Event::for_path(
                        EventKind::HashModified,
                        path,
                        format!("sha256 {} -> {}", short(&old.hash), short(&entry.hash)),
                    ));
                }
                FileStatus::Unchanged | FileStatus::Deleted => {}
            }
            staged.insert(path.clone(), entry.clone());
        }

        // Anything at or below an unreadable path keeps its previous
        // baseline rather than turning into a deletion
        for (path, reason) in &observation.unreadable {
            events.push(Event::for_path(EventKind::ScanReadError, path, format!("hash failed: {}", reason)));
        }
        for (path, entry) in &self.baseline.entries {
            if !staged.contains_key(path) && observation.shadows(path) {
                staged.insert(path.clone(), entry.clone());
            }
        }

        for path in self.baseline.entries.keys() {
            let covered = roots.iter().any(|root| path.starts_with(root));
            if !covered || staged.contains_key(path) {
                continue;
            }
            if self.status_of(path, None) == FileStatus::Deleted {
                events.push(Event::for_path(EventKind::HashDeleted, path, "file removed from disk"));
            }
        }

        staged
    }

    /// Check and re-assert the immutable attribute on one path
    async fn enforce(&self, state: &mut MonitoredPath, events: &mut Vec<Event>) {
        let path = state.path.clone();

        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                events.push(Event::for_path(EventKind::PathMissing, &path, "immutability check skipped, path not found"));
                state.last_seen_immutable = false;
                return;
            }
            Err(e) => {
                events.push(Event::for_path(EventKind::ScanReadError, &path, format!("stat failed: {}", e)));
                return;
            }
        };

        if metadata.is_dir() {
            state.kind = Some(PathKind::Directory);
            match fs::read_dir(&path) {
                Ok(mut entries) => {
                    if entries.next().is_none() {
                        events.push(Event::for_path(
                            EventKind::EmptyPath,
                            &path,
                            "directory is empty, not enforcing immutability",
                        ));
                        return;
                    }
                }
                Err(e) => {
                    events.push(Event::for_path(EventKind::ScanReadError, &path, format!("list failed: {}", e)));
                    return;
                }
            }
        } else {
            state.kind = Some(PathKind::File);
        }

        match self.platform.query_immutable(&path).await {
            Ok(true) => {
                state.last_seen_immutable = true;
            }
            Ok(false) => {
                state.last_seen_immutable = false;
                events.push(Event::for_path(
                    EventKind::PathNotImmutable,
                    &path,
                    "immutable attribute missing, setting it",
                ));
                match self.platform.set_immutable(&path).await {
                    Ok(()) => state.last_seen_immutable = true,
                    Err(e) => events.push(Event::for_path(
                        EventKind::EnforcementFailed,
                        &path,
                        failure_detail("set immutable", &e),
                    )),
                }
            }
            Err(e) => {
                events.push(Event::for_path(
                    EventKind::EnforcementFailed,
                    &path,
                    failure_detail("query immutable", &e),
                ));
            }
        }
    }

    fn save_baseline(&self) {
        if let Some(path) = &self.config.database {
            if let Err(e) = self.baseline.save(path) {
                error!("Failed to save baseline to {:?}: {}", path, e);
            }
        }
    }
}

fn hash_roots(policy: &Policy) -> Vec<PathBuf> {
    policy
        .paths
        .iter()
        .filter(|r| r.mode == IntegrityMode::Hash)
        .map(|r| r.path.clone())
        .collect()
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn walk_and_hash(roots: &[PathBuf], excludes: &GlobSet, chunk_size: usize) -> Observation {
    let mut observation = Observation::default();

    for root in roots {
        match fs::metadata(root) {
            Ok(m) => {
                let kind = if m.is_dir() { PathKind::Directory } else { PathKind::File };
                observation.kinds.insert(root.clone(), kind);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                observation.missing.push(root.clone());
                continue;
            }
            Err(e) => {
                observation.unreadable.push((root.clone(), e.to_string()));
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
                    observation.unreadable.push((path, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() || observation.files.contains_key(entry.path()) {
                continue;
            }
            match hash_file(entry.path(), chunk_size) {
                Ok(file_entry) => {
                    observation.files.insert(entry.path().to_path_buf(), file_entry);
                }
                Err(e) => observation.unreadable.push((entry.path().to_path_buf(), e.to_string())),
            }
        }
    }

    observation
}

/// Hash a file in fixed-size chunks
pub fn hash_file(path: &Path, chunk_size: usize) -> std::io::Result<FileEntry> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut size = 0u64;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        size += bytes_read as u64;
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(FileEntry {
        hash: format!("{:x}", hasher.finalize()),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::taxonomy::Taxonomy;
    use crate::platform::testing::FakePlatform;
    use crate::store::PathRule;
    use tempfile::tempdir;

    fn policy(rules: Vec<(PathBuf, IntegrityMode)>) -> Policy {
        Policy {
            revision: 0,
            paths: rules.into_iter().map(|(path, mode)| PathRule { path, mode }).collect(),
            services: Vec::new(),
            taxonomy: Taxonomy::empty(),
            scan_dirs: Vec::new(),
        }
    }

    fn engine(platform: Arc<FakePlatform>, database: Option<PathBuf>) -> IntegrityEngine {
        let config = IntegrityConfig {
            database,
            ..IntegrityConfig::default()
        };
        IntegrityEngine::new(config, platform)
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn test_hash_lifecycle() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let policy = policy(vec![(dir.path().to_path_buf(), IntegrityMode::Hash)]);
        let mut engine = engine(Arc::new(FakePlatform::new()), None);

        assert!(engine.run_cycle(&policy).await.is_empty());

        fs::write(&file, "hello").unwrap();
        assert_eq!(kinds(&engine.run_cycle(&policy).await), vec![EventKind::HashNew]);

        // Untouched file stays quiet
        assert!(engine.run_cycle(&policy).await.is_empty());

        fs::write(&file, "hellp").unwrap();
        let events = engine.run_cycle(&policy).await;
        assert_eq!(kinds(&events), vec![EventKind::HashModified]);
        assert_eq!(events[0].subject, file.display().to_string());
        assert_eq!(engine.baseline().entries[&file].hash, hash_file(&file, 64).unwrap().hash);

        fs::remove_file(&file).unwrap();
        assert_eq!(kinds(&engine.run_cycle(&policy).await), vec![EventKind::HashDeleted]);
        assert!(engine.baseline().entries.is_empty());

        // Gone stays gone
        assert!(engine.run_cycle(&policy).await.is_empty());
    }

    #[tokio::test]
    async fn test_nested_files_and_excludes() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/cache")).unwrap();
        fs::write(dir.path().join("sub/x.conf"), "x").unwrap();
        fs::write(dir.path().join("sub/cache/tmp.bin"), "y").unwrap();

        let config = IntegrityConfig {
            database: None,
            exclude: vec!["**/cache".to_string()],
            ..IntegrityConfig::default()
        };
        let mut engine = IntegrityEngine::new(config, Arc::new(FakePlatform::new()));
        let policy = policy(vec![(dir.path().to_path_buf(), IntegrityMode::Hash)]);

        let events = engine.run_cycle(&policy).await;
        assert_eq!(kinds(&events), vec![EventKind::HashNew]);
        assert!(events[0].subject.ends_with("x.conf"));
    }

    #[tokio::test]
    async fn test_missing_file_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("watched.txt");
        fs::write(&file, "v1").unwrap();
        let policy = policy(vec![(file.clone(), IntegrityMode::Hash)]);
        let mut engine = engine(Arc::new(FakePlatform::new()), None);

        assert_eq!(kinds(&engine.run_cycle(&policy).await), vec![EventKind::HashNew]);

        fs::remove_file(&file).unwrap();
        let events = kinds(&engine.run_cycle(&policy).await);
        assert_eq!(events.iter().filter(|k| **k == EventKind::HashDeleted).count(), 1);
        assert!(events.contains(&EventKind::PathMissing));

        // Still monitored, reappears as new
        fs::write(&file, "v2").unwrap();
        assert_eq!(kinds(&engine.run_cycle(&policy).await), vec![EventKind::HashNew]);
        assert_eq!(engine.monitored().count(), 1);
    }

    #[tokio::test]
    async fn test_policy_removal_is_distinct() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), "a").unwrap();
        let mut engine = engine(Arc::new(FakePlatform::new()), None);

        engine
            .run_cycle(&policy(vec![(dir.path().to_path_buf(), IntegrityMode::Hash)]))
            .await;
        let events = engine.run_cycle(&policy(vec![])).await;

        assert_eq!(kinds(&events), vec![EventKind::PolicyRemoved]);
        assert!(engine.baseline().entries.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_baseline_survives_restart() {
        let dir = tempdir().unwrap();
        let watched = dir.path().join("watched");
        fs::create_dir(&watched).unwrap();
        fs::write(watched.join("a"), "a").unwrap();
        let db = dir.path().join("state/baseline.json");
        let policy = policy(vec![(watched.clone(), IntegrityMode::Hash)]);

        let platform = Arc::new(FakePlatform::new());
        let mut first = engine(platform.clone(), Some(db.clone()));
        assert_eq!(first.run_cycle(&policy).await.len(), 1);
        assert!(db.exists());

        let mut second = engine(platform, Some(db));
        assert!(second.run_cycle(&policy).await.is_empty());
    }

    #[tokio::test]
    async fn test_prime_is_silent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), "a").unwrap();
        let policy = policy(vec![(dir.path().to_path_buf(), IntegrityMode::Hash)]);
        let mut engine = engine(Arc::new(FakePlatform::new()), None);

        assert_eq!(engine.prime(&policy).await, 1);
        assert!(engine.run_cycle(&policy).await.is_empty());
    }

    #[tokio::test]
    async fn test_immutability_enforcement_idempotent() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("passwd");
        fs::write(&file, "root:x:0:0").unwrap();
        let platform = Arc::new(FakePlatform::new());
        let mut engine = engine(platform.clone(), None);
        let policy = policy(vec![(file.clone(), IntegrityMode::Immutable)]);

        assert_eq!(kinds(&engine.run_cycle(&policy).await), vec![EventKind::PathNotImmutable]);
        assert!(platform.immutable.lock().unwrap().contains(&file));

        assert!(engine.run_cycle(&policy).await.is_empty());
        assert_eq!(platform.set_calls.lock().unwrap().len(), 1);
        let state = engine.monitored().next().unwrap();
        assert!(state.last_seen_immutable);
        assert_eq!(state.kind, Some(PathKind::File));
    }

    #[tokio::test]
    async fn test_empty_directory_not_locked() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let platform = Arc::new(FakePlatform::new());
        let mut engine = engine(platform.clone(), None);

        let events = engine
            .run_cycle(&policy(vec![(empty, IntegrityMode::Immutable)]))
            .await;

        assert_eq!(kinds(&events), vec![EventKind::EmptyPath]);
        assert!(platform.set_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enforcement_failure_does_not_blind_others() {
        let dir = tempdir().unwrap();
        let locked = dir.path().join("locked");
        let other = dir.path().join("other");
        let missing = dir.path().join("missing");
        fs::write(&locked, "a").unwrap();
        fs::write(&other, "b").unwrap();

        let platform = Arc::new(FakePlatform::new());
        platform.deny_set.lock().unwrap().insert(locked.clone());
        let mut engine = engine(platform.clone(), None);

        let events = engine
            .run_cycle(&policy(vec![
                (missing, IntegrityMode::Immutable),
                (locked.clone(), IntegrityMode::Immutable),
                (other.clone(), IntegrityMode::Immutable),
            ]))
            .await;

        assert_eq!(
            kinds(&events),
            vec![
                EventKind::PathMissing,
                EventKind::PathNotImmutable,
                EventKind::EnforcementFailed,
                EventKind::PathNotImmutable,
            ]
        );
        assert!(events[2].detail.contains("insufficient privilege"));
        assert!(platform.immutable.lock().unwrap().contains(&other));
        assert!(!platform.immutable.lock().unwrap().contains(&locked));
    }

    fn entry(hash: &str) -> FileEntry {
        FileEntry {
            hash: hash.to_string(),
            size: 1,
        }
    }

    #[test]
    fn test_unreadable_paths_keep_their_baseline() {
        let root = PathBuf::from("/srv/app");
        let mut engine = engine(Arc::new(FakePlatform::new()), None);
        for (name, hash) in [("sub/a.conf", "aa"), ("sub/b.conf", "bb"), ("c.conf", "cc"), ("d.conf", "dd")] {
            engine.baseline.entries.insert(root.join(name), entry(hash));
        }

        // `sub` could not be listed and `c.conf` could not be read; `d.conf` is gone
        let observation = Observation {
            unreadable: vec![
                (root.join("sub"), "Permission denied".to_string()),
                (root.join("c.conf"), "Permission denied".to_string()),
            ],
            ..Observation::default()
        };

        let mut events = Vec::new();
        let staged = engine.reconcile(&[root.clone()], &observation, &mut events);

        assert_eq!(
            kinds(&events),
            vec![EventKind::ScanReadError, EventKind::ScanReadError, EventKind::HashDeleted]
        );
        assert_eq!(events[2].subject, root.join("d.conf").display().to_string());
        assert_eq!(staged.len(), 3);
        assert_eq!(staged[&root.join("sub/a.conf")].hash, "aa");
        assert_eq!(staged[&root.join("c.conf")].hash, "cc");
    }

    #[tokio::test]
    async fn test_unreadable_root_is_not_deleted() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, "x").unwrap();
        // A path through a regular file fails with ENOTDIR, even for root
        let root = file.join("conf.d");
        let tracked = root.join("site.conf");

        let mut engine = engine(Arc::new(FakePlatform::new()), None);
        engine.baseline.entries.insert(tracked.clone(), entry("aa"));

        let events = engine.run_cycle(&policy(vec![(root.clone(), IntegrityMode::Hash)])).await;
        assert_eq!(kinds(&events), vec![EventKind::ScanReadError]);
        assert_eq!(events[0].subject, root.display().to_string());
        assert_eq!(engine.baseline().entries[&tracked].hash, "aa");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_locked_subdirectory_recovers_without_new_events() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("a.conf"), "a").unwrap();
        fs::write(sub.join("b.conf"), "b").unwrap();
        let policy = policy(vec![(dir.path().to_path_buf(), IntegrityMode::Hash)]);
        let mut engine = engine(Arc::new(FakePlatform::new()), None);

        let first = engine.run_cycle(&policy).await;
        assert_eq!(kinds(&first), vec![EventKind::HashNew, EventKind::HashNew]);

        fs::set_permissions(&sub, fs::Permissions::from_mode(0o000)).unwrap();
        let second = engine.run_cycle(&policy).await;
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();

        // Root still lists the directory, in which case the cycle is simply quiet
        assert!(second.iter().all(|e| e.kind == EventKind::ScanReadError));
        assert_eq!(engine.baseline().entries.len(), 2);

        assert!(engine.run_cycle(&policy).await.is_empty());
    }
}
