//! Policy store: monitored paths, services, patterns and scan directories
//!
//! The store is the single owner of the policy lists. Engines take an
//! `Arc<Policy>` snapshot at the start of a cycle and never see a partially
//! applied edit: an edit is applied to a private copy, written to disk, and
//! only then swapped in.

use crate::config::PolicyFiles;
use crate::detector::taxonomy::{parse_category_line, Taxonomy};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// How a monitored path is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    /// Hash every file and diff against the previous cycle
    Hash,
    /// Keep the immutable attribute set
    #[default]
    Immutable,
}

impl FromStr for IntegrityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hash" | "hashdiff" => Ok(IntegrityMode::Hash),
            "immutable" | "immutability" => Ok(IntegrityMode::Immutable),
            other => Err(format!("unknown integrity mode {:?}", other)),
        }
    }
}

impl fmt::Display for IntegrityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityMode::Hash => f.write_str("hash"),
            IntegrityMode::Immutable => f.write_str("immutable"),
        }
    }
}

/// A monitored path entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub path: PathBuf,
    pub mode: IntegrityMode,
}

impl fmt::Display for PathRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.path.display(), self.mode)
    }
}

/// Editable policy sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Section {
    Paths,
    Services,
    Patterns,
    ScanDirs,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Paths,
        Section::Services,
        Section::Patterns,
        Section::ScanDirs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Paths => "paths",
            Section::Services => "services",
            Section::Patterns => "patterns",
            Section::ScanDirs => "scan-dirs",
        }
    }
}

impl FromStr for Section {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paths" => Ok(Section::Paths),
            "services" => Ok(Section::Services),
            "patterns" => Ok(Section::Patterns),
            "scan-dirs" | "scan_dirs" | "dirs" => Ok(Section::ScanDirs),
            other => Err(ConfigError::SectionNotFound(other.to_string())),
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete policy at one revision
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Incremented by every successful edit or reload
    pub revision: u64,
    pub paths: Vec<PathRule>,
    pub services: Vec<String>,
    pub taxonomy: Taxonomy,
    pub scan_dirs: Vec<PathBuf>,
}

impl Policy {
    /// Entries of a section in their line form
    pub fn lines(&self, section: Section) -> Vec<String> {
        match section {
            Section::Paths => self.paths.iter().map(ToString::to_string).collect(),
            Section::Services => self.services.clone(),
            Section::Patterns => self.taxonomy.to_lines(),
            Section::ScanDirs => self.scan_dirs.iter().map(|p| p.display().to_string()).collect(),
        }
    }

    /// Look up the mode configured for a path
    pub fn mode_of(&self, path: &Path) -> Option<IntegrityMode> {
        self.paths.iter().find(|r| r.path == path).map(|r| r.mode)
    }
}

/// A single policy edit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigEdit {
    /// Replace a whole section with new lines
    Replace { section: Section, lines: Vec<String> },
    /// Replace (or add) one pattern category
    ReplaceCategory { category: String, keywords: Vec<String> },
    /// Remove one pattern category
    RemoveCategory { category: String },
    /// Append an entry
    Add { section: Section, line: String },
    /// Overwrite the entry at a 0-based position
    Set {
        section: Section,
        index: usize,
        line: String,
    },
    /// Remove the entry at a 0-based position
    Remove { section: Section, index: usize },
}

impl ConfigEdit {
    /// Section touched by this edit
    pub fn section(&self) -> Section {
        match self {
            ConfigEdit::Replace { section, .. }
            | ConfigEdit::Add { section, .. }
            | ConfigEdit::Set { section, .. }
            | ConfigEdit::Remove { section, .. } => *section,
            ConfigEdit::ReplaceCategory { .. } | ConfigEdit::RemoveCategory { .. } => Section::Patterns,
        }
    }
}

/// Owner of the canonical policy
pub struct ConfigStore {
    files: PolicyFiles,
    default_mode: IntegrityMode,
    current: RwLock<Arc<Policy>>,
    /// Serializes edit + persist transactions
    writer: Mutex<()>,
}

impl ConfigStore {
    /// Load every policy file. Any missing file is fatal.
    pub fn load(files: PolicyFiles, default_mode: IntegrityMode) -> Result<Self, ConfigError> {
        let policy = Policy {
            revision: 0,
            paths: read_paths(&files.paths, default_mode)?,
            services: read_services(&files.services)?,
            taxonomy: read_taxonomy(&files.patterns)?,
            scan_dirs: read_scan_dirs(&files.scan_dirs)?,
        };

        info!(
            "Loaded policy: {} paths, {} services, {} pattern rules, {} scan directories",
            policy.paths.len(),
            policy.services.len(),
            policy.taxonomy.rules().len(),
            policy.scan_dirs.len()
        );

        Ok(Self {
            files,
            default_mode,
            current: RwLock::new(Arc::new(policy)),
            writer: Mutex::new(()),
        })
    }

    /// Immutable view of the current policy
    pub fn snapshot(&self) -> Arc<Policy> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply an edit and persist the affected section.
    ///
    /// Readers see either the previous or the new policy. If writing the
    /// file fails, the in-memory policy is left unchanged.
    pub fn apply_edit(&self, edit: &ConfigEdit) -> Result<Arc<Policy>, ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = (*self.snapshot()).clone();
        self.edit_policy(&mut next, edit)?;
        next.revision += 1;

        let section = edit.section();
        self.write_section(&next, section)?;

        let next = Arc::new(next);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();

        info!("Policy section {} updated (revision {})", section, next.revision);
        Ok(next)
    }

    /// Write every section of `policy` to disk
    pub fn persist(&self, policy: &Policy) -> Result<(), ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for section in Section::ALL {
            self.write_section(policy, section)?;
        }
        Ok(())
    }

    /// Re-read one section from disk, e.g. after an external edit
    pub fn reload(&self, section: Section) -> Result<Arc<Policy>, ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = (*self.snapshot()).clone();
        match section {
            Section::Paths => next.paths = read_paths(&self.files.paths, self.default_mode)?,
            Section::Services => next.services = read_services(&self.files.services)?,
            Section::Patterns => next.taxonomy = read_taxonomy(&self.files.patterns)?,
            Section::ScanDirs => next.scan_dirs = read_scan_dirs(&self.files.scan_dirs)?,
        }
        next.revision += 1;

        let next = Arc::new(next);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();

        debug!("Reloaded policy section {}", section);
        Ok(next)
    }

    /// File backing a section
    pub fn file_for(&self, section: Section) -> &Path {
        match section {
            Section::Paths => &self.files.paths,
            Section::Services => &self.files.services,
            Section::Patterns => &self.files.patterns,
            Section::ScanDirs => &self.files.scan_dirs,
        }
    }

    fn edit_policy(&self, policy: &mut Policy, edit: &ConfigEdit) -> Result<(), ConfigError> {
        let section = edit.section();
        let file = self.file_for(section).to_path_buf();

        match edit {
            ConfigEdit::ReplaceCategory { category, keywords } => {
                policy.taxonomy = policy
                    .taxonomy
                    .with_category(category, keywords.clone())
                    .map_err(|e| malformed(&file, 0, e.to_string()))?;
                return Ok(());
            }
            ConfigEdit::RemoveCategory { category } => {
                policy.taxonomy = policy
                    .taxonomy
                    .without_category(category)
                    .ok_or_else(|| ConfigError::SectionNotFound(format!("patterns/{}", category)))?;
                return Ok(());
            }
            _ => {}
        }

        let mut lines = policy.lines(section);
        match edit {
            ConfigEdit::Replace { lines: new, .. } => lines = new.clone(),
            ConfigEdit::Add { line, .. } => lines.push(line.clone()),
            ConfigEdit::Set { index, line, .. } => {
                let len = lines.len();
                let slot = lines.get_mut(*index).ok_or_else(|| out_of_range(section, *index, len))?;
                *slot = line.clone();
            }
            ConfigEdit::Remove { index, .. } => {
                if *index >= lines.len() {
                    return Err(out_of_range(section, *index, lines.len()));
                }
                lines.remove(*index);
            }
            ConfigEdit::ReplaceCategory { .. } | ConfigEdit::RemoveCategory { .. } => unreachable!(),
        }

        set_lines(policy, section, &lines, &file, self.default_mode)
    }

    fn write_section(&self, policy: &Policy, section: Section) -> Result<(), ConfigError> {
        let path = self.file_for(section);
        let contents = match section {
            Section::Patterns => policy.taxonomy.render(path)?,
            _ => {
                let mut out = String::new();
                for line in policy.lines(section) {
                    out.push_str(&line);
                    out.push('\n');
                }
                out
            }
        };
        write_atomic(path, contents.as_bytes())?;
        Ok(())
    }
}

/// Write to a sibling temp file and rename over the target
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}

fn set_lines(
    policy: &mut Policy,
    section: Section,
    lines: &[String],
    file: &Path,
    default_mode: IntegrityMode,
) -> Result<(), ConfigError> {
    match section {
        Section::Paths => {
            policy.paths = lines
                .iter()
                .enumerate()
                .map(|(i, l)| parse_path_line(l, default_mode).map_err(|m| malformed(file, i + 1, m)))
                .collect::<Result<_, _>>()?;
        }
        Section::Services => {
            policy.services = lines
                .iter()
                .enumerate()
                .map(|(i, l)| parse_service_line(l).map_err(|m| malformed(file, i + 1, m)))
                .collect::<Result<_, _>>()?;
        }
        Section::ScanDirs => {
            policy.scan_dirs = lines
                .iter()
                .enumerate()
                .map(|(i, l)| parse_dir_line(l).map_err(|m| malformed(file, i + 1, m)))
                .collect::<Result<_, _>>()?;
        }
        Section::Patterns => {
            let categories = lines
                .iter()
                .enumerate()
                .map(|(i, l)| parse_category_line(l.trim()).map_err(|m| malformed(file, i + 1, m)))
                .collect::<Result<Vec<_>, _>>()?;
            policy.taxonomy = Taxonomy::new(categories).map_err(|e| malformed(file, 0, e.to_string()))?;
        }
    }
    Ok(())
}

fn malformed(path: &Path, line: usize, message: String) -> ConfigError {
    ConfigError::Malformed {
        path: path.to_path_buf(),
        line,
        message,
    }
}

fn out_of_range(section: Section, index: usize, len: usize) -> ConfigError {
    ConfigError::EntryOutOfRange {
        section: section.to_string(),
        index,
        len,
    }
}

/// `<absolute path> [hash|immutable]`
fn parse_path_line(line: &str, default_mode: IntegrityMode) -> Result<PathRule, String> {
    let line = line.trim();
    let (path, mode) = match line.rsplit_once(char::is_whitespace) {
        Some((path, marker)) => match marker.parse::<IntegrityMode>() {
            Ok(mode) => (path.trim_end(), mode),
            Err(_) => (line, default_mode),
        },
        None => (line, default_mode),
    };

    let path = PathBuf::from(path);
    if !path.is_absolute() {
        return Err(format!("path {:?} is not absolute", path));
    }

    Ok(PathRule { path, mode })
}

fn parse_service_line(line: &str) -> Result<String, String> {
    let name = line.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid service name {:?}", line));
    }
    Ok(name.to_string())
}

fn parse_dir_line(line: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(line.trim());
    if !path.is_absolute() {
        return Err(format!("path {:?} is not absolute", path));
    }
    Ok(path)
}

fn read_policy_file(path: &Path) -> Result<String, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::Missing {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Non-blank, non-comment lines with their 1-based line numbers
fn entries(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
}

fn read_paths(path: &Path, default_mode: IntegrityMode) -> Result<Vec<PathRule>, ConfigError> {
    let text = read_policy_file(path)?;
    entries(&text)
        .map(|(n, l)| parse_path_line(l, default_mode).map_err(|m| malformed(path, n, m)))
        .collect()
}

fn read_services(path: &Path) -> Result<Vec<String>, ConfigError> {
    let text = read_policy_file(path)?;
    entries(&text)
        .map(|(n, l)| parse_service_line(l).map_err(|m| malformed(path, n, m)))
        .collect()
}

fn read_scan_dirs(path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let text = read_policy_file(path)?;
    entries(&text)
        .map(|(n, l)| parse_dir_line(l).map_err(|m| malformed(path, n, m)))
        .collect()
}

fn read_taxonomy(path: &Path) -> Result<Taxonomy, ConfigError> {
    let text = read_policy_file(path)?;
    Taxonomy::parse(&text, path)
}
