//! Directory snapshots and restores
//!
//! Archives are produced by the platform's archiver and recorded in a
//! ledger of `timestamp|sourcePath|archivePath` lines.

use crate::platform::Platform;
use anyhow::{bail, Context};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One ledger record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub timestamp: DateTime<Local>,
    pub source: PathBuf,
    pub archive: PathBuf,
}

impl BackupRecord {
    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.source.display(),
            self.archive.display()
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, '|');
        let timestamp = parts.next()?;
        let source = parts.next()?;
        let archive = parts.next()?;

        let naive = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        let timestamp = Local.from_local_datetime(&naive).earliest()?;

        Some(Self {
            timestamp,
            source: PathBuf::from(source),
            archive: PathBuf::from(archive),
        })
    }
}

/// Archive `source` into `dest_dir/backup_<timestamp>.tar.gz`
pub async fn create(
    platform: &dyn Platform,
    source: &Path,
    dest_dir: &Path,
    ledger: &Path,
) -> anyhow::Result<BackupRecord> {
    if !source.is_dir() {
        bail!("Source directory {:?} does not exist", source);
    }
    std::fs::create_dir_all(dest_dir).with_context(|| format!("creating {:?}", dest_dir))?;

    let timestamp = Local::now();
    let archive = dest_dir.join(format!("backup_{}.tar.gz", timestamp.format(TIMESTAMP_FORMAT)));

    platform.create_archive(source, &archive).await?;

    let record = BackupRecord {
        timestamp,
        source: source.to_path_buf(),
        archive,
    };
    append_ledger(ledger, &record)?;

    info!("Backup of {:?} created at {:?}", source, record.archive);
    Ok(record)
}

/// Unpack `archive` into `dest`, creating it if needed
pub async fn restore(platform: &dyn Platform, archive: &Path, dest: &Path) -> anyhow::Result<()> {
    if !archive.is_file() {
        bail!("Backup file {:?} does not exist", archive);
    }
    std::fs::create_dir_all(dest).with_context(|| format!("creating {:?}", dest))?;

    platform.extract_archive(archive, dest).await?;

    info!("Restored backup from {:?} to {:?}", archive, dest);
    Ok(())
}

/// Read the ledger, skipping malformed lines
pub fn list(ledger: &Path) -> anyhow::Result<Vec<BackupRecord>> {
    if !ledger.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(ledger)?;
    let mut records = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match BackupRecord::parse(line) {
            Some(record) => records.push(record),
            None => warn!("Skipping malformed ledger line {} in {:?}", number + 1, ledger),
        }
    }
    Ok(records)
}

fn append_ledger(ledger: &Path, record: &BackupRecord) -> anyhow::Result<()> {
    if let Some(parent) = ledger.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(ledger)?;
    file.write_all(format!("{}\n", record.to_line()).as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_records_ledger() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("www");
        std::fs::create_dir(&source).unwrap();
        let ledger = dir.path().join("state/backup.ledger");
        let platform = FakePlatform::new();

        let record = create(&platform, &source, &dir.path().join("archives"), &ledger)
            .await
            .unwrap();

        assert!(record.archive.exists());
        let name = record.archive.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("backup_") && name.ends_with(".tar.gz"));

        let records = list(&ledger).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, source);
        assert_eq!(records[0].archive, record.archive);
    }

    #[tokio::test]
    async fn test_missing_source_and_archive() {
        let dir = tempdir().unwrap();
        let platform = FakePlatform::new();

        assert!(create(&platform, &dir.path().join("nope"), dir.path(), &dir.path().join("l"))
            .await
            .is_err());
        assert!(restore(&platform, &dir.path().join("nope.tar.gz"), dir.path())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_restore_creates_destination() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("backup.tar.gz");
        std::fs::write(&archive, "data").unwrap();
        let dest = dir.path().join("restore/here");

        restore(&FakePlatform::new(), &archive, &dest).await.unwrap();
        assert!(dest.join("restored").exists());
    }

    #[test]
    fn test_ledger_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let ledger = dir.path().join("ledger");
        std::fs::write(
            &ledger,
            "20260101_120000|/srv/www|/backups/backup_20260101_120000.tar.gz\ngarbage\n",
        )
        .unwrap();

        let records = list(&ledger).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].archive, PathBuf::from("/backups/backup_20260101_120000.tar.gz"));
    }
}
