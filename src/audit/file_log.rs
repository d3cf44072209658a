use super::{AuditEntry, AuditSink};
use crate::common::{FaceGateError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Plain-text security log, one entry per line.
pub struct FileAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All parseable entries, oldest first. Lines that do not parse are skipped.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match line.parse() {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("{}", e),
            }
        }
        Ok(entries)
    }

    /// Truncates the log. Only ever invoked by an explicit operator command.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock()?;
        if self.path.exists() {
            fs::write(&self.path, b"")?;
        }
        tracing::info!("Cleared security log {}", self.path.display());
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| FaceGateError::Persistence("Audit log lock poisoned".into()))
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = self.lock()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", entry)?;
        tracing::debug!("Audit: {}", entry);
        Ok(())
    }
}
