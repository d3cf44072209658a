//! Security audit trail: one human-readable line per enrollment, login
//! decision and deletion.

mod file_log;

pub use file_log::FileAuditLog;

use crate::common::Result;
use crate::core::auth::FailureReason;
use chrono::{Local, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    Enrolled,
    AuthSuccess,
    AuthFailure(FailureReason),
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Local wall-clock time, second precision.
    pub timestamp: NaiveDateTime,
    pub kind: AuditKind,
    /// Absent for failed logins, where nobody was recognised.
    pub subject_name: Option<String>,
}

impl AuditEntry {
    fn now(kind: AuditKind, subject_name: Option<&str>) -> Self {
        let now = Local::now().naive_local();
        let timestamp = now.with_nanosecond(0).unwrap_or(now);
        Self {
            timestamp,
            kind,
            subject_name: subject_name.map(str::to_string),
        }
    }

    pub fn enrolled(name: &str) -> Self {
        Self::now(AuditKind::Enrolled, Some(name))
    }

    pub fn auth_success(name: &str) -> Self {
        Self::now(AuditKind::AuthSuccess, Some(name))
    }

    pub fn auth_failure(reason: FailureReason) -> Self {
        Self::now(AuditKind::AuthFailure(reason), None)
    }

    pub fn deleted(name: &str) -> Self {
        Self::now(AuditKind::Deleted, Some(name))
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.subject_name.as_deref().unwrap_or("");
        write!(f, "{} - ", self.timestamp.format(TIMESTAMP_FORMAT))?;
        match self.kind {
            AuditKind::Enrolled => write!(f, "NEW USER REGISTERED: {}", name),
            AuditKind::AuthSuccess => write!(f, "SUCCESSFUL LOGIN: {}", name),
            AuditKind::AuthFailure(reason) => write!(f, "FAILED LOGIN ATTEMPT ({})", reason),
            AuditKind::Deleted => write!(f, "USER DELETED: {}", name),
        }
    }
}

#[derive(Debug, Error)]
#[error("Malformed audit line: {0:?}")]
pub struct ParseAuditError(String);

impl FromStr for AuditEntry {
    type Err = ParseAuditError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || ParseAuditError(line.to_string());
        let (stamp, event) = line.split_once(" - ").ok_or_else(malformed)?;
        let timestamp =
            NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|_| malformed())?;

        let (kind, subject_name) = if let Some(name) = event.strip_prefix("NEW USER REGISTERED: ") {
            (AuditKind::Enrolled, Some(name.to_string()))
        } else if let Some(name) = event.strip_prefix("SUCCESSFUL LOGIN: ") {
            (AuditKind::AuthSuccess, Some(name.to_string()))
        } else if let Some(name) = event.strip_prefix("USER DELETED: ") {
            (AuditKind::Deleted, Some(name.to_string()))
        } else if let Some(rest) = event.strip_prefix("FAILED LOGIN ATTEMPT") {
            let reason = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .map(|r| r.parse::<FailureReason>().map_err(|_| malformed()))
                .transpose()?
                // Older logs carry no reason.
                .unwrap_or(FailureReason::AttemptsExhausted);
            (AuditKind::AuthFailure(reason), None)
        } else {
            return Err(malformed());
        };

        Ok(Self {
            timestamp,
            kind,
            subject_name,
        })
    }
}

/// Append-only destination for audit entries.
///
/// Controllers only ever call `record`; truncation is an operator action on
/// the concrete log.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<()>;
}
