use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;

use crate::error::{Result, UpdateError};

/// Fixed layout of `committed_date` once any UTC offset is stripped.
pub const COMMIT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Length of a `YYYY-MM-DDTHH:MM:SS` string. Offset signs never appear before it.
const COMMIT_DATE_LEN: usize = 19;

/// Message recorded on the sentinel commit.
pub const EMPTY_COMMIT_MESSAGE: &str = "(No commit found.)";

/// One remote commit.
///
/// Equality and ordering compare `committed_at` only; two records with
/// different ids but the same timestamp are considered equal.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    id: String,
    message: String,
    committed_at: NaiveDateTime,
}

/// One entry of the commit-list endpoint. Extra keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitWire {
    pub id: String,
    pub message: String,
    pub committed_date: String,
}

impl CommitRecord {
    pub fn new(
        id: impl Into<String>,
        message: impl Into<String>,
        committed_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            committed_at,
        }
    }

    /// Sentinel used whenever no baseline is known. Older than any real commit.
    pub fn empty() -> Self {
        Self::new("", EMPTY_COMMIT_MESSAGE, DateTime::UNIX_EPOCH.naive_utc())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn committed_at(&self) -> NaiveDateTime {
        self.committed_at
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    pub fn from_wire(wire: CommitWire) -> Result<Self> {
        let committed_at = parse_commit_date(&wire.committed_date)?;
        Ok(Self::new(wire.id, wire.message, committed_at))
    }
}

impl Default for CommitRecord {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for CommitRecord {
    fn eq(&self, other: &Self) -> bool {
        self.committed_at == other.committed_at
    }
}

impl Eq for CommitRecord {}

impl PartialOrd for CommitRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.committed_at.cmp(&other.committed_at)
    }
}

impl fmt::Display for CommitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{}", self.message);
        }
        let short = self.id.get(..12).unwrap_or(&self.id);
        let subject = self.message.lines().next().unwrap_or("");
        write!(
            f,
            "{} {} {}",
            short,
            self.committed_at.format(COMMIT_DATE_FORMAT),
            subject
        )
    }
}

/// True iff `latest` was committed strictly after `baseline`.
pub fn is_update_available(latest: &CommitRecord, baseline: &CommitRecord) -> bool {
    latest.committed_at > baseline.committed_at
}

/// Parse a `committed_date`, discarding any trailing UTC offset.
pub fn parse_commit_date(raw: &str) -> Result<NaiveDateTime> {
    let stripped = strip_utc_offset(raw);
    NaiveDateTime::parse_from_str(stripped, COMMIT_DATE_FORMAT)
        .map_err(|e| UpdateError::Format(format!("invalid committed_date '{}': {}", raw, e)))
}

fn strip_utc_offset(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_suffix(|c| c == 'Z' || c == 'z') {
        return rest;
    }
    match trimmed.rfind(|c| c == '+' || c == '-') {
        Some(idx) if idx >= COMMIT_DATE_LEN => &trimmed[..idx],
        _ => trimmed,
    }
}
