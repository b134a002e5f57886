//! Timestamped archive names: `<prefix>YYYY_MM_DD_HH_MM_SS.tar.gz`.

use chrono::{Local, NaiveDateTime, Timelike};

const SNAPSHOT_PREFIX: &str = "tarball_";
const BACKUP_PREFIX: &str = "backup_";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const STAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";
const STAMP_LEN: usize = 19;

/// Current local time truncated to whole seconds
pub fn local_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Name of a downloaded snapshot taken at `at`
pub fn snapshot_filename(at: NaiveDateTime) -> String {
    stamped(SNAPSHOT_PREFIX, at)
}

/// Name of a backup archive taken at `at`
pub fn backup_filename(at: NaiveDateTime) -> String {
    stamped(BACKUP_PREFIX, at)
}

pub fn is_snapshot_filename(name: &str) -> bool {
    matches_stamped(name, SNAPSHOT_PREFIX)
}

#[cfg(test)]
pub fn is_backup_filename(name: &str) -> bool {
    matches_stamped(name, BACKUP_PREFIX)
}

fn stamped(prefix: &str, at: NaiveDateTime) -> String {
    format!("{}{}{}", prefix, at.format(STAMP_FORMAT), ARCHIVE_SUFFIX)
}

fn matches_stamped(name: &str, prefix: &str) -> bool {
    let Some(stamp) = name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(ARCHIVE_SUFFIX))
    else {
        return false;
    };

    if stamp.len() != STAMP_LEN {
        return false;
    }
    // Digits everywhere except the five separators
    let shape_ok = stamp.bytes().enumerate().all(|(i, b)| match i {
        4 | 7 | 10 | 13 | 16 => b == b'_',
        _ => b.is_ascii_digit(),
    });

    shape_ok && NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).is_ok()
}
