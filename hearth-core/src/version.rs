//! Version-string handling.
//!
//! A version string identifies one immutable revision of an entity and is
//! built from the revision timestamp and its author:
//!
//! ```text
//! 2024-01-15T10:30:00.123Z-user-42
//! ```
//!
//! The timestamp part is RFC3339 UTC with millisecond precision and a `Z`
//! suffix, which keeps the string fixed-width up to the separating dash and
//! makes lexicographic comparison agree with chronological order for the
//! timestamp prefix. Tiebreaking during conflict resolution relies on plain
//! lexicographic comparison of whole version strings.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Byte length of the timestamp prefix, `YYYY-MM-DDTHH:MM:SS.mmmZ`.
const TIMESTAMP_LEN: usize = 24;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("version string too short: {0:?}")]
    TooShort(String),
    #[error("missing user id suffix in {0:?}")]
    MissingUserId(String),
    #[error("invalid timestamp in version {0:?}")]
    InvalidTimestamp(String),
}

/// Formats a version string from its timestamp and author.
pub fn format_version(ts: DateTime<Utc>, user_id: &str) -> String {
    format!("{}-{}", ts.format(TIMESTAMP_FORMAT), user_id)
}

/// Splits a version string back into timestamp and author.
///
/// The user id may itself contain dashes, so parsing splits at the fixed
/// timestamp width rather than searching for a separator.
pub fn parse_version(version: &str) -> Result<(DateTime<Utc>, &str), VersionParseError> {
    if version.len() < TIMESTAMP_LEN + 2 || !version.is_char_boundary(TIMESTAMP_LEN) {
        return Err(VersionParseError::TooShort(version.to_owned()));
    }
    let (ts_part, rest) = version.split_at(TIMESTAMP_LEN);
    let user_id = rest
        .strip_prefix('-')
        .filter(|u| !u.is_empty())
        .ok_or_else(|| VersionParseError::MissingUserId(version.to_owned()))?;
    let ts = DateTime::parse_from_rfc3339(ts_part)
        .map_err(|_| VersionParseError::InvalidTimestamp(version.to_owned()))?
        .with_timezone(&Utc);
    Ok((ts, user_id))
}
