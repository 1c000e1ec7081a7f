//! Synchronization watermarks.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// The timestamp through which a VSite is known to be synchronized.
///
/// Holds the database's own textual rendering so it can be handed back to
/// the database and across the wire unchanged. Ordering compares the parsed
/// instant; offset-less forms are taken as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

impl Watermark {
    /// Rendering of the epoch watermark used for bootstrap.
    pub const EPOCH: &'static str = "1900-01-01T00:00:00";

    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.len() == text.len() {
            Self(text)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// The lowest watermark; everything in the database is newer.
    pub fn epoch() -> Self {
        Self(Self::EPOCH.to_string())
    }

    /// The current UTC time, in the format PostgreSQL renders `timestamptz`.
    pub fn current() -> Self {
        Self(chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f+00").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The instant this watermark denotes, normalized to UTC.
    pub fn instant(&self) -> Option<NaiveDateTime> {
        let s = self.0.as_str();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.naive_utc());
        }
        for fmt in OFFSET_FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
                return Some(dt.naive_utc());
            }
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    }

    pub fn is_epoch(&self) -> bool {
        self.compare(&Self::epoch()) != Ordering::Greater
    }

    /// Order two watermarks by instant, falling back to text order when
    /// either side does not parse.
    pub fn compare(&self, other: &Watermark) -> Ordering {
        match (self.instant(), other.instant()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }

    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::epoch()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Watermark {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Watermark {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
