//! Queue path validation.
//!
//! A queue is addressed by a slash-separated ASCII path. Segments are 1–64
//! bytes of printable ASCII; the whole path is at most 256 bytes. Paths are
//! normalised (leading/trailing slashes stripped) before use, so "/demo"
//! and "demo" name the same queue.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The distinguished permanent queue holding Location Service records.
pub const WHOSWHO: &str = "whoswho";

/// The queue every daemon must provision before accepting requests.
pub const INBOX: &str = "INBOX";

/// Maximum total path length in bytes.
pub const MAX_PATH_BYTES: usize = 256;

/// Maximum length of a single path segment in bytes.
pub const MAX_SEGMENT_BYTES: usize = 64;

/// A validated, normalised queue path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueuePath {
    path: String,
}

impl QueuePath {
    /// Validate and normalise a raw path.
    pub fn parse(raw: &str) -> Result<Self, QueuePathError> {
        if raw.len() > MAX_PATH_BYTES {
            return Err(QueuePathError::TooLong(raw.len()));
        }
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(QueuePathError::Empty);
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(QueuePathError::EmptySegment);
            }
            if segment.len() > MAX_SEGMENT_BYTES {
                return Err(QueuePathError::SegmentTooLong(segment.len()));
            }
            if segment == "." || segment == ".." {
                return Err(QueuePathError::ReservedSegment(segment.to_owned()));
            }
            if let Some(bad) = segment.chars().find(|c| !c.is_ascii_graphic()) {
                return Err(QueuePathError::BadCharacter(bad));
            }
        }
        Ok(Self {
            path: trimmed.to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/')
    }

    /// Map the queue onto a directory below `root`.
    pub fn dir_under(&self, root: &std::path::Path) -> PathBuf {
        let mut dir = root.to_path_buf();
        for segment in self.segments() {
            dir.push(segment);
        }
        dir
    }

    pub fn is_whoswho(&self) -> bool {
        self.path == WHOSWHO
    }

    /// The `whoswho` queue path. Always valid.
    pub fn whoswho() -> Self {
        Self {
            path: WHOSWHO.to_owned(),
        }
    }

    /// The `INBOX` queue path. Always valid.
    pub fn inbox() -> Self {
        Self {
            path: INBOX.to_owned(),
        }
    }
}

impl fmt::Display for QueuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl FromStr for QueuePath {
    type Err = QueuePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for QueuePath {
    type Error = QueuePathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<QueuePath> for String {
    fn from(q: QueuePath) -> String {
        q.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueuePathError {
    #[error("queue path is empty")]
    Empty,

    #[error("queue path is {0} bytes, maximum is {MAX_PATH_BYTES}")]
    TooLong(usize),

    #[error("queue path contains an empty segment")]
    EmptySegment,

    #[error("queue path segment is {0} bytes, maximum is {MAX_SEGMENT_BYTES}")]
    SegmentTooLong(usize),

    #[error("queue path segment {0:?} is reserved")]
    ReservedSegment(String),

    #[error("queue path contains forbidden character {0:?}")]
    BadCharacter(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_is_normalised() {
        assert_eq!(QueuePath::parse("/demo").unwrap().as_str(), "demo");
        assert_eq!(QueuePath::parse("demo").unwrap().as_str(), "demo");
    }

    #[test]
    fn nested_paths_keep_segments() {
        let q = QueuePath::parse("a/b/c").unwrap();
        assert_eq!(q.segments().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_and_slash_only_are_rejected() {
        assert_eq!(QueuePath::parse("").unwrap_err(), QueuePathError::Empty);
        assert_eq!(QueuePath::parse("///").unwrap_err(), QueuePathError::Empty);
    }

    #[test]
    fn interior_empty_segment_is_rejected() {
        assert_eq!(
            QueuePath::parse("a//b").unwrap_err(),
            QueuePathError::EmptySegment
        );
    }

    #[test]
    fn path_at_byte_limit_is_accepted() {
        // Three 64-byte segments + three slashes + one 61-byte segment = 256.
        let long = "x".repeat(64);
        let path = format!("{long}/{long}/{long}/{}", "y".repeat(61));
        assert_eq!(path.len(), 256);
        assert!(QueuePath::parse(&path).is_ok());

        let over = format!("{path}z");
        assert_eq!(
            QueuePath::parse(&over).unwrap_err(),
            QueuePathError::TooLong(257)
        );
    }

    #[test]
    fn segment_over_limit_is_rejected() {
        let seg = "x".repeat(65);
        assert_eq!(
            QueuePath::parse(&seg).unwrap_err(),
            QueuePathError::SegmentTooLong(65)
        );
    }

    #[test]
    fn traversal_segments_are_rejected() {
        assert!(matches!(
            QueuePath::parse("a/../b").unwrap_err(),
            QueuePathError::ReservedSegment(_)
        ));
    }

    #[test]
    fn non_ascii_and_whitespace_are_rejected() {
        assert!(matches!(
            QueuePath::parse("héllo").unwrap_err(),
            QueuePathError::BadCharacter(_)
        ));
        assert_eq!(
            QueuePath::parse("a b").unwrap_err(),
            QueuePathError::BadCharacter(' ')
        );
    }

    #[test]
    fn whoswho_is_recognised() {
        assert!(QueuePath::parse("/whoswho").unwrap().is_whoswho());
        assert!(!QueuePath::parse("whoswho/sub").unwrap().is_whoswho());
        assert!(QueuePath::whoswho().is_whoswho());
    }

    #[test]
    fn dir_mapping_follows_segments() {
        let q = QueuePath::parse("a/b").unwrap();
        let dir = q.dir_under(std::path::Path::new("/tmp/queues"));
        assert_eq!(dir, PathBuf::from("/tmp/queues/a/b"));
    }
}
