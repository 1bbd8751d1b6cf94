//! Validated store paths

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{StoreError, HEART_RATE_KEY, SESSIONS_KEY};

/// Longest key the hosted realtime databases accept.
const MAX_SEGMENT_BYTES: usize = 768;

/// A `/`-separated path of non-empty segments. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parse `a/b/c`; leading and trailing slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut path = Self::root();
        for segment in trimmed.split('/') {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    pub fn child(&self, segment: &str) -> Result<Self, StoreError> {
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// `sessions`
    pub fn sessions() -> Self {
        Self {
            segments: vec![SESSIONS_KEY.to_string()],
        }
    }

    /// `sessions/{session_id}/heartRate`
    pub fn session_heart_rate(session_id: &str) -> Result<Self, StoreError> {
        Self::sessions().child(session_id)?.child(HEART_RATE_KEY)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// The first `len` segments.
    pub(crate) fn prefix(&self, len: usize) -> Self {
        Self {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }
}

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() {
        return Err(StoreError::InvalidPath("empty path segment".to_string()));
    }
    if segment.len() > MAX_SEGMENT_BYTES {
        return Err(StoreError::InvalidPath(format!(
            "segment longer than {} bytes",
            MAX_SEGMENT_BYTES
        )));
    }
    if let Some(bad) = segment
        .chars()
        .find(|c| matches!(c, '.' | '#' | '$' | '[' | ']' | '/') || c.is_control())
    {
        return Err(StoreError::InvalidPath(format!(
            "segment {:?} contains forbidden character {:?}",
            segment, bad
        )));
    }
    Ok(())
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl TryFrom<String> for StorePath {
    type Error = StoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<StorePath> for String {
    fn from(path: StorePath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = StorePath::parse("/sessions/abc/heartRate/").unwrap();
        assert_eq!(path.segments(), &["sessions", "abc", "heartRate"]);
        assert_eq!(path.to_string(), "sessions/abc/heartRate");
        assert_eq!(path, StorePath::session_heart_rate("abc").unwrap());
        assert!(StorePath::parse("").unwrap().is_root());
    }

    #[test]
    fn test_rejects_forbidden_segments() {
        for bad in ["a//b", "a/b.c", "a/#", "a/$x", "a/[0]", "tab\there"] {
            assert!(
                matches!(StorePath::parse(bad), Err(StoreError::InvalidPath(_))),
                "{} should be rejected",
                bad
            );
        }
        assert!(StorePath::session_heart_rate("bad.id").is_err());
        assert!(StorePath::root().child("").is_err());
    }

    #[test]
    fn test_parent_and_prefix() {
        let path = StorePath::parse("a/b/c").unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "a/b");
        assert_eq!(path.prefix(1).to_string(), "a");
        assert_eq!(path.last(), Some("c"));
        assert_eq!(StorePath::root().parent(), None);
    }

    #[test]
    fn test_serde_as_string() {
        let path = StorePath::parse("sessions/s1").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"sessions/s1\"");
        let back: StorePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<StorePath>("\"a/b.c\"").is_err());
    }
}
