//! WorkspaceId: a random BLAKE3-derived identifier (32 hex chars).
//!
//! Ids come from random data rather than content so a workspace can be
//! addressed before anything is written to it. They double as directory
//! names, so parsing is strict.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ScratchError;

/// Length of a workspace id in hex characters (128 bits).
pub const ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Generate a new random id.
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let hash_bytes = blake3::hash(uuid.as_bytes());
        Self(hex::encode(&hash_bytes.as_bytes()[..16]))
    }

    /// Validate an id taken from outside (a URL, a directory listing).
    pub fn parse(s: &str) -> Result<Self, ScratchError> {
        if s.len() != ID_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ScratchError::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkspaceId {
    type Err = ScratchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Check that `name` is a plain file name safe to join onto a workspace dir.
///
/// Rejects path separators, parent/current-dir components, hidden names and
/// control characters.
pub fn validate_filename(name: &str) -> Result<&str, ScratchError> {
    let ok = !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.chars().any(|c| c.is_control());
    if ok {
        Ok(name)
    } else {
        Err(ScratchError::InvalidFilename(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = WorkspaceId::new();
        let b = WorkspaceId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), ID_LEN);
        assert_eq!(WorkspaceId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn parse_rejects_bad_ids() {
        assert!(WorkspaceId::parse("").is_err());
        assert!(WorkspaceId::parse("../../etc/passwd").is_err());
        assert!(WorkspaceId::parse("zz000000000000000000000000000000").is_err());
        assert!(WorkspaceId::parse("abc").is_err());
    }

    #[test]
    fn parse_lowercases() {
        let id = WorkspaceId::parse("ABCDEF0123456789ABCDEF0123456789").unwrap();
        assert_eq!(id.as_str(), "abcdef0123456789abcdef0123456789");
    }

    #[test]
    fn filenames() {
        assert!(validate_filename("song.mp3").is_ok());
        assert!(validate_filename("remapped_my song.mid").is_ok());
        assert!(validate_filename("../secret").is_err());
        assert!(validate_filename("a/b.mid").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename(".hidden").is_err());
        assert!(validate_filename("").is_err());
    }
}
