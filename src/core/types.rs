//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`CommitHash`] - Validated git commit object id
//! - [`TreeHash`] - Validated git tree object id
//! - [`CommitHeader`] - Parsed `git rev-list --header` record
//!
//! # Validation
//!
//! Hash types enforce validity at construction time. Invalid values cannot
//! be represented, so downstream code never re-checks hex-ness or length.
//!
//! # Examples
//!
//! ```
//! use revup::core::types::CommitHash;
//!
//! let hash = CommitHash::new("ABC123DEF4567890ABC123DEF4567890ABC12345").unwrap();
//! assert_eq!(hash.short(), "abc123de");
//! assert!(CommitHash::new("not-a-hash").is_err());
//! ```

use thiserror::Error;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid commit id: {0}")]
    InvalidCommitHash(String),

    #[error("invalid tree id: {0}")]
    InvalidTreeHash(String),
}

/// Length of an abbreviated hash in user-facing output.
const SHORT_HASH_LEN: usize = 8;

fn validate_hex(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// A validated git commit object id (SHA-1 or SHA-256), normalized to
/// lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitHash(String);

impl CommitHash {
    /// Create a new validated commit id.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidCommitHash` if the string is not a full
    /// hex object id.
    pub fn new(hash: impl Into<String>) -> Result<Self, TypeError> {
        let hash = hash.into().to_ascii_lowercase();
        if !validate_hex(&hash) {
            return Err(TypeError::InvalidCommitHash(hash));
        }
        Ok(Self(hash))
    }

    /// Get the commit id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the abbreviated form used in messages and comment links.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_HASH_LEN]
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated git tree object id, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeHash(String);

impl TreeHash {
    /// Create a new validated tree id.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidTreeHash` if the string is not a full hex
    /// object id.
    pub fn new(hash: impl Into<String>) -> Result<Self, TypeError> {
        let hash = hash.into().to_ascii_lowercase();
        if !validate_hex(&hash) {
            return Err(TypeError::InvalidTreeHash(hash));
        }
        Ok(Self(hash))
    }

    /// Get the tree id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TreeHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TreeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One record from `git rev-list --header`.
///
/// The author and committer date fields keep git's raw `<epoch> <tz>` form so
/// they can be passed back to `commit-tree` unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHeader {
    pub commit_id: CommitHash,
    pub tree: TreeHash,
    pub parents: Vec<CommitHash>,
    pub author_name: String,
    pub author_email: String,
    pub author_date: String,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_date: String,
    /// Full commit message: subject, blank line, body.
    pub message: String,
}

impl CommitHeader {
    /// The subject line of the commit message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    /// The message body below the subject, trimmed.
    pub fn body(&self) -> &str {
        match self.message.split_once('\n') {
            Some((_, rest)) => rest.trim(),
            None => "",
        }
    }

    /// First parent, if any. Stack commits always have one; the root commit
    /// of a repository has none.
    pub fn first_parent(&self) -> Option<&CommitHash> {
        self.parents.first()
    }

    /// Whether author identity and full message match another commit.
    ///
    /// Used by rebase detection: two commits that match here and carry equal
    /// patch fingerprints are the same change, regardless of their ids.
    pub fn matches(&self, other: &CommitHeader) -> bool {
        self.author_name == other.author_name
            && self.author_email == other.author_email
            && self.message == other.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "abc123def4567890abc123def4567890abc12345";

    mod commit_hash {
        use super::*;

        #[test]
        fn accepts_sha1_and_sha256() {
            assert!(CommitHash::new(SHA).is_ok());
            assert!(CommitHash::new("a".repeat(64)).is_ok());
        }

        #[test]
        fn normalizes_to_lowercase() {
            let hash = CommitHash::new(SHA.to_uppercase()).unwrap();
            assert_eq!(hash.as_str(), SHA);
        }

        #[test]
        fn rejects_short_and_non_hex() {
            assert!(CommitHash::new("abc123").is_err());
            assert!(CommitHash::new("g".repeat(40)).is_err());
            assert!(CommitHash::new("").is_err());
        }

        #[test]
        fn short_form() {
            let hash = CommitHash::new(SHA).unwrap();
            assert_eq!(hash.short(), "abc123de");
        }
    }

    mod commit_header {
        use super::*;

        fn header(message: &str) -> CommitHeader {
            CommitHeader {
                commit_id: CommitHash::new(SHA).unwrap(),
                tree: TreeHash::new("b".repeat(40)).unwrap(),
                parents: vec![CommitHash::new("c".repeat(40)).unwrap()],
                author_name: "Ada".into(),
                author_email: "ada@example.com".into(),
                author_date: "1700000000 +0000".into(),
                committer_name: "Ada".into(),
                committer_email: "ada@example.com".into(),
                committer_date: "1700000000 +0000".into(),
                message: message.into(),
            }
        }

        #[test]
        fn subject_and_body() {
            let c = header("Add parser\n\nTopic: parser\nMore text");
            assert_eq!(c.subject(), "Add parser");
            assert_eq!(c.body(), "Topic: parser\nMore text");
        }

        #[test]
        fn subject_only_message_has_empty_body() {
            let c = header("Add parser");
            assert_eq!(c.subject(), "Add parser");
            assert_eq!(c.body(), "");
        }

        #[test]
        fn matches_ignores_ids_and_dates() {
            let a = header("Add parser\n\nbody");
            let mut b = a.clone();
            b.commit_id = CommitHash::new("d".repeat(40)).unwrap();
            b.committer_date = "1800000000 +0000".into();
            assert!(a.matches(&b));

            b.message = "Add parser\n\nreworded".into();
            assert!(!a.matches(&b));
        }
    }
}
