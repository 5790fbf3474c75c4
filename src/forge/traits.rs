//! forge::traits
//!
//! Forge trait definition and the data types it traffics in.
//!
//! # Design
//!
//! The trait is async because every operation is network I/O. All methods
//! are batched: callers hand over everything they need at once and the
//! implementation decides how to pack it into requests.
//!
//! Node ids (`id` fields) are the forge's GraphQL identifiers. They are
//! opaque strings here; nothing outside the GitHub client interprets them.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::CommitHash;

/// How many leading PR comments are fetched and matched against the
/// review-graph and patchsets comments.
pub const MAX_COMMENTS_TO_QUERY: usize = 3;

/// Errors from forge operations.
#[derive(Debug, Clone, Error)]
pub enum ForgeError {
    /// Authentication failed (invalid token, expired, insufficient scopes).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Rate limit exceeded. Not retried.
    #[error("rate limited")]
    RateLimited,

    /// The API rejected the request. Not retried.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code; 200 for GraphQL-level errors.
        status: u16,
        message: String,
    },

    /// Network or 5xx failure. Retried with backoff for queries.
    #[error("network error: {0}")]
    Network(String),
}

impl ForgeError {
    /// Whether retrying the same request can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForgeError::Network(_))
    }
}

/// PR lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

impl PrState {
    pub fn from_api(state: &str) -> Self {
        match state {
            "MERGED" => PrState::Merged,
            "CLOSED" => PrState::Closed,
            _ => PrState::Open,
        }
    }
}

/// One issue comment on a PR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrComment {
    /// Node id; `None` for a comment that doesn't exist yet.
    pub id: Option<String>,
    pub text: String,
}

/// A pull request as the forge sees it, or as it should be created.
///
/// For a PR that doesn't exist yet, `id` and `url` are empty until
/// [`Forge::create_prs`] fills them in.
#[derive(Debug, Clone, Default)]
pub struct PrInfo {
    pub id: String,
    pub url: String,
    pub state: Option<PrState>,
    /// Base branch name on the forge.
    pub base_ref: String,
    /// Head branch name on the forge.
    pub head_ref: String,
    /// The parent the head was actually uploaded on (parent of the PR's
    /// first commit), not the tip of the base branch.
    pub base_oid: Option<CommitHash>,
    pub head_oid: Option<CommitHash>,
    pub title: String,
    pub body: String,
    pub is_draft: bool,
    pub reviewers: BTreeSet<String>,
    pub reviewer_ids: BTreeSet<String>,
    pub assignees: BTreeSet<String>,
    pub assignee_ids: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub label_ids: BTreeSet<String>,
    /// The first [`MAX_COMMENTS_TO_QUERY`] comments, oldest first.
    pub comments: Vec<PrComment>,
}

/// A minimal PR mutation: only populated fields are sent.
#[derive(Debug, Clone, Default)]
pub struct PrUpdate {
    /// Node id of the PR to update.
    pub id: String,
    pub base_ref: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub is_draft: Option<bool>,
    /// Reviewers to add (never removes).
    pub reviewer_ids: BTreeSet<String>,
    /// Assignees to add.
    pub assignee_ids: BTreeSet<String>,
    /// Labels to add.
    pub label_ids: BTreeSet<String>,
    /// Comments to create (no id) or edit (with id).
    pub comments: Vec<PrComment>,
}

impl PrUpdate {
    /// Whether this update would actually mutate anything.
    pub fn is_empty(&self) -> bool {
        self.base_ref.is_none()
            && self.title.is_none()
            && self.body.is_none()
            && self.is_draft.is_none()
            && self.reviewer_ids.is_empty()
            && self.assignee_ids.is_empty()
            && self.label_ids.is_empty()
            && self.comments.is_empty()
    }
}

/// Everything the upload pipeline learns from the forge in one query.
#[derive(Debug, Clone, Default)]
pub struct RepoQuery {
    /// Node id of the repository.
    pub repo_id: String,
    /// One entry per requested head ref, in order; `None` when no open or
    /// merged PR exists for that ref.
    pub prs: Vec<Option<PrInfo>>,
    /// Requested short-form -> user node id, for resolved users.
    pub user_ids: HashMap<String, String>,
    /// Requested short-form -> full login, for resolved users.
    pub user_logins: HashMap<String, String>,
    /// Label name -> node id, for labels that exist.
    pub label_ids: HashMap<String, String>,
    /// Names that did not resolve; warned about, never fatal.
    pub unresolved_users: Vec<String>,
    pub unresolved_labels: Vec<String>,
}

/// The forge trait.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the pipeline shares one instance
/// across tasks.
#[async_trait]
pub trait Forge: Send + Sync {
    /// Query PRs by head ref, resolve user short-forms, and resolve labels,
    /// all in one round trip.
    ///
    /// `head_refs` may contain duplicates; results are positional.
    async fn query_repo(
        &self,
        head_refs: &[String],
        users: &[String],
        labels: &[String],
    ) -> Result<RepoQuery, ForgeError>;

    /// Create all given PRs in one request, filling in `id` and `url` on
    /// success. A PR that fails to create (e.g. branch already merged)
    /// keeps an empty id; the caller skips further mutations for it.
    async fn create_prs(&self, repo_id: &str, prs: &mut [PrInfo]) -> Result<(), ForgeError>;

    /// Apply all given updates in one request. Updates are not retried:
    /// a partial success must not be replayed.
    async fn update_prs(&self, updates: &[PrUpdate]) -> Result<(), ForgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_state_from_api() {
        assert_eq!(PrState::from_api("OPEN"), PrState::Open);
        assert_eq!(PrState::from_api("MERGED"), PrState::Merged);
        assert_eq!(PrState::from_api("CLOSED"), PrState::Closed);
    }

    #[test]
    fn empty_update_detection() {
        let mut update = PrUpdate::default();
        assert!(update.is_empty());
        update.title = Some("t".into());
        assert!(!update.is_empty());
    }

    #[test]
    fn retryability() {
        assert!(ForgeError::Network("timeout".into()).is_retryable());
        assert!(!ForgeError::RateLimited.is_retryable());
        assert!(!ForgeError::Api { status: 422, message: "no".into() }.is_retryable());
    }
}
