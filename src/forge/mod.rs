//! forge
//!
//! Abstraction for the remote forge.
//!
//! # Design
//!
//! The [`Forge`] trait exposes exactly the batched operations the upload
//! pipeline needs: one combined query for PRs/users/labels, one batched PR
//! creation, and one batched PR update. Batching matters: a stack of ten
//! topics reconciles in three round trips instead of dozens.
//!
//! GitHub is the only production implementation; [`mock::MockForge`] backs
//! the tests.

pub mod github;
pub mod mock;

mod traits;

pub use traits::{
    Forge, ForgeError, PrComment, PrInfo, PrState, PrUpdate, RepoQuery, MAX_COMMENTS_TO_QUERY,
};
