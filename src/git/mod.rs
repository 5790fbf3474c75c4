//! git
//!
//! Single interface for all Git operations.
//!
//! # Architecture
//!
//! This module is the only doorway to git. The repository is never opened or
//! parsed directly: every read and write shells out to the `git` executable
//! through [`shell::Shell`], and all object creation goes through plumbing
//! (`merge-tree`, `commit-tree`, `write-tree`, `update-ref`).
//!
//! # Invariants
//!
//! - The user's working tree, index, and `HEAD` are never modified
//! - Index operations use transient index files under the scratch directory
//! - Exit codes and stderr are surfaced verbatim in [`GitError::Plumbing`]

pub mod shell;

mod interface;

pub use interface::{
    ConflictFile, Git, GitError, GitOptions, MergeConflict, PushLease, PushOutcome, PushTarget,
    RepoHandle, Signature,
};
pub use shell::{Shell, ShellError, ShellOutput};
