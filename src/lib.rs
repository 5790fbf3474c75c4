//! Revup - stacked pull requests from tagged commits
//!
//! Revup reads a linear stack of local commits, groups them into topics via
//! `Topic:` / `Relative:` tags in the commit messages, synthesizes one branch
//! per (topic, base branch) pair by cherry-picking entirely in-memory, and
//! reconciles the result against GitHub: pushes, pull requests, reviewers,
//! labels, draft state, and the review-graph / patchsets comments.
//!
//! # Architecture
//!
//! The codebase follows a strict layered architecture:
//!
//! - [`cli`] - Command-line interface layer (parses args, delegates to upload)
//! - [`core`] - Domain types and configuration
//! - [`git`] - Single interface for all Git operations
//! - [`topics`] - Commit tags, topic graph, rebase detection, branch synthesis
//! - [`forge`] - Abstraction for the remote forge (GitHub v1)
//! - [`upload`] - The upload pipeline: plan, push, reconcile
//! - [`ui`] - Output and pure comment renderers
//!
//! # Correctness Invariants
//!
//! 1. The user's working tree, index, and `HEAD` are never touched
//! 2. Validation and cherry-pick conflicts abort before any push or mutation
//! 3. After the first push, failures are isolated per topic
//! 4. Comment rendering is deterministic, so updates are diff-driven

pub mod cli;
pub mod core;
pub mod forge;
pub mod git;
pub mod topics;
pub mod ui;
pub mod upload;
