//! topics
//!
//! The topic graph: directive parsing, grouping commits into topics,
//! validating relativity, rebase detection, and branch synthesis.
//!
//! # Pipeline
//!
//! [`stack::TopicStack`] is driven by the upload command in stages:
//! populate topics → populate reviews → absorb the forge query → mark
//! rebases → create commits. Each stage validates before the next runs;
//! nothing is pushed or mutated remotely until every stage has succeeded.

pub mod directives;
pub mod stack;

pub use directives::{BranchFormat, DirectiveError, Directives};
pub use stack::{
    AutoAddUsers, PrStatus, PushStatus, QueryInputs, Review, ReviewOptions, StackError, Topic,
    TopicStack,
};
