//! topics::stack
//!
//! Topic graph construction, validation, rebase detection, and branch
//! synthesis.
//!
//! # Model
//!
//! A [`Topic`] is a named group of commits. Each topic expands into one
//! [`Review`] per declared base branch; a review corresponds to exactly one
//! pull request, keyed by its remote head branch. Relativity links topics
//! into a DAG: a relative topic's reviews parent onto the relative's
//! synthesized heads instead of the base branch tip.
//!
//! # Invariants
//!
//! - Topics appear in first-commit order; a topic's relative always has a
//!   smaller index, so index order is a topological order
//! - Validation and conflict detection complete before anything is pushed
//! - The user's working tree, index, and `HEAD` are never touched

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use thiserror::Error;

use super::directives::{self, BranchFormat, DirectiveError};
use crate::core::types::{CommitHash, CommitHeader, TreeHash};
use crate::forge::{PrInfo, PrState, PrUpdate, RepoQuery, MAX_COMMENTS_TO_QUERY};
use crate::git::{Git, GitError, PushLease, PushOutcome, PushTarget, RepoHandle, Signature};
use crate::ui::comments;
use crate::ui::output::{self, Verbosity};

/// Errors from topic graph construction and synthesis.
#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("in commit {commit} (\"{subject}\"): {source}")]
    Directive {
        commit: String,
        subject: String,
        source: DirectiveError,
    },

    #[error("no changes from branch {0}")]
    NoCommits(String),

    #[error("found {0} commits but no topic tags; tag commits with 'Topic:' or pass --auto-topic")]
    NoTopics(usize),

    #[error("commits in topic '{topic}' disagree on '{directive}'")]
    ConflictingValues { topic: String, directive: String },

    #[error("topic '{topic}' is relative to '{relative}' but doesn't appear after it")]
    RelativeOrder { topic: String, relative: String },

    #[error("topic '{topic}' has branches {branches:?} not in relative topic '{relative}'")]
    BranchesNotInRelative {
        topic: String,
        relative: String,
        branches: Vec<String>,
    },

    #[error("topic '{topic}' and relative topic '{relative}' have differing relative branches")]
    RelativeBranchMismatch { topic: String, relative: String },

    #[error("can't specify more than one base branch when there is a relative branch (topic '{0}')")]
    RelativeBranchWithMultipleBases(String),

    #[error("topic '{topic}' has uploader '{uploader}' but relative topic '{relative}' has '{relative_uploader}'")]
    UploaderMismatch {
        topic: String,
        uploader: String,
        relative: String,
        relative_uploader: String,
    },

    #[error(
        "relative branch structure is invalid: HEAD is closer to {base} than {relative}; \
         expected the fork point with {base} to be an ancestor of the fork point with {relative}"
    )]
    InvalidRelativeStructure { base: String, relative: String },

    #[error(
        "failed to cherry-pick commit \"{subject}\" ({commit}) in topic \"{topic}\" \
         to new parent ({parent}) in {parent_desc}\n\
         conflicting paths: {paths:?}\n\
         You must specify relative topics to prevent this conflict!"
    )]
    CherryPick {
        topic: String,
        commit: String,
        subject: String,
        parent: String,
        parent_desc: String,
        paths: Vec<String>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// The state of each review on the forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrStatus {
    /// Needs to be created, or was just created.
    New,
    /// Forge metadata needs to change (title, reviewers, labels, …).
    Updated,
    /// No forge mutations are necessary.
    #[default]
    NoChange,
    /// Already merged; no mutations are possible.
    Merged,
}

impl PrStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PrStatus::New => "new",
            PrStatus::Updated => "updated",
            PrStatus::NoChange => "no change",
            PrStatus::Merged => "already merged",
        }
    }
}

/// The state of each review's git branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushStatus {
    /// The branch head changed and will be (or was) pushed.
    #[default]
    Pushed,
    /// Skipped because it is a pure rebase of the remote.
    Rebase,
    /// Skipped because nothing changed at all.
    NoChange,
}

impl PushStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PushStatus::Pushed => "pushed",
            PushStatus::Rebase => "rebase",
            PushStatus::NoChange => "no change",
        }
    }
}

/// `--auto-add-users` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoAddUsers {
    #[default]
    No,
    /// Add reviewers as assignees.
    ReviewersToAssignees,
    /// Add assignees as reviewers.
    AssigneesToReviewers,
    Both,
}

impl FromStr for AutoAddUsers {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(Self::No),
            "r2a" => Ok(Self::ReviewersToAssignees),
            "a2r" => Ok(Self::AssigneesToReviewers),
            "both" => Ok(Self::Both),
            other => Err(format!("invalid auto-add-users mode '{}'", other)),
        }
    }
}

/// Aggregated directives for one topic (union over its commits).
#[derive(Debug, Clone, Default)]
pub struct TopicTags {
    pub relative: Option<String>,
    /// Base branches, remote-prefixed, in first-appearance order.
    pub branches: Vec<String>,
    pub reviewers: Vec<String>,
    pub assignees: Vec<String>,
    pub labels: Vec<String>,
    pub uploader: Option<String>,
    pub branch_format: Option<BranchFormat>,
    /// Remote-prefixed.
    pub relative_branch: Option<String>,
    pub update_pr_body: Option<bool>,
}

/// A named series of commits; expands into one review per base branch.
#[derive(Debug, Clone, Default)]
pub struct Topic {
    pub name: String,
    /// Index of the relative topic, if any. Always smaller than this
    /// topic's own index.
    pub relative: Option<usize>,
    pub commits: Vec<CommitHeader>,
    pub tags: TopicTags,
    /// (prefixed base branch, review index) pairs, in branch order.
    pub reviews: Vec<(String, usize)>,
    /// Lazily computed patch fingerprints, one per commit.
    fingerprints: Option<Vec<String>>,
}

/// One pull request to be created or reconciled. Uniquely keyed by
/// (topic, base branch); named by its remote head branch.
#[derive(Debug, Clone, Default)]
pub struct Review {
    pub topic: usize,
    /// Remote-prefixed base branch.
    pub base_branch: String,
    /// Local parent of the synthesized commits.
    pub base_ref: Option<CommitHash>,
    /// Synthesized commits; the last one is the branch head to push.
    pub new_commits: Vec<CommitHash>,
    /// Remote head branch name.
    pub remote_head: String,
    /// Remote base: a base branch, a relative branch, or another review's
    /// head branch.
    pub remote_base: String,
    /// Remote-prefixed relative branch, when distinct from the base.
    pub relative_branch: Option<String>,
    /// What the remote currently has for this review.
    pub remote_commits: Vec<CommitHeader>,
    pub pr_info: Option<PrInfo>,
    pub pr_update: PrUpdate,
    pub status: PrStatus,
    pub is_pure_rebase: bool,
    pub push_status: PushStatus,
    /// Reviews that declared this one as their relative.
    pub children: Vec<usize>,
    pub is_draft: bool,
    /// The push lease failed; no further mutations for this review.
    pub push_rejected: bool,
    /// Comment slots matched against existing PR comments.
    pub review_graph_index: Option<usize>,
    pub patchsets_index: Option<usize>,
}

/// Options for [`TopicStack::populate_reviews`].
#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    /// Default uploader (flag or the email local part).
    pub uploader: String,
    /// Chain topics in commit order, ignoring `Relative:` tags.
    pub relative_chain: bool,
    /// Extra labels applied to every topic.
    pub labels: Vec<String>,
    /// `old:new` username rewrites.
    pub user_aliases: Vec<(String, String)>,
    pub auto_add_users: AutoAddUsers,
    /// Skip topics with no commit authored by the configured email.
    pub self_authored_only: bool,
}

/// Inputs for the batched forge query.
#[derive(Debug, Clone, Default)]
pub struct QueryInputs {
    /// Review head refs first, then relative branch names.
    pub head_refs: Vec<String>,
    pub users: Vec<String>,
    pub labels: Vec<String>,
}

/// Constructs and manages topics and their reviews for one upload.
pub struct TopicStack<'a> {
    git: &'a Git,
    verbosity: Verbosity,
    head: String,
    /// Remote-prefixed; resolved (or detected) in `populate_topics`.
    pub base_branch: String,
    pub relative_branch: String,
    branch_format: BranchFormat,
    pub commits: Vec<CommitHeader>,
    pub topics: Vec<Topic>,
    pub reviews: Vec<Review>,
    /// Unprefixed relative branch name -> PR info for that branch.
    pub relative_infos: HashMap<String, PrInfo>,
    /// Relative branch names queried after the review head refs.
    relative_query: Vec<String>,
    query: RepoQuery,
    pub last_virtual_diff_target: Option<CommitHash>,
}

impl<'a> TopicStack<'a> {
    pub fn new(
        git: &'a Git,
        verbosity: Verbosity,
        head: String,
        base_branch: Option<String>,
        relative_branch: Option<String>,
        branch_format: BranchFormat,
    ) -> Self {
        Self {
            git,
            verbosity,
            head,
            base_branch: base_branch.unwrap_or_default(),
            relative_branch: relative_branch.unwrap_or_default(),
            branch_format,
            commits: Vec::new(),
            topics: Vec::new(),
            reviews: Vec::new(),
            relative_infos: HashMap::new(),
            relative_query: Vec::new(),
            query: RepoQuery::default(),
            last_virtual_diff_target: None,
        }
    }

    fn topic_index(&self, name: &str) -> Option<usize> {
        self.topics.iter().position(|t| t.name == name)
    }

    /// The relative topic's review for the same base branch.
    fn relative_review(&self, review_idx: usize) -> Option<usize> {
        let review = &self.reviews[review_idx];
        let relative = self.topics[review.topic].relative?;
        self.topics[relative]
            .reviews
            .iter()
            .find(|(base, _)| *base == review.base_branch)
            .map(|(_, idx)| *idx)
    }

    // ----------------------------------------------------------------------
    // Stage 1: walk commits and group them into topics
    // ----------------------------------------------------------------------

    /// Resolve base and relative branches, walk the commit range, parse
    /// directives, and group commits into topics.
    ///
    /// With `limit_topics`, only the named topics (plus their relative
    /// ancestors) are kept.
    pub async fn populate_topics(
        &mut self,
        auto_topic: bool,
        trim_tags: bool,
        limit_topics: &[String],
    ) -> Result<(), StackError> {
        if self.base_branch.is_empty() {
            self.base_branch = self.git.best_base_branch(&self.head).await?;
        } else {
            self.base_branch = self.git.ensure_branch_prefix(&self.base_branch);
            self.git.verify_branch_or_commit(&self.base_branch).await?;
        }
        if self.relative_branch.is_empty() {
            self.relative_branch = self.base_branch.clone();
        } else {
            self.relative_branch = self.git.ensure_branch_prefix(&self.relative_branch);
            self.git
                .verify_branch_or_commit(&self.relative_branch)
                .await?;
        }

        let branch_point = self
            .git
            .fork_point(&self.head, &self.relative_branch)
            .await?;
        if self.base_branch != self.relative_branch {
            let base_point = self.git.fork_point(&self.head, &self.base_branch).await?;
            if !self
                .git
                .is_ancestor(base_point.as_str(), branch_point.as_str())
                .await?
            {
                return Err(StackError::InvalidRelativeStructure {
                    base: self.base_branch.clone(),
                    relative: self.relative_branch.clone(),
                });
            }
        }

        self.commits = self
            .git
            .rev_list_headers(&self.head, Some(branch_point.as_str()))
            .await?;
        if self.commits.is_empty() {
            return Err(StackError::NoCommits(self.relative_branch.clone()));
        }

        for commit in self.commits.clone() {
            let parsed = directives::parse_message(&commit.message).map_err(|source| {
                StackError::Directive {
                    commit: commit.commit_id.short().to_string(),
                    subject: commit.subject().to_string(),
                    source,
                }
            })?;
            for unknown in &parsed.unknown {
                output::warn(
                    format!(
                        "unrecognized directive '{}' in commit {}",
                        unknown,
                        commit.commit_id.short()
                    ),
                    self.verbosity,
                );
            }

            let name = match parsed.directives.topic.clone() {
                Some(name) => name,
                None if auto_topic => directives::auto_topic_name(&parsed.trimmed),
                // No topic tag, not a revup commit.
                None => continue,
            };

            let mut commit = commit;
            if trim_tags {
                commit.message = parsed.trimmed.clone();
            }

            let index = match self.topic_index(&name) {
                Some(index) => index,
                None => {
                    self.topics.push(Topic {
                        name: name.clone(),
                        ..Topic::default()
                    });
                    self.topics.len() - 1
                }
            };
            let prefixed: Vec<String> = parsed
                .directives
                .branches
                .iter()
                .map(|b| self.git.ensure_branch_prefix(b))
                .collect();
            let relative_branch = parsed
                .directives
                .relative_branch
                .as_deref()
                .map(|b| self.git.ensure_branch_prefix(b));
            let topic = &mut self.topics[index];
            topic.commits.push(commit);
            merge_single(
                &mut topic.tags.relative,
                parsed.directives.relative,
                &name,
                "relative",
            )?;
            merge_single(
                &mut topic.tags.uploader,
                parsed.directives.uploader,
                &name,
                "uploader",
            )?;
            merge_single(
                &mut topic.tags.branch_format,
                parsed.directives.branch_format,
                &name,
                "branch-format",
            )?;
            merge_single(
                &mut topic.tags.relative_branch,
                relative_branch,
                &name,
                "relative-branch",
            )?;
            merge_single(
                &mut topic.tags.update_pr_body,
                parsed.directives.update_pr_body,
                &name,
                "update-pr-body",
            )?;
            directives::union_into(&mut topic.tags.branches, &prefixed);
            directives::union_into(&mut topic.tags.reviewers, &parsed.directives.reviewers);
            directives::union_into(&mut topic.tags.assignees, &parsed.directives.assignees);
            directives::union_into(&mut topic.tags.labels, &parsed.directives.labels);
        }

        if self.topics.is_empty() {
            return Err(StackError::NoTopics(self.commits.len()));
        }

        if !limit_topics.is_empty() {
            self.limit_to(limit_topics);
            if self.topics.is_empty() {
                return Err(StackError::NoTopics(self.commits.len()));
            }
        }
        Ok(())
    }

    /// Keep only the named topics and their relative ancestors.
    fn limit_to(&mut self, names: &[String]) {
        let mut keep: BTreeSet<String> = names.iter().cloned().collect();
        // Pull in relative ancestors so chains stay uploadable.
        loop {
            let mut grew = false;
            for topic in &self.topics {
                if keep.contains(&topic.name) {
                    if let Some(relative) = &topic.tags.relative {
                        grew |= keep.insert(relative.clone());
                    }
                }
            }
            if !grew {
                break;
            }
        }
        self.topics.retain(|t| keep.contains(&t.name));
    }

    // ----------------------------------------------------------------------
    // Stage 2: expand topics into reviews and validate the graph
    // ----------------------------------------------------------------------

    /// Create one review per (topic, base branch), resolving relativity and
    /// validating every graph constraint.
    pub async fn populate_reviews(&mut self, opts: &ReviewOptions) -> Result<(), StackError> {
        self.drop_skipped_topics(opts).await?;

        for index in 0..self.topics.len() {
            let name = self.topics[index].name.clone();

            let relative_name = if opts.relative_chain && index > 0 {
                Some(self.topics[index - 1].name.clone())
            } else if let Some(relative) = self.topics[index].tags.relative.clone() {
                match self.topic_index(&relative) {
                    Some(rel_index) if rel_index < index => Some(relative),
                    Some(_) => {
                        // Interleaved commits are fine, but the relative's
                        // first commit must come first. Prevents cycles.
                        return Err(StackError::RelativeOrder {
                            topic: name,
                            relative,
                        });
                    }
                    None => {
                        output::warn(
                            format!(
                                "Relative topic '{}' not found in stack, assuming it was merged",
                                relative
                            ),
                            self.verbosity,
                        );
                        None
                    }
                }
            } else {
                None
            };

            if let Some(relative) = relative_name {
                let rel_index = self
                    .topic_index(&relative)
                    .expect("relative resolved above");
                let (left, right) = self.topics.split_at_mut(index);
                let rel_topic = &left[rel_index];
                let topic = &mut right[0];
                topic.relative = Some(rel_index);

                if topic.tags.branches.is_empty() {
                    topic.tags.branches = rel_topic.tags.branches.clone();
                } else {
                    let extra: Vec<String> = topic
                        .tags
                        .branches
                        .iter()
                        .filter(|b| !rel_topic.tags.branches.contains(b))
                        .cloned()
                        .collect();
                    if !extra.is_empty() {
                        return Err(StackError::BranchesNotInRelative {
                            topic: name,
                            relative,
                            branches: extra,
                        });
                    }
                }

                if topic.tags.relative_branch.is_none() {
                    topic.tags.relative_branch = rel_topic.tags.relative_branch.clone();
                } else if topic.tags.relative_branch != rel_topic.tags.relative_branch {
                    return Err(StackError::RelativeBranchMismatch {
                        topic: name,
                        relative,
                    });
                }
            } else {
                let topic = &mut self.topics[index];
                if topic.tags.branches.is_empty() {
                    topic.tags.branches.push(self.base_branch.clone());
                    if topic.tags.relative_branch.is_none() {
                        // Only default the relative branch when the review
                        // uses the default base; an explicit base signals
                        // the user doesn't want it.
                        topic.tags.relative_branch = Some(self.relative_branch.clone());
                    }
                }
            }

            let topic_tags = self.topics[index].tags.clone();
            if topic_tags.relative_branch.is_some() && topic_tags.branches.len() > 1 {
                return Err(StackError::RelativeBranchWithMultipleBases(name));
            }

            // Every relative ancestor that sets an uploader must agree.
            if let Some(uploader) = &topic_tags.uploader {
                let mut ancestor = self.topics[index].relative;
                while let Some(a) = ancestor {
                    if let Some(other) = &self.topics[a].tags.uploader {
                        if other != uploader {
                            return Err(StackError::UploaderMismatch {
                                topic: name.clone(),
                                uploader: uploader.clone(),
                                relative: self.topics[a].name.clone(),
                                relative_uploader: other.clone(),
                            });
                        }
                    }
                    ancestor = self.topics[a].relative;
                }
            }
            let uploader = topic_tags
                .uploader
                .clone()
                .unwrap_or_else(|| opts.uploader.clone());

            {
                let topic = &mut self.topics[index];
                let subjects: Vec<String> = topic
                    .commits
                    .iter()
                    .filter_map(|c| directives::subject_prefix_label(c.subject()))
                    .collect();
                directives::union_into(&mut topic.tags.labels, &subjects);
                let extra: Vec<String> =
                    opts.labels.iter().map(|l| l.to_lowercase()).collect();
                directives::union_into(&mut topic.tags.labels, &extra);
                directives::apply_user_aliases(&mut topic.tags.reviewers, &opts.user_aliases);
                directives::apply_user_aliases(&mut topic.tags.assignees, &opts.user_aliases);
            }

            let branches = self.topics[index].tags.branches.clone();
            let relative_branch_tag = self.topics[index].tags.relative_branch.clone();
            let format = self.topics[index]
                .tags
                .branch_format
                .unwrap_or(self.branch_format);
            let is_draft = self.topics[index]
                .tags
                .labels
                .iter()
                .any(|l| l.eq_ignore_ascii_case("draft"));

            for branch in branches {
                let relative_branch = match &relative_branch_tag {
                    Some(rb) if *rb != branch => Some(rb.clone()),
                    _ => None,
                };
                let effective_base = relative_branch.clone().unwrap_or_else(|| branch.clone());
                let base_name = self.git.remove_branch_prefix(&branch).to_string();

                let mut review = Review {
                    topic: index,
                    base_branch: branch.clone(),
                    relative_branch,
                    remote_head: format.remote_branch(&uploader, &base_name, &name),
                    is_draft,
                    ..Review::default()
                };

                if let Some(rel_index) = self.topics[index].relative {
                    let parent_review = self.topics[rel_index]
                        .reviews
                        .iter()
                        .find(|(b, _)| *b == branch)
                        .map(|(_, r)| *r)
                        .ok_or_else(|| {
                            StackError::Internal(format!(
                                "relative topic '{}' has no review for base {}",
                                self.topics[rel_index].name, branch
                            ))
                        })?;
                    review.remote_base = self.reviews[parent_review].remote_head.clone();
                    // base_ref stays empty until the relative's head exists.
                    let review_index = self.reviews.len();
                    self.reviews[parent_review].children.push(review_index);
                } else {
                    review.base_ref = if effective_base == self.relative_branch {
                        Some(
                            self.commits[0]
                                .first_parent()
                                .ok_or_else(|| {
                                    StackError::Internal("stack starts at a root commit".into())
                                })?
                                .clone(),
                        )
                    } else {
                        Some(self.git.resolve_commit(&effective_base).await?)
                    };
                    review.remote_base =
                        self.git.remove_branch_prefix(&effective_base).to_string();
                }

                let review_index = self.reviews.len();
                self.reviews.push(review);
                self.topics[index].reviews.push((branch, review_index));
            }

            {
                // Draft is PR state, not a label.
                let topic = &mut self.topics[index];
                topic.tags.labels.retain(|l| !l.eq_ignore_ascii_case("draft"));

                match opts.auto_add_users {
                    AutoAddUsers::No => {}
                    AutoAddUsers::ReviewersToAssignees => {
                        let reviewers = topic.tags.reviewers.clone();
                        directives::union_into(&mut topic.tags.assignees, &reviewers);
                    }
                    AutoAddUsers::AssigneesToReviewers => {
                        let assignees = topic.tags.assignees.clone();
                        directives::union_into(&mut topic.tags.reviewers, &assignees);
                    }
                    AutoAddUsers::Both => {
                        let reviewers = topic.tags.reviewers.clone();
                        let assignees = topic.tags.assignees.clone();
                        directives::union_into(&mut topic.tags.assignees, &reviewers);
                        directives::union_into(&mut topic.tags.reviewers, &assignees);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop topics that are not self-authored (when requested) or whose
    /// commits are all empty, re-pointing relatives through the dropped
    /// topics.
    async fn drop_skipped_topics(&mut self, opts: &ReviewOptions) -> Result<(), StackError> {
        let mut dropped: Vec<bool> = vec![false; self.topics.len()];

        if opts.self_authored_only {
            for (i, topic) in self.topics.iter().enumerate() {
                let self_authored = topic
                    .commits
                    .iter()
                    .any(|c| c.author_email.to_lowercase() == self.git.email);
                if !self_authored {
                    output::print(
                        format!(
                            "Skipping topic '{}' since it has no self-authored commits, \
                             pass '--no-self-authored-only' to override",
                            topic.name
                        ),
                        self.verbosity,
                    );
                    dropped[i] = true;
                }
            }
        }

        // Topics whose commits are all empty have nothing to review.
        let local_trees: HashMap<&CommitHash, &TreeHash> = self
            .commits
            .iter()
            .map(|c| (&c.commit_id, &c.tree))
            .collect();
        for i in 0..self.topics.len() {
            if dropped[i] {
                continue;
            }
            let mut all_empty = true;
            for commit in self.topics[i].commits.clone() {
                let Some(parent) = commit.first_parent() else {
                    all_empty = false;
                    break;
                };
                let parent_tree = match local_trees.get(parent) {
                    Some(tree) => (*tree).clone(),
                    None => self.git.tree_of(parent.as_str()).await?,
                };
                if parent_tree != commit.tree {
                    all_empty = false;
                    break;
                }
            }
            if all_empty {
                output::print(
                    format!("Skipping topic '{}': all commits are empty", self.topics[i].name),
                    self.verbosity,
                );
                dropped[i] = true;
            }
        }

        if !dropped.iter().any(|d| *d) {
            return Ok(());
        }

        // Re-point relatives through dropped topics before removal.
        let name_of: Vec<String> = self.topics.iter().map(|t| t.name.clone()).collect();
        let relative_of: Vec<Option<String>> = self
            .topics
            .iter()
            .map(|t| t.tags.relative.clone())
            .collect();
        let index_of: HashMap<&str, usize> = name_of
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        for topic in &mut self.topics {
            let mut relative = topic.tags.relative.clone();
            while let Some(name) = &relative {
                match index_of.get(name.as_str()) {
                    Some(&i) if dropped[i] => relative = relative_of[i].clone(),
                    _ => break,
                }
            }
            topic.tags.relative = relative;
        }

        let mut kept = 0;
        self.topics.retain(|_| {
            let keep = !dropped[kept];
            kept += 1;
            keep
        });
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Stage 3: forge query plumbing
    // ----------------------------------------------------------------------

    /// Everything the batched forge query needs.
    pub fn query_inputs(&mut self) -> QueryInputs {
        let mut head_refs: Vec<String> =
            self.reviews.iter().map(|r| r.remote_head.clone()).collect();

        let mut users: BTreeSet<String> = BTreeSet::new();
        let mut labels: BTreeSet<String> = BTreeSet::new();
        for topic in &self.topics {
            users.extend(topic.tags.reviewers.iter().cloned());
            users.extend(topic.tags.assignees.iter().cloned());
            labels.extend(topic.tags.labels.iter().cloned());
            for (branch, _) in &topic.reviews {
                // The base branch name doubles as a label that shows all
                // changes targeting that branch.
                labels.insert(self.git.remove_branch_prefix(branch).to_string());
            }
        }

        let relative_targets: BTreeSet<String> = self
            .reviews
            .iter()
            .filter_map(|r| r.relative_branch.as_deref())
            .map(|rb| self.git.remove_branch_prefix(rb).to_string())
            .collect();
        self.relative_query = relative_targets.into_iter().collect();
        head_refs.extend(self.relative_query.iter().cloned());

        QueryInputs {
            head_refs,
            users: users.into_iter().collect(),
            labels: labels.into_iter().collect(),
        }
    }

    /// Absorb the forge query: attach PR infos, classify, and match the
    /// comment slots used by the review-graph and patchsets features.
    pub fn absorb_query(&mut self, query: RepoQuery) {
        for name in &query.unresolved_users {
            output::warn(format!("No matching user found for '{}'", name), self.verbosity);
        }
        for name in &query.unresolved_labels {
            output::warn(
                format!("Couldn't find an existing label named '{}'", name),
                self.verbosity,
            );
        }

        let mut prs = query.prs.clone().into_iter();
        for review in &mut self.reviews {
            let pr = prs.next().flatten();
            match &pr {
                None => review.status = PrStatus::New,
                Some(info) if info.state == Some(PrState::Merged) => {
                    review.status = PrStatus::Merged
                }
                Some(_) => {}
            }
            review.pr_info = pr;
        }
        for (name, pr) in self.relative_query.iter().zip(prs) {
            if let Some(pr) = pr {
                self.relative_infos.insert(name.clone(), pr);
            }
        }
        self.query = query;
    }

    /// Node id of the repository, from the absorbed query.
    pub fn repo_id(&self) -> &str {
        &self.query.repo_id
    }

    /// Fetch any remote PR heads that are missing locally, so rebase
    /// detection can walk them.
    pub async fn fetch_missing_objects(&self) -> Result<(), StackError> {
        let mut to_fetch = Vec::new();
        for review in &self.reviews {
            if let Some(oid) = review.pr_info.as_ref().and_then(|p| p.head_oid.clone()) {
                if !self.git.commit_exists(&oid).await? {
                    to_fetch.push(oid);
                }
            }
        }
        self.git.fetch_objects(&to_fetch).await?;
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Stage 4: rebase detection
    // ----------------------------------------------------------------------

    async fn ensure_topic_fingerprints(&mut self, topic_idx: usize) -> Result<(), StackError> {
        if self.topics[topic_idx].fingerprints.is_some() {
            return Ok(());
        }
        let commits = self.topics[topic_idx].commits.clone();
        let mut prints = Vec::with_capacity(commits.len());
        for commit in &commits {
            prints.push(self.fingerprint_of(commit).await?);
        }
        self.topics[topic_idx].fingerprints = Some(prints);
        Ok(())
    }

    async fn fingerprint_of(&self, commit: &CommitHeader) -> Result<String, StackError> {
        match commit.first_parent() {
            Some(parent) => Ok(self.git.patch_fingerprint(parent, &commit.commit_id).await?),
            None => Ok(String::new()),
        }
    }

    /// Compare every review against its remote counterpart and decide which
    /// pushes can be skipped: identical branches, pure rebases, and merged
    /// changes.
    pub async fn mark_rebases(&mut self, skip_rebase: bool) -> Result<(), StackError> {
        for idx in 0..self.reviews.len() {
            let topic_idx = self.reviews[idx].topic;
            let base_branch = self.reviews[idx].base_branch.clone();

            // A merged relative branch re-targets the review directly onto
            // its base branch.
            if let Some(rb) = self.reviews[idx].relative_branch.clone() {
                let rb_name = self.git.remove_branch_prefix(&rb).to_string();
                match self.relative_infos.get(&rb_name) {
                    None => {
                        output::warn(
                            format!("Failed to look up relative PR for branch {}", rb_name),
                            self.verbosity,
                        );
                    }
                    Some(info) if info.state == Some(PrState::Merged) => {
                        self.reviews[idx].relative_branch = None;
                        if self.topics[topic_idx].relative.is_none() {
                            // Only the first review in a chain needs a reset.
                            let base_ref = if base_branch == self.base_branch {
                                self.commits[0]
                                    .first_parent()
                                    .cloned()
                                    .ok_or_else(|| {
                                        StackError::Internal("stack starts at a root commit".into())
                                    })?
                            } else {
                                self.git.resolve_commit(&base_branch).await?
                            };
                            let remote_base =
                                self.git.remove_branch_prefix(&base_branch).to_string();
                            let review = &mut self.reviews[idx];
                            review.base_ref = Some(base_ref);
                            review.remote_base = remote_base;
                        }
                    }
                    Some(_) => {}
                }
            }

            // A merged relative topic likewise collapses onto the base.
            if let Some(rel) = self.relative_review(idx) {
                if self.reviews[rel].status == PrStatus::Merged {
                    self.reviews[idx].remote_base =
                        self.git.remove_branch_prefix(&base_branch).to_string();
                }
            }

            // Merged into a different branch than expected: recreate.
            {
                let review = &self.reviews[idx];
                if review.status == PrStatus::Merged {
                    if let Some(info) = &review.pr_info {
                        if info.base_ref != review.remote_base {
                            output::warn(
                                format!(
                                    "Branch {} was merged into {} instead of {} as expected",
                                    review.remote_head, info.base_ref, review.remote_base
                                ),
                                self.verbosity,
                            );
                            self.reviews[idx].status = PrStatus::New;
                        }
                    }
                }
            }

            let mut stays_pushed = false;
            if self.reviews[idx].pr_info.is_none() {
                // A new PR; no fingerprints to compare.
                self.reviews[idx].is_pure_rebase = false;
            } else {
                self.ensure_topic_fingerprints(topic_idx).await?;

                let (head_oid, base_oid) = {
                    let info = self.reviews[idx].pr_info.as_ref().expect("checked above");
                    (info.head_oid.clone(), info.base_oid.clone())
                };
                let remote_commits = match (&head_oid, &base_oid) {
                    (Some(head), Some(base)) => {
                        self.git
                            .rev_list_headers(head.as_str(), Some(base.as_str()))
                            .await?
                    }
                    _ => Vec::new(),
                };
                let mut remote_prints = Vec::with_capacity(remote_commits.len());
                for commit in &remote_commits {
                    remote_prints.push(self.fingerprint_of(commit).await?);
                }

                let topic = &self.topics[topic_idx];
                let local_prints = topic.fingerprints.as_ref().expect("ensured above");
                let is_rebase = remote_commits.len() == topic.commits.len()
                    && local_prints
                        .iter()
                        .zip(&remote_prints)
                        .all(|(a, b)| a == b);
                let is_pure = is_rebase
                    && topic
                        .commits
                        .iter()
                        .zip(&remote_commits)
                        .all(|(a, b)| a.matches(b));
                output::debug(
                    format!(
                        "Review {}/{} is rebase {} pure {}",
                        base_branch, topic.name, is_rebase, is_pure
                    ),
                    self.verbosity,
                );

                self.reviews[idx].remote_commits = remote_commits;
                self.reviews[idx].is_pure_rebase = is_pure;

                if is_rebase && !is_pure {
                    if self.reviews[idx].status == PrStatus::Merged {
                        // Reworded but already merged; nothing to update.
                        output::warn(
                            format!(
                                "Review for {} was reworded but has already been merged",
                                topic.name
                            ),
                            self.verbosity,
                        );
                        self.reviews[idx].is_pure_rebase = true;
                    } else {
                        // Content matches but metadata changed: re-push.
                        stays_pushed = true;
                    }
                }
            }

            if !stays_pushed {
                let review = &self.reviews[idx];
                if review.is_pure_rebase && review.pr_info.is_some() {
                    let rel = self.relative_review(idx);

                    // Relative reviews are only ever uploaded directly on
                    // top of each other; a broken chain forces a re-upload
                    // so CI diffs stay consistent.
                    let is_on_top_of_relative = match rel {
                        None => true,
                        Some(r) => {
                            let relative = &self.reviews[r];
                            relative.pr_info.is_none()
                                || review
                                    .remote_commits
                                    .first()
                                    .and_then(|c| c.first_parent())
                                    == relative.remote_commits.last().map(|c| &c.commit_id)
                        }
                    };
                    let relative_is_nochange = rel
                        .map(|r| self.reviews[r].push_status == PushStatus::NoChange)
                        .unwrap_or(false);
                    let relative_is_skippable = rel
                        .map(|r| self.reviews[r].push_status != PushStatus::Pushed)
                        .unwrap_or(true);

                    let base_unmoved = review.base_ref.as_ref().is_some()
                        && review.base_ref.as_ref()
                            == review.remote_commits.first().and_then(|c| c.first_parent());

                    if base_unmoved || (relative_is_nochange && is_on_top_of_relative) {
                        self.reviews[idx].push_status = PushStatus::NoChange;
                    } else if review.status == PrStatus::Merged
                        || (skip_rebase && is_on_top_of_relative && relative_is_skippable)
                    {
                        self.reviews[idx].push_status = PushStatus::Rebase;
                    }

                    if self.reviews[idx].push_status == PushStatus::NoChange {
                        // Copy remote ids so child topics cherry-pick onto
                        // the exact remote point.
                        self.reviews[idx].new_commits = self.reviews[idx]
                            .remote_commits
                            .iter()
                            .map(|c| c.commit_id.clone())
                            .collect();
                    }
                } else if review.status == PrStatus::Merged {
                    // "Merged" but carrying new content: a new PR.
                    self.reviews[idx].status = PrStatus::New;
                }
            }

            // A pushed review forces every rebase-skipped ancestor to push
            // too, otherwise the forge shows wrong inter-branch diffs.
            if self.reviews[idx].push_status == PushStatus::Pushed {
                let mut cursor = self.relative_review(idx);
                while let Some(ancestor) = cursor {
                    if self.reviews[ancestor].push_status != PushStatus::Rebase {
                        break;
                    }
                    self.reviews[ancestor].push_status = PushStatus::Pushed;
                    if self.reviews[ancestor].status == PrStatus::Merged {
                        output::warn(
                            format!(
                                "Attempted to rebase an already merged PR {}",
                                self.topics[self.reviews[ancestor].topic].name
                            ),
                            self.verbosity,
                        );
                        output::warn("'git pull' and upload again to fix this.", self.verbosity);
                    }
                    cursor = self.relative_review(ancestor);
                }
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Stage 5: branch synthesis
    // ----------------------------------------------------------------------

    /// Synthesize branch heads for every review that will be pushed, by
    /// cherry-picking each commit onto the computed parent.
    ///
    /// A conflict aborts the entire upload before anything is pushed.
    pub async fn create_commits(&mut self, trim_tags: bool) -> Result<(), StackError> {
        for idx in 0..self.reviews.len() {
            if self.reviews[idx].push_status != PushStatus::Pushed {
                continue;
            }
            let topic_idx = self.reviews[idx].topic;

            if let Some(rel) = self.relative_review(idx) {
                let parent_head = self.reviews[rel].new_commits.last().cloned();
                let Some(parent_head) = parent_head else {
                    return Err(StackError::Internal(format!(
                        "relative topic '{}' is missing commits (status {})",
                        self.topics[self.reviews[rel].topic].name,
                        self.reviews[rel].push_status.as_str()
                    )));
                };
                self.reviews[idx].base_ref = Some(parent_head);
            }
            let base_ref = self.reviews[idx]
                .base_ref
                .clone()
                .ok_or_else(|| StackError::Internal("review has no base ref".into()))?;

            let commits = self.topics[topic_idx].commits.clone();
            let sole_commit = commits.len() == 1;
            let mut next_parent = base_ref.clone();
            let mut current_tree = self.git.tree_of(next_parent.as_str()).await?;
            let mut new_commits = Vec::with_capacity(commits.len());

            for commit in &commits {
                if commit.first_parent() == Some(&next_parent) && !trim_tags {
                    // Already in the right place; no need to recreate it.
                    new_commits.push(commit.commit_id.clone());
                    next_parent = commit.commit_id.clone();
                    current_tree = commit.tree.clone();
                    continue;
                }

                let tree = match self.git.pick_tree(commit, &next_parent).await {
                    Ok(tree) => tree,
                    Err(GitError::Conflict(conflict)) => {
                        let parent_desc = if next_parent != base_ref {
                            "the same topic".to_string()
                        } else if let Some(rel_index) = self.topics[topic_idx].relative {
                            format!("relative topic \"{}\"", self.topics[rel_index].name)
                        } else {
                            format!(
                                "base branch \"{}\"",
                                self.git.remove_branch_prefix(&self.reviews[idx].base_branch)
                            )
                        };
                        return Err(StackError::CherryPick {
                            topic: self.topics[topic_idx].name.clone(),
                            commit: commit.commit_id.short().to_string(),
                            subject: commit.subject().to_string(),
                            parent: next_parent.short().to_string(),
                            parent_desc,
                            paths: conflict
                                .conflicting_paths()
                                .iter()
                                .map(|p| p.to_string())
                                .collect(),
                        });
                    }
                    Err(err) => return Err(err.into()),
                };

                if tree == current_tree && !sole_commit {
                    // The commit adds nothing on its new parent.
                    continue;
                }

                let author = Signature {
                    name: commit.author_name.clone(),
                    email: commit.author_email.clone(),
                    date: commit.author_date.clone(),
                };
                let new_commit = self
                    .git
                    .commit_tree(
                        &tree,
                        &[&next_parent],
                        &author,
                        &self.git.committer(),
                        &commit.message,
                    )
                    .await?;
                new_commits.push(new_commit.clone());
                next_parent = new_commit;
                current_tree = tree;
            }

            if new_commits.is_empty() {
                self.reviews[idx].push_status = PushStatus::NoChange;
                continue;
            }
            self.reviews[idx].new_commits = new_commits;

            // Building the branch can reveal it matches the remote exactly,
            // e.g. a patch that became a no-op against the new base.
            let review = &mut self.reviews[idx];
            if let Some(info) = &review.pr_info {
                if info.head_oid.as_ref() == review.new_commits.last() {
                    review.push_status = PushStatus::NoChange;
                    if review.status == PrStatus::New {
                        review.status = PrStatus::Merged;
                    }
                }
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Stage 6: pushes
    // ----------------------------------------------------------------------

    /// The batch of refs to push, with per-ref leases.
    pub fn push_targets(&self, uploader: &str) -> Vec<PushTarget> {
        let mut targets = Vec::new();
        for review in &self.reviews {
            if review.push_status != PushStatus::Pushed || review.status == PrStatus::Merged {
                continue;
            }
            let Some(oid) = review.new_commits.last() else {
                continue;
            };
            let lease = match &review.pr_info {
                None => PushLease::Absent,
                Some(info) if info.state == Some(PrState::Merged) => PushLease::Force,
                Some(info) => info
                    .head_oid
                    .clone()
                    .map(PushLease::Expect)
                    .unwrap_or(PushLease::Tracking),
            };
            targets.push(PushTarget {
                oid: oid.clone(),
                branch: review.remote_head.clone(),
                lease,
            });
        }
        if let Some(vdt) = &self.last_virtual_diff_target {
            targets.push(PushTarget {
                oid: vdt.clone(),
                branch: format!("revup/{}/virtual_diff_targets", uploader),
                lease: PushLease::Force,
            });
        }
        targets
    }

    /// Record push results; rejected reviews take no further mutations.
    /// Returns the number of rejected refs.
    pub fn apply_push_outcomes(&mut self, outcomes: &[PushOutcome]) -> usize {
        let mut rejected = 0;
        for outcome in outcomes {
            let Some(reason) = &outcome.rejection else {
                continue;
            };
            rejected += 1;
            output::warn(
                format!(
                    "push of {} was rejected ({}); the remote moved since the last query. \
                     Fetch and upload again to recover.",
                    outcome.branch, reason
                ),
                self.verbosity,
            );
            if let Some(review) = self
                .reviews
                .iter_mut()
                .find(|r| r.remote_head == outcome.branch)
            {
                review.push_rejected = true;
            }
        }
        rejected
    }

    /// Create or move local branches mirroring the pushed refs.
    pub async fn create_local_branches(&self) -> Result<(), StackError> {
        for review in &self.reviews {
            if review.push_status != PushStatus::Pushed
                || review.status == PrStatus::Merged
                || review.push_rejected
            {
                continue;
            }
            if let Some(oid) = review.new_commits.last() {
                self.git.update_local_branch(&review.remote_head, oid).await?;
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Stage 7: PR metadata reconciliation
    // ----------------------------------------------------------------------

    /// Compute the minimal PR mutations: new PR payloads for `new` reviews
    /// and field-by-field diffs for existing ones.
    pub fn populate_update_info(&mut self, update_pr_body: bool) {
        for topic_idx in 0..self.topics.len() {
            let topic = &self.topics[topic_idx];
            let title_commit = topic
                .commits
                .iter()
                .find(|c| !c.subject().is_empty())
                .unwrap_or(&topic.commits[0]);
            let title = title_commit.subject().to_string();
            let body = title_commit.body().to_string();
            let update_body = topic.tags.update_pr_body.unwrap_or(update_pr_body);
            let labels = topic.tags.labels.clone();
            let reviewers = topic.tags.reviewers.clone();
            let assignees = topic.tags.assignees.clone();
            let review_ids: Vec<usize> = topic.reviews.iter().map(|(_, r)| *r).collect();

            for review_idx in review_ids {
                if self.reviews[review_idx].push_rejected {
                    continue;
                }

                if self.reviews[review_idx].status == PrStatus::New {
                    let review = &mut self.reviews[review_idx];
                    review.pr_info = Some(PrInfo {
                        base_ref: review.remote_base.clone(),
                        head_ref: review.remote_head.clone(),
                        base_oid: review.base_ref.clone(),
                        head_oid: review.new_commits.last().cloned(),
                        title: title.clone(),
                        body: body.clone(),
                        is_draft: review.is_draft,
                        ..PrInfo::default()
                    });
                }

                let review = &self.reviews[review_idx];
                let Some(info) = &review.pr_info else {
                    continue;
                };
                if review.status == PrStatus::Merged {
                    continue;
                }

                // Claim a comment slot for each maintained comment: an
                // existing comment that looks like ours, or the next free
                // position.
                let mut graph_index = None;
                let mut patchsets_index = None;
                for i in 0..MAX_COMMENTS_TO_QUERY {
                    if i >= info.comments.len() {
                        if graph_index.is_none() {
                            graph_index = Some(i);
                        } else if patchsets_index.is_none() {
                            patchsets_index = Some(i);
                        }
                    } else if info.comments[i].text.starts_with(comments::REVIEW_GRAPH_HEADER) {
                        graph_index = Some(i);
                    } else if info.comments[i].text.starts_with(comments::PATCHSETS_HEADER) {
                        patchsets_index = Some(i);
                    }
                }

                // The base branch name doubles as a label when it exists.
                let mut wanted_labels: BTreeSet<String> = labels.iter().cloned().collect();
                let base_label = self
                    .git
                    .remove_branch_prefix(&review.base_branch)
                    .to_string();
                if self.query.label_ids.contains_key(&base_label) {
                    wanted_labels.insert(base_label);
                }

                let label_ids: BTreeSet<String> = wanted_labels
                    .iter()
                    .filter_map(|l| self.query.label_ids.get(l))
                    .filter(|id| !info.label_ids.contains(*id))
                    .cloned()
                    .collect();
                let valid_labels: BTreeSet<String> = wanted_labels
                    .iter()
                    .filter(|l| self.query.label_ids.contains_key(*l))
                    .cloned()
                    .collect();

                // Re-requesting an existing reviewer would clear their
                // "reviewed" state in the UI, so only add missing ones.
                let reviewer_ids: BTreeSet<String> = reviewers
                    .iter()
                    .filter_map(|n| self.query.user_ids.get(n))
                    .filter(|id| !info.reviewer_ids.contains(*id))
                    .cloned()
                    .collect();
                let reviewer_logins: BTreeSet<String> = reviewers
                    .iter()
                    .filter_map(|n| self.query.user_logins.get(n))
                    .filter(|l| !info.reviewers.contains(*l))
                    .cloned()
                    .collect();
                let assignee_ids: BTreeSet<String> = assignees
                    .iter()
                    .filter_map(|n| self.query.user_ids.get(n))
                    .filter(|id| !info.assignee_ids.contains(*id))
                    .cloned()
                    .collect();
                let assignee_logins: BTreeSet<String> = assignees
                    .iter()
                    .filter_map(|n| self.query.user_logins.get(n))
                    .filter(|l| !info.assignees.contains(*l))
                    .cloned()
                    .collect();

                let review = &mut self.reviews[review_idx];
                let info = review.pr_info.as_mut().expect("checked above");
                if info.base_ref != review.remote_base {
                    review.pr_update.base_ref = Some(review.remote_base.clone());
                }
                if update_body && info.body != body {
                    review.pr_update.body = Some(body.clone());
                }
                if update_body && info.title != title {
                    review.pr_update.title = Some(title.clone());
                }
                if info.is_draft != review.is_draft {
                    review.pr_update.is_draft = Some(review.is_draft);
                }
                review.pr_update.label_ids = label_ids;
                review.pr_update.reviewer_ids = reviewer_ids;
                review.pr_update.assignee_ids = assignee_ids;
                review.review_graph_index = graph_index;
                review.patchsets_index = patchsets_index;

                info.reviewers.extend(reviewer_logins);
                info.assignees.extend(assignee_logins);
                info.labels.extend(valid_labels);
            }
        }
    }

    /// Indexes of reviews whose PRs need creation, in review order.
    pub fn prs_to_create(&self) -> Vec<usize> {
        (0..self.reviews.len())
            .filter(|&idx| {
                let review = &self.reviews[idx];
                review.status == PrStatus::New
                    && review.pr_info.is_some()
                    && !review.push_rejected
            })
            .collect()
    }

    /// Gather the non-empty updates and mark their reviews as updated.
    pub fn prs_to_update(&mut self) -> Vec<PrUpdate> {
        let mut updates = Vec::new();
        for review in &mut self.reviews {
            let Some(info) = &review.pr_info else {
                continue;
            };
            if review.push_rejected || review.pr_update.is_empty() || info.id.is_empty() {
                continue;
            }
            review.pr_update.id = info.id.clone();
            updates.push(review.pr_update.clone());
            if review.status != PrStatus::New {
                review.status = PrStatus::Updated;
            }
        }
        updates
    }

    // ----------------------------------------------------------------------
    // Stage 8: comments
    // ----------------------------------------------------------------------

    /// Render the review-graph comment for every review in a relative
    /// chain, queueing comment creations/edits on the pr updates.
    pub fn populate_review_graph(&mut self) {
        // Build one rendered chain per root, shared by all its members.
        let mut chain_of: HashMap<usize, String> = HashMap::new();
        for root in 0..self.reviews.len() {
            if self.topics[self.reviews[root].topic].relative.is_some() {
                continue;
            }
            let mut members = Vec::new();
            let mut nodes = Vec::new();
            self.collect_chain(root, &mut members, &mut nodes);
            if nodes.is_empty() {
                continue;
            }
            let chain = comments::render_chain(&nodes, 0);
            for member in members {
                chain_of.insert(member, chain.clone());
            }
        }

        for idx in 0..self.reviews.len() {
            let review = &self.reviews[idx];
            let (Some(graph_index), Some(info)) = (review.review_graph_index, &review.pr_info)
            else {
                continue;
            };
            if review.status == PrStatus::Merged || review.push_rejected || info.id.is_empty() {
                continue;
            }
            let Some(chain) = chain_of.get(&idx) else {
                continue;
            };
            let title = review
                .pr_update
                .title
                .clone()
                .unwrap_or_else(|| info.title.clone());
            let text = comments::render_review_graph(chain, &info.url, &title);

            let review = &mut self.reviews[idx];
            let info = review.pr_info.as_ref().expect("checked above");
            if graph_index < info.comments.len() {
                if info.comments[graph_index].text != text {
                    review.pr_update.comments.push(crate::forge::PrComment {
                        id: info.comments[graph_index].id.clone(),
                        text,
                    });
                }
            } else {
                // New graph comments go first so they sit at the top.
                review
                    .pr_update
                    .comments
                    .insert(0, crate::forge::PrComment { id: None, text });
            }
        }
    }

    /// Depth-first collection of a chain's reviews into graph nodes.
    /// Reviews without a PR are skipped along with their subtrees.
    fn collect_chain(
        &self,
        review_idx: usize,
        members: &mut Vec<usize>,
        nodes: &mut Vec<comments::GraphNode>,
    ) {
        let review = &self.reviews[review_idx];
        let Some(info) = &review.pr_info else {
            return;
        };
        if info.url.is_empty() {
            return;
        }
        let node_index = nodes.len();
        members.push(review_idx);
        nodes.push(comments::GraphNode {
            url: info.url.clone(),
            title: review
                .pr_update
                .title
                .clone()
                .unwrap_or_else(|| info.title.clone()),
            children: Vec::new(),
        });
        for &child in &review.children {
            let child_node = nodes.len();
            let before = nodes.len();
            self.collect_chain(child, members, nodes);
            if nodes.len() > before {
                nodes[node_index].children.push(child_node);
            }
        }
    }

    /// Append a patchsets row for every pushed review, queueing comment
    /// creations/edits on the pr updates.
    pub async fn populate_patchsets(&mut self, repo: &RepoHandle) -> Result<(), StackError> {
        let date = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        for idx in 0..self.reviews.len() {
            let review = &self.reviews[idx];
            if review.push_status != PushStatus::Pushed
                || review.status == PrStatus::Merged
                || review.push_rejected
            {
                continue;
            }
            let (Some(patchsets_index), Some(info), Some(base_ref), Some(head)) = (
                review.patchsets_index,
                review.pr_info.clone(),
                review.base_ref.clone(),
                review.new_commits.last().cloned(),
            ) else {
                continue;
            };

            let existing = info.comments.get(patchsets_index).cloned();
            let (number, original_text) = match &existing {
                None => (0, None),
                Some(comment) => match comments::next_number(&comment.text) {
                    // Another bot's comment sits in the slot; leave it be.
                    None => continue,
                    Some(number) => (number, Some(comment.text.clone())),
                },
            };

            let is_pure_rebase = review.is_pure_rebase;
            let status = review.status;
            let row = if is_pure_rebase {
                comments::PatchsetRow {
                    number,
                    head: comments::commit_link(&repo.owner, &repo.name, &head),
                    base: comments::commit_link(&repo.owner, &repo.name, &base_ref),
                    diff: "rebase".to_string(),
                    upstream_diff: "rebase".to_string(),
                    date: date.clone(),
                    summary: "0 files changed".to_string(),
                }
            } else {
                // Plain diff: against the previous head when one exists.
                let prev_head = match (&info.head_oid, status) {
                    (Some(prev), s) if s != PrStatus::New => prev.clone(),
                    _ => base_ref.clone(),
                };
                // Upstream-aware diff: a virtual target hides base movement.
                let upstream_base = match (&info.base_oid, &info.head_oid, status) {
                    (Some(old_base), Some(old_head), s)
                        if s != PrStatus::New && *old_base != base_ref =>
                    {
                        let target = self
                            .git
                            .make_virtual_diff_target(
                                old_base,
                                old_head,
                                &base_ref,
                                &head,
                                self.last_virtual_diff_target.as_ref(),
                            )
                            .await?;
                        self.last_virtual_diff_target = Some(target.clone());
                        target
                    }
                    _ => prev_head.clone(),
                };
                let mut summary = self
                    .git
                    .diff_summary(upstream_base.as_str(), head.as_str())
                    .await?;
                if summary.is_empty() {
                    summary = "0 files changed".to_string();
                }
                comments::PatchsetRow {
                    number,
                    head: comments::commit_link(&repo.owner, &repo.name, &head),
                    base: comments::commit_link(&repo.owner, &repo.name, &base_ref),
                    diff: comments::compare_link(&repo.owner, &repo.name, &prev_head, &head),
                    upstream_diff: comments::compare_link(
                        &repo.owner,
                        &repo.name,
                        &upstream_base,
                        &head,
                    ),
                    date: date.clone(),
                    summary,
                }
            };

            let text = comments::append_row(original_text.as_deref(), &row);
            self.reviews[idx]
                .pr_update
                .comments
                .push(crate::forge::PrComment {
                    id: existing.and_then(|c| c.id),
                    text,
                });
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Reporting
    // ----------------------------------------------------------------------

    /// Number of reviews that require some action (push, create, update).
    pub fn num_reviews_changed(&self) -> usize {
        self.reviews
            .iter()
            .filter(|r| {
                !(matches!(r.status, PrStatus::NoChange | PrStatus::Merged)
                    && r.push_status != PushStatus::Pushed)
            })
            .count()
    }

    /// Print the current plan, newest topic first.
    pub fn print(&self, skip_unchanged: bool) {
        if skip_unchanged && self.num_reviews_changed() == 0 {
            output::print("Nothing to upload!", self.verbosity);
            return;
        }

        for topic in self.topics.iter().rev() {
            for (base, review_idx) in &topic.reviews {
                let review = &self.reviews[*review_idx];
                if skip_unchanged
                    && review.status == PrStatus::NoChange
                    && review.push_status != PushStatus::Pushed
                {
                    continue;
                }
                output::print("", self.verbosity);

                let mut arrow = String::new();
                if let Some(rel) = topic.relative {
                    let ellipsis = if self.topics[rel].relative.is_some() {
                        "… → "
                    } else {
                        ""
                    };
                    arrow = format!("{} → {}", self.topics[rel].name, ellipsis);
                }
                if let Some(rb) = &review.relative_branch {
                    arrow.push_str(&format!("{} → ", rb));
                }
                let draft = if review.is_draft { " (draft)" } else { "" };
                output::print(
                    format!("Topic: {}{} → {}{}", topic.name, draft, arrow, base),
                    self.verbosity,
                );
                output::debug(
                    format!("Base rev: {:?}", review.base_ref),
                    self.verbosity,
                );

                let (reviewers, assignees, labels) = match &review.pr_info {
                    Some(info) => (
                        info.reviewers.iter().cloned().collect::<Vec<_>>(),
                        info.assignees.iter().cloned().collect::<Vec<_>>(),
                        info.labels.iter().cloned().collect::<Vec<_>>(),
                    ),
                    None => (
                        topic.tags.reviewers.clone(),
                        topic.tags.assignees.clone(),
                        topic.tags.labels.clone(),
                    ),
                };
                if !reviewers.is_empty() {
                    output::print(format!("Reviewers: {}", reviewers.join(", ")), self.verbosity);
                }
                if !assignees.is_empty() {
                    output::print(format!("Assignees: {}", assignees.join(", ")), self.verbosity);
                }
                if !labels.is_empty() {
                    output::print(format!("Labels: {}", labels.join(", ")), self.verbosity);
                }
                output::print("Commits:", self.verbosity);
                for commit in &topic.commits {
                    output::print(format!("  {}", commit.subject()), self.verbosity);
                }
                if let Some(info) = &review.pr_info {
                    if !info.url.is_empty() {
                        let mut status = format!("({})", review.status.as_str());
                        if review.push_status != PushStatus::NoChange {
                            status.push_str(&format!(" ({})", review.push_status.as_str()));
                        }
                        output::print(format!("  {} {}", info.url, status), self.verbosity);
                    }
                }
            }
        }
    }
}

/// Merge a single-valued directive across commits of the same topic:
/// either side may be unset, but set values must agree.
fn merge_single<T: PartialEq>(
    slot: &mut Option<T>,
    value: Option<T>,
    topic: &str,
    directive: &str,
) -> Result<(), StackError> {
    match (slot.as_ref(), value) {
        (_, None) => Ok(()),
        (None, Some(value)) => {
            *slot = Some(value);
            Ok(())
        }
        (Some(current), Some(value)) => {
            if *current == value {
                Ok(())
            } else {
                Err(StackError::ConflictingValues {
                    topic: topic.to_string(),
                    directive: directive.to_string(),
                })
            }
        }
    }
}
