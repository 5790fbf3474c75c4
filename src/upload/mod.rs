//! upload
//!
//! The upload pipeline: drive the topic stack through its stages, push the
//! synthesized branches, and reconcile pull requests.
//!
//! # Ordering
//!
//! - Validation and cherry-picking complete before any push or API call
//! - Refs push after all synthesis succeeds
//! - Per review: push → create PR → metadata reconcile → comment updates
//! - After the first push, failures are isolated: a rejected lease or a
//!   failed mutation marks the run as failed but other reviews proceed

use anyhow::{Context, Result};

use crate::forge::{Forge, PrInfo};
use crate::git::{Git, RepoHandle, Shell};
use crate::topics::{AutoAddUsers, BranchFormat, ReviewOptions, TopicStack};
use crate::ui::output::{self, Verbosity};

/// Everything the upload command was asked to do, flags and config merged.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Positional topic names; empty means all topics.
    pub topics: Vec<String>,
    pub base_branch: Option<String>,
    pub relative_branch: Option<String>,
    /// Push pure rebases instead of skipping them.
    pub rebase: bool,
    /// Chain topics in commit order, ignoring `Relative:` tags.
    pub relative_chain: bool,
    pub auto_topic: bool,
    pub skip_confirm: bool,
    pub dry_run: bool,
    /// Push branches but skip all PR metadata reconciliation.
    pub push_only: bool,
    /// Print the plan and exit.
    pub status: bool,
    pub update_pr_body: bool,
    pub review_graph: bool,
    pub trim_tags: bool,
    pub create_local_branches: bool,
    pub patchsets: bool,
    pub auto_add_users: AutoAddUsers,
    pub labels: Vec<String>,
    pub user_aliases: Vec<(String, String)>,
    pub uploader: Option<String>,
    pub branch_format: BranchFormat,
    pub head: String,
    pub self_authored_only: bool,
    /// Shell command to run after synthesis, before any push.
    pub pre_upload: Option<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            base_branch: None,
            relative_branch: None,
            rebase: false,
            relative_chain: false,
            auto_topic: false,
            skip_confirm: false,
            dry_run: false,
            push_only: false,
            status: false,
            update_pr_body: true,
            review_graph: true,
            trim_tags: false,
            create_local_branches: false,
            patchsets: true,
            auto_add_users: AutoAddUsers::No,
            labels: Vec::new(),
            user_aliases: Vec::new(),
            uploader: None,
            branch_format: BranchFormat::default(),
            head: "HEAD".to_string(),
            self_authored_only: true,
            pre_upload: None,
        }
    }
}

/// Run the upload pipeline. Returns the process exit code: zero on success
/// (including a no-op), non-zero when any review failed.
pub async fn run(
    git: &Git,
    forge: &dyn Forge,
    repo: &RepoHandle,
    fork: &RepoHandle,
    opts: &UploadOptions,
    verbosity: Verbosity,
) -> Result<u8> {
    let mut stack = TopicStack::new(
        git,
        verbosity,
        opts.head.clone(),
        opts.base_branch.clone(),
        opts.relative_branch.clone(),
        opts.branch_format,
    );
    stack
        .populate_topics(opts.auto_topic, opts.trim_tags, &opts.topics)
        .await?;

    let uploader = opts
        .uploader
        .clone()
        .unwrap_or_else(|| git.uploader().to_string());
    stack
        .populate_reviews(&ReviewOptions {
            uploader: uploader.clone(),
            relative_chain: opts.relative_chain,
            labels: opts.labels.clone(),
            user_aliases: opts.user_aliases.clone(),
            auto_add_users: opts.auto_add_users,
            self_authored_only: opts.self_authored_only,
        })
        .await?;

    if !opts.dry_run {
        let inputs = stack.query_inputs();
        let query = forge
            .query_repo(&inputs.head_refs, &inputs.users, &inputs.labels)
            .await
            .context("querying the forge")?;
        stack.absorb_query(query);
        // Fetch uses the oid results from the query; rebase detection uses
        // the fetched objects.
        stack.fetch_missing_objects().await?;
        stack.mark_rebases(!opts.rebase).await?;
    }

    if opts.status || verbosity == Verbosity::Verbose {
        stack.print(false);
    }
    if opts.status {
        return Ok(0);
    }

    // Conflicts abort here, before anything is pushed.
    stack.create_commits(opts.trim_tags).await?;

    if opts.dry_run {
        stack.print(verbosity != Verbosity::Verbose);
        return Ok(0);
    }

    if !opts.push_only {
        stack.populate_update_info(opts.update_pr_body);
    }

    if !opts.skip_confirm && stack.num_reviews_changed() > 0 {
        stack.print(verbosity != Verbosity::Verbose);
        if !confirm()? {
            return Ok(1);
        }
    }

    if let Some(command) = &opts.pre_upload {
        // Only run once we're sure there are no conflicts.
        run_pre_upload(git, command, verbosity).await?;
    }

    if opts.patchsets && !opts.push_only {
        // Patchset rows need the completed commit ids, and the virtual diff
        // branch they reference must be part of the same push batch.
        stack.populate_patchsets(repo).await?;
    }

    let targets = stack.push_targets(&uploader);
    let outcomes = git
        .push_refs(&git.remote_name, &targets)
        .await
        .context("pushing branches")?;
    let mut failures = stack.apply_push_outcomes(&outcomes);

    if opts.create_local_branches {
        stack.create_local_branches().await?;
    }

    if !opts.push_only {
        failures += reconcile_prs(&mut stack, forge, repo, fork, opts, verbosity).await;
    }

    stack.print(verbosity != Verbosity::Verbose);
    Ok(if failures > 0 { 1 } else { 0 })
}

/// Create missing PRs and apply the batched updates. Failures are reported
/// and counted rather than aborting, so other reviews still reconcile.
async fn reconcile_prs(
    stack: &mut TopicStack<'_>,
    forge: &dyn Forge,
    repo: &RepoHandle,
    fork: &RepoHandle,
    opts: &UploadOptions,
    verbosity: Verbosity,
) -> usize {
    let mut failures = 0;

    let mut to_create = stack.prs_to_create();
    if fork.owner != repo.owner {
        // A PR cannot target a branch that lives in a fork. Reviews whose
        // base is another review's head must wait until that lands.
        to_create.retain(|&idx| {
            let review = &stack.reviews[idx];
            if stack.topics[review.topic].relative.is_some() {
                output::print(
                    format!(
                        "Topic '{}' is waiting on base '{}' (cross-fork); \
                         upload again after it merges",
                        stack.topics[review.topic].name, review.remote_base
                    ),
                    verbosity,
                );
                false
            } else {
                true
            }
        });
    }

    if !to_create.is_empty() {
        let mut infos: Vec<PrInfo> = to_create
            .iter()
            .map(|&idx| stack.reviews[idx].pr_info.clone().expect("new review has info"))
            .collect();
        match forge.create_prs(stack.repo_id(), &mut infos).await {
            Ok(()) => {
                for (&idx, info) in to_create.iter().zip(infos) {
                    if info.id.is_empty() {
                        output::warn(
                            format!("failed to create PR for {}", info.head_ref),
                            verbosity,
                        );
                        failures += 1;
                    }
                    stack.reviews[idx].pr_info = Some(info);
                }
            }
            Err(err) => {
                output::error(format!("creating pull requests: {}", err));
                failures += to_create.len();
            }
        }
    }

    if opts.review_graph {
        // The graph needs the PR urls assigned at creation.
        stack.populate_review_graph();
    }

    let updates = stack.prs_to_update();
    if !updates.is_empty() {
        if let Err(err) = forge.update_prs(&updates).await {
            output::error(format!("updating pull requests: {}", err));
            failures += updates.len();
        }
    }
    failures
}

async fn run_pre_upload(git: &Git, command: &str, verbosity: Verbosity) -> Result<()> {
    output::print(format!("Running pre-upload command: {}", command), verbosity);
    let shell = Shell::new(git.repo_root.clone(), verbosity);
    let out = shell
        .run("sh", &["-c", command])
        .await
        .context("running pre-upload command")?;
    if !out.success() {
        anyhow::bail!(
            "pre-upload command failed with exit code {}:\n{}{}",
            out.status,
            out.stdout,
            out.stderr
        );
    }
    Ok(())
}

/// Block until the user presses enter. False means abort.
fn confirm() -> Result<bool> {
    use std::io::Write;

    print!("Press <Enter> to continue or <Ctrl-C> to quit ");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    Ok(std::io::stdin().read_line(&mut line).is_ok())
}
