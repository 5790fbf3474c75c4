//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! Boolean options that default to on (`--update-pr-body`, `--patchsets`,
//! `--review-graph`, `--self-authored-only`) come in `--x`/`--no-x` pairs so
//! the command line can override a config file in either direction; the
//! paired accessors return `None` when neither was given.

use clap::{Args, Parser, Subcommand};

use crate::topics::{AutoAddUsers, BranchFormat};

/// Revup - stacked pull requests from tagged commits
#[derive(Parser, Debug)]
#[command(name = "revup")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Proxy URL for forge requests
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// GitHub OAuth token (prefer the config file or GITHUB_TOKEN)
    #[arg(long, global = true)]
    pub github_oauth: Option<String>,

    /// GitHub host name
    #[arg(long, global = true)]
    pub github_url: Option<String>,

    /// Remote the base branches live on
    #[arg(long, global = true)]
    pub remote_name: Option<String>,

    /// Remote to push head branches to, when uploading from a fork
    #[arg(long, global = true)]
    pub fork_name: Option<String>,

    /// Print every subprocess invocation and API request
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Keep temporary files in <repo>/.revup for debugging
    #[arg(short = 'k', long, global = true)]
    pub keep_temp: bool,

    /// Path to the git executable
    #[arg(long, global = true)]
    pub git_path: Option<String>,

    /// Name of the main branch
    #[arg(long, global = true)]
    pub main_branch: Option<String>,

    /// Comma-separated globs matching release branches on the remote
    #[arg(long, global = true)]
    pub base_branch_globs: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create or update pull requests from tagged commits
    Upload(UploadArgs),

    /// Exercise individual plumbing pieces
    Toolkit {
        #[command(subcommand)]
        command: ToolkitCommand,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Arguments for `revup upload`.
#[derive(Args, Debug, Default)]
pub struct UploadArgs {
    /// Topics to upload; all topics when empty
    pub topics: Vec<String>,

    /// Base branch instead of autodetecting
    #[arg(short = 'b', long)]
    pub base_branch: Option<String>,

    /// Branch (often another user's PR branch) the stack is relative to
    #[arg(short = 'e', long)]
    pub relative_branch: Option<String>,

    /// Push pure rebases instead of skipping them
    #[arg(short, long)]
    pub rebase: bool,

    /// Skip the confirmation prompt
    #[arg(short = 's', long)]
    pub skip_confirm: bool,

    /// Compute the plan without pushing or calling the forge
    #[arg(short = 'd', long)]
    pub dry_run: bool,

    /// Push branches but skip PR metadata reconciliation
    #[arg(long)]
    pub push_only: bool,

    /// Print review status and exit
    #[arg(short = 't', long)]
    pub status: bool,

    /// Update PR titles and bodies from commit messages
    #[arg(long, overrides_with = "no_update_pr_body")]
    pub update_pr_body: bool,
    #[arg(long, hide = true)]
    pub no_update_pr_body: bool,

    /// Maintain the review-graph comment
    #[arg(long, overrides_with = "no_review_graph")]
    pub review_graph: bool,
    #[arg(long, hide = true)]
    pub no_review_graph: bool,

    /// Maintain the patchsets comment
    #[arg(long, overrides_with = "no_patchsets")]
    pub patchsets: bool,
    #[arg(long, hide = true)]
    pub no_patchsets: bool,

    /// Skip topics with no self-authored commits
    #[arg(long, overrides_with = "no_self_authored_only")]
    pub self_authored_only: bool,
    #[arg(long, hide = true)]
    pub no_self_authored_only: bool,

    /// Strip recognized directive lines from uploaded commit messages
    #[arg(long)]
    pub trim_tags: bool,

    /// Create local branches mirroring the pushed refs
    #[arg(long)]
    pub create_local_branches: bool,

    /// Copy reviewers to assignees (r2a), the reverse (a2r), or both
    #[arg(long)]
    pub auto_add_users: Option<AutoAddUsers>,

    /// Comma-separated labels added to every topic
    #[arg(long)]
    pub labels: Option<String>,

    /// Comma-separated old:new username rewrites
    #[arg(long)]
    pub user_aliases: Option<String>,

    /// Branch namespace owner; defaults to the email local part
    #[arg(long)]
    pub uploader: Option<String>,

    /// Remote branch naming scheme
    #[arg(long)]
    pub branch_format: Option<BranchFormat>,

    /// Ref to upload from
    #[arg(long)]
    pub head: Option<String>,

    /// Chain topics in commit order, ignoring Relative tags
    #[arg(short = 'c', long)]
    pub relative_chain: bool,

    /// Derive topic names from subjects for untagged commits
    #[arg(short = 'a', long)]
    pub auto_topic: bool,

    /// Shell command to run after synthesis, before pushing
    #[arg(short = 'p', long)]
    pub pre_upload: Option<String>,
}

impl UploadArgs {
    pub fn update_pr_body(&self) -> Option<bool> {
        tri_state(self.update_pr_body, self.no_update_pr_body)
    }

    pub fn review_graph(&self) -> Option<bool> {
        tri_state(self.review_graph, self.no_review_graph)
    }

    pub fn patchsets(&self) -> Option<bool> {
        tri_state(self.patchsets, self.no_patchsets)
    }

    pub fn self_authored_only(&self) -> Option<bool> {
        tri_state(self.self_authored_only, self.no_self_authored_only)
    }
}

fn tri_state(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Plumbing subcommands, for debugging the pipeline piecewise.
#[derive(Subcommand, Debug)]
pub enum ToolkitCommand {
    /// Detect the base branch of the current head
    DetectBranch {
        /// Show all candidates, not just the best one
        #[arg(short, long)]
        show_all: bool,
    },

    /// Cherry-pick a commit onto a new parent, in memory
    CherryPick {
        /// Commit to cherry-pick
        #[arg(short, long)]
        commit: String,
        /// Parent commit
        #[arg(short, long)]
        parent: String,
    },

    /// Find the first divergence between two branches
    ForkPoint {
        /// Branches to compare
        #[arg(num_args = 2)]
        branches: Vec<String>,
    },

    /// List all topics and their commits
    ListTopics {
        /// Base branch instead of autodetecting
        #[arg(short = 'b', long)]
        base_branch: Option<String>,
        /// Relative branch
        #[arg(short = 'e', long)]
        relative_branch: Option<String>,
    },
}
