//! git::interface
//!
//! The git adapter: plumbing wrappers over the async shell.
//!
//! # Responsibilities
//!
//! - Commit enumeration (`rev-list --header`) and ref resolution
//! - Fork-point and distance queries for base-branch detection
//! - In-memory cherry-pick via `merge-tree --write-tree` + `commit-tree`
//! - Transient-index tree surgery for virtual diff targets
//! - Canonical patch fingerprints for rebase detection
//! - Batched lease-checked pushes
//!
//! # Working Tree Safety
//!
//! Nothing here touches the repository's own index, the working tree, or
//! `HEAD`. Tree arithmetic happens in the object database; the only index
//! files written live in the scratch directory and carry unique names.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::shell::{Shell, ShellError, ShellOutput};
use crate::core::types::{CommitHash, CommitHeader, TreeHash, TypeError};
use crate::ui::output;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    /// A plumbing command exited non-zero in a way the caller cannot handle.
    #[error("git {command} failed with exit code {status}:\n{stderr}")]
    Plumbing {
        command: String,
        status: i32,
        stderr: String,
    },

    /// A three-way merge produced conflicts.
    #[error("merge conflict in {}", .0.summary())]
    Conflict(MergeConflict),

    #[error("{0} is not a commit or branch name")]
    NotACommit(String),

    #[error("{0}; set it with `git config --global {1}`")]
    MissingIdentity(String, String),

    #[error("no base branch found for {0}")]
    NoBaseBranch(String),

    /// Plumbing output did not parse. Indicates a git version mismatch.
    #[error("failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("scratch directory error: {0}")]
    Scratch(#[from] std::io::Error),
}

/// One conflict record from `git merge-tree`.
#[derive(Debug, Clone)]
pub struct ConflictFile {
    /// Conflict kind, e.g. `CONFLICT (contents)` or `Auto-merging`.
    pub kind: String,
    /// Human-readable message from git.
    pub message: String,
    /// Paths involved in this record.
    pub paths: Vec<String>,
}

impl ConflictFile {
    /// `Auto-merging` records are informational, not conflicts.
    pub fn is_informational(&self) -> bool {
        self.kind == "Auto-merging"
    }
}

/// A failed three-way merge: the conflicted result tree plus per-path records.
#[derive(Debug, Clone)]
pub struct MergeConflict {
    pub tree: Option<TreeHash>,
    pub files: Vec<ConflictFile>,
}

impl MergeConflict {
    /// Paths that actually conflicted.
    pub fn conflicting_paths(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|f| !f.is_informational())
            .flat_map(|f| f.paths.iter().map(String::as_str))
            .collect()
    }

    fn summary(&self) -> String {
        let paths = self.conflicting_paths();
        if paths.is_empty() {
            "unknown paths".to_string()
        } else {
            paths.join(", ")
        }
    }
}

/// Author or committer identity with a raw git date (`<epoch> <tz>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub date: String,
}

/// A repository identified on the forge, parsed from a remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub owner: String,
    pub name: String,
}

/// Lease requirement for one pushed ref.
#[derive(Debug, Clone)]
pub enum PushLease {
    /// Expect whatever the remote-tracking ref currently records.
    Tracking,
    /// The ref must not exist on the remote.
    Absent,
    /// The ref must currently point at this commit.
    Expect(CommitHash),
    /// Unconditional forced update (`+` refspec). Only for refs the tool
    /// owns outright, like the virtual-diff-target chain.
    Force,
}

/// One ref to push.
#[derive(Debug, Clone)]
pub struct PushTarget {
    pub oid: CommitHash,
    /// Branch name without the `refs/heads/` prefix.
    pub branch: String,
    pub lease: PushLease,
}

/// Per-ref result of a batched push.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub branch: String,
    /// `None` on success; the porcelain reason when the lease failed.
    pub rejection: Option<String>,
}

/// Options for opening a repository.
#[derive(Debug, Clone)]
pub struct GitOptions {
    /// Path to the git executable; `git` from `$PATH` when empty.
    pub git_path: Option<String>,
    pub remote_name: String,
    pub main_branch: String,
    /// Globs (relative to the remote) matching long-lived release branches.
    pub base_branch_globs: Vec<String>,
    /// Keep scratch files in `<repo>/.revup` instead of a temp dir.
    pub keep_temp: bool,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            git_path: None,
            remote_name: "origin".to_string(),
            main_branch: "main".to_string(),
            base_branch_globs: Vec::new(),
            keep_temp: false,
        }
    }
}

/// The two spellings of a conventional default branch.
const COMMON_MAIN_BRANCHES: [&str; 2] = ["main", "master"];

enum Scratch {
    Temp(tempfile::TempDir),
    Kept(PathBuf),
}

impl Scratch {
    fn path(&self) -> &Path {
        match self {
            Scratch::Temp(dir) => dir.path(),
            Scratch::Kept(path) => path,
        }
    }
}

/// An open repository.
///
/// Construction resolves the repository root, the git directory, the user's
/// identity, and the effective main branch, and captures the committer
/// timestamp used for every commit created during this invocation, so
/// repeated runs over unchanged input synthesize identical objects within
/// one run.
pub struct Git {
    shell: Shell,
    git_path: String,
    pub repo_root: PathBuf,
    pub remote_name: String,
    pub main_branch: String,
    base_branch_globs: Vec<String>,
    /// Lowercased `user.email`.
    pub email: String,
    user_name: String,
    committer_date: String,
    keep_temp: bool,
    scratch: Scratch,
}

impl Git {
    /// Open the repository containing `shell`'s working directory.
    pub async fn open(shell: Shell, options: GitOptions) -> Result<Self, GitError> {
        let git_path = options
            .git_path
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "git".to_string());

        let bootstrap = |args: &'static [&'static str]| {
            let shell = shell.clone();
            let git_path = git_path.clone();
            async move {
                let out = shell.run(&git_path, args).await?;
                if !out.success() {
                    return Err(plumbing_error(&git_path, args, &out));
                }
                Ok::<String, GitError>(out.stdout.trim().to_string())
            }
        };

        let repo_root = bootstrap(&["rev-parse", "--show-toplevel"]).await?;

        let shell = shell.with_cwd(&repo_root);
        let mut git = Self {
            shell,
            git_path,
            repo_root: PathBuf::from(repo_root),
            remote_name: options.remote_name,
            main_branch: options.main_branch,
            base_branch_globs: options.base_branch_globs,
            email: String::new(),
            user_name: String::new(),
            committer_date: format!("{} +0000", chrono::Utc::now().timestamp()),
            keep_temp: options.keep_temp,
            scratch: Scratch::Temp(tempfile::TempDir::with_prefix("revup_")?),
        };

        if options.keep_temp {
            let kept = git.repo_root.join(".revup");
            std::fs::create_dir_all(&kept)?;
            git.scratch = Scratch::Kept(kept);
        }

        let email = git.config_value("user.email").await?.ok_or_else(|| {
            GitError::MissingIdentity("couldn't get git email".into(), "user.email".into())
        })?;
        git.email = email.to_lowercase();
        git.user_name = match git.config_value("user.name").await? {
            Some(name) => name,
            None => uploader_from_email(&git.email).to_string(),
        };

        // A repo cloned as "master" shouldn't require config to upload.
        let main_ref = format!("{}/{}", git.remote_name, git.main_branch);
        if !git.is_branch_or_commit(&main_ref).await? {
            if let Some(position) = COMMON_MAIN_BRANCHES
                .iter()
                .position(|b| *b == git.main_branch)
            {
                let fallback = COMMON_MAIN_BRANCHES[1 - position];
                output::print(
                    format!(
                        "Branch {} not found, falling back to \"{}\". We recommend setting this in .revupconfig",
                        git.main_branch, fallback
                    ),
                    git.shell.verbosity(),
                );
                git.main_branch = fallback.to_string();
            }
        }

        Ok(git)
    }

    /// The default uploader: the local part of the configured email.
    pub fn uploader(&self) -> &str {
        uploader_from_email(&self.email)
    }

    /// Committer identity for every commit created in this invocation.
    pub fn committer(&self) -> Signature {
        Signature {
            name: self.user_name.clone(),
            email: self.email.clone(),
            date: self.committer_date.clone(),
        }
    }

    /// Scratch directory for transient files.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    // ----------------------------------------------------------------------
    // Process helpers
    // ----------------------------------------------------------------------

    async fn git(&self, args: &[&str]) -> Result<ShellOutput, GitError> {
        Ok(self.shell.run(&self.git_path, args).await?)
    }

    async fn git_with(
        &self,
        args: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&str>,
    ) -> Result<ShellOutput, GitError> {
        Ok(self.shell.run_with(&self.git_path, args, env, stdin).await?)
    }

    /// Run a command that must succeed; returns trimmed stdout.
    async fn git_ok(&self, args: &[&str]) -> Result<String, GitError> {
        let out = self.git(args).await?;
        if !out.success() {
            return Err(plumbing_error(&self.git_path, args, &out));
        }
        Ok(out.stdout.trim_end().to_string())
    }

    async fn git_ok_with(
        &self,
        args: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&str>,
    ) -> Result<String, GitError> {
        let out = self.git_with(args, env, stdin).await?;
        if !out.success() {
            return Err(plumbing_error(&self.git_path, args, &out));
        }
        Ok(out.stdout.trim_end().to_string())
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>, GitError> {
        let out = self.git(&["config", key]).await?;
        if out.success() && !out.stdout.trim().is_empty() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    /// Whether `obj` resolves to any object.
    pub async fn is_branch_or_commit(&self, obj: &str) -> Result<bool, GitError> {
        Ok(self
            .git(&["rev-parse", "--verify", "--quiet", obj])
            .await?
            .success())
    }

    /// Fail with a usage error unless `obj` resolves.
    pub async fn verify_branch_or_commit(&self, obj: &str) -> Result<(), GitError> {
        if self.is_branch_or_commit(obj).await? {
            Ok(())
        } else {
            Err(GitError::NotACommit(obj.to_string()))
        }
    }

    /// Resolve a commit-ish to its full commit hash.
    pub async fn resolve_commit(&self, rev: &str) -> Result<CommitHash, GitError> {
        let peel = format!("{}^{{commit}}", rev);
        let out = self.git(&["rev-parse", "--verify", "--quiet", &peel]).await?;
        if !out.success() {
            return Err(GitError::NotACommit(rev.to_string()));
        }
        Ok(CommitHash::new(out.stdout.trim())?)
    }

    /// Whether the given commit object exists locally.
    pub async fn commit_exists(&self, oid: &CommitHash) -> Result<bool, GitError> {
        let peel = format!("{}^{{commit}}", oid);
        Ok(self.git(&["cat-file", "-e", &peel]).await?.success())
    }

    /// Currently checked out branch, if any.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let name = self.git_ok(&["branch", "--show-current"]).await?;
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    /// The tree id of a commit-ish.
    pub async fn tree_of(&self, rev: &str) -> Result<TreeHash, GitError> {
        let peel = format!("{}^{{tree}}", rev);
        Ok(TreeHash::new(self.git_ok(&["rev-parse", &peel]).await?)?)
    }

    /// Whether two commit-ish have identical trees (an empty diff).
    pub async fn have_identical_trees(&self, a: &str, b: &str) -> Result<bool, GitError> {
        let (tree_a, tree_b) = tokio::try_join!(self.tree_of(a), self.tree_of(b))?;
        Ok(tree_a == tree_b)
    }

    /// First-parent commits reachable from `include` but not `exclude`,
    /// oldest first, with full headers.
    pub async fn rev_list_headers(
        &self,
        include: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<CommitHeader>, GitError> {
        let mut args = vec!["rev-list", "--reverse", "--first-parent", "--header", include];
        if let Some(exclude) = exclude {
            args.push("--not");
            args.push(exclude);
        }
        let out = self.git_ok(&args).await?;
        parse_rev_list_headers(&out)
    }

    /// Full header of a single commit.
    pub async fn commit_header(&self, rev: &str) -> Result<CommitHeader, GitError> {
        let out = self
            .git_ok(&["rev-list", "--header", "--max-count=1", rev])
            .await?;
        parse_rev_list_headers(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| GitError::NotACommit(rev.to_string()))
    }

    /// The commit at which `rev` diverged from `base`, following first
    /// parents only. When `rev` introduces nothing, the fork point is `rev`
    /// itself.
    pub async fn fork_point(&self, rev: &str, base: &str) -> Result<CommitHash, GitError> {
        let exclude = format!("^{}", base);
        let out = self
            .git_ok(&[
                "rev-list",
                "--first-parent",
                "--exclude-first-parent-only",
                "--reverse",
                "--parents",
                rev,
                &exclude,
            ])
            .await?;
        match out.lines().next() {
            None | Some("") => self.resolve_commit(rev).await,
            Some(first) => {
                let mut fields = first.split_whitespace();
                let _commit = fields.next();
                match fields.next() {
                    Some(parent) => Ok(CommitHash::new(parent)?),
                    // Diverged at a root commit; there is no fork point.
                    None => Err(GitError::NoBaseBranch(rev.to_string())),
                }
            }
        }
    }

    /// Number of first-parent commits on `rev` beyond its fork point with
    /// `base`, counting at most `max` (0 = unlimited).
    pub async fn distance_to_fork_point(
        &self,
        rev: &str,
        base: &str,
        max: usize,
    ) -> Result<usize, GitError> {
        let exclude = format!("^{}", base);
        let limit = format!("--max-count={}", max + 1);
        let mut args = vec![
            "rev-list",
            "--first-parent",
            "--exclude-first-parent-only",
            "--count",
        ];
        if max > 0 {
            args.push(&limit);
        }
        args.push(rev);
        args.push(&exclude);
        let out = self.git_ok(&args).await?;
        out.trim().parse().map_err(|_| GitError::Parse {
            what: "rev-list --count".into(),
            detail: out,
        })
    }

    /// Whether `rev` introduces no first-parent commits beyond `base`, i.e.
    /// `rev` lies on (or behind) `base`'s history.
    pub async fn is_ancestor(&self, rev: &str, base: &str) -> Result<bool, GitError> {
        if rev == base {
            return Ok(true);
        }
        Ok(self.distance_to_fork_point(rev, base, 1).await? == 0)
    }

    // ----------------------------------------------------------------------
    // Base branch detection
    // ----------------------------------------------------------------------

    /// Remote-tracking branches that are candidate bases for `commit`:
    /// the main branch plus anything matching the configured globs, pruned
    /// to branches containing the fork point with main.
    pub async fn find_base_branch_candidates(
        &self,
        commit: &str,
    ) -> Result<Vec<String>, GitError> {
        let main_ref = format!("refs/remotes/{}/{}", self.remote_name, self.main_branch);
        if self.base_branch_globs.is_empty() {
            return Ok(vec![format!("{}/{}", self.remote_name, self.main_branch)]);
        }

        let fork_with_main = self
            .fork_point(commit, &format!("{}/{}", self.remote_name, self.main_branch))
            .await?;

        let mut args: Vec<String> = vec![
            "for-each-ref".into(),
            "--format".into(),
            "%(refname)".into(),
            // A branch that doesn't contain the fork with main is too old.
            "--contains".into(),
            fork_with_main.to_string(),
            main_ref,
        ];
        for glob in &self.base_branch_globs {
            args.push(format!("refs/remotes/{}/{}", self.remote_name, glob));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.git_ok(&arg_refs).await?;

        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("refs/remotes/"))
            .map(str::to_string)
            .collect())
    }

    /// The candidate base branches nearest to `commit` by first-parent
    /// distance to the fork point. Several branches can tie.
    pub async fn best_base_branch_candidates(
        &self,
        commit: &str,
    ) -> Result<Vec<String>, GitError> {
        let branches = self.find_base_branch_candidates(commit).await?;
        if branches.len() <= 1 {
            return Ok(branches);
        }

        let mut best: Vec<(usize, String)> = Vec::new();
        for branch in branches {
            // Once there is a best distance, counting can stop early there.
            let cap = best.first().map(|(d, _)| *d).unwrap_or(0);
            let dist = self.distance_to_fork_point(commit, &branch, cap).await?;
            match best.first() {
                None => best.push((dist, branch)),
                Some((current, _)) if *current > dist => best = vec![(dist, branch)],
                Some((current, _)) if *current == dist => best.push((dist, branch)),
                _ => {}
            }
        }
        Ok(best.into_iter().map(|(_, b)| b).collect())
    }

    /// The single best base branch for `commit`.
    ///
    /// Ties break toward the current branch's remote counterpart, then the
    /// configured main branch, then the lexicographically largest name.
    pub async fn best_base_branch(&self, commit: &str) -> Result<String, GitError> {
        let candidates = self.best_base_branch_candidates(commit).await?;
        let Some(first) = candidates.first() else {
            return Err(GitError::NoBaseBranch(commit.to_string()));
        };
        if candidates.len() == 1 {
            return Ok(first.clone());
        }

        let current = self.current_branch().await?;
        let current_ref = current.map(|b| format!("{}/{}", self.remote_name, b));
        let main_ref = format!("{}/{}", self.remote_name, self.main_branch);

        let mut ret = first.clone();
        for candidate in &candidates {
            if Some(candidate.as_str()) == current_ref.as_deref() {
                return Ok(candidate.clone());
            }
            if candidate == &main_ref {
                return Ok(candidate.clone());
            }
            if candidate > &ret {
                ret = candidate.clone();
            }
        }
        Ok(ret)
    }

    /// Ensure the branch carries the `<remote>/` prefix.
    pub fn ensure_branch_prefix(&self, branch: &str) -> String {
        let prefix = format!("{}/", self.remote_name);
        if branch.starts_with(&prefix) {
            branch.to_string()
        } else {
            format!("{}{}", prefix, branch)
        }
    }

    /// Strip the `<remote>/` prefix if present.
    pub fn remove_branch_prefix<'a>(&self, branch: &'a str) -> &'a str {
        let prefix = format!("{}/", self.remote_name);
        branch.strip_prefix(&prefix).unwrap_or(branch)
    }

    // ----------------------------------------------------------------------
    // Object creation
    // ----------------------------------------------------------------------

    /// Create a commit object for a tree.
    pub async fn commit_tree(
        &self,
        tree: &TreeHash,
        parents: &[&CommitHash],
        author: &Signature,
        committer: &Signature,
        message: &str,
    ) -> Result<CommitHash, GitError> {
        let mut args: Vec<String> = vec!["commit-tree".into(), tree.to_string()];
        for parent in parents {
            args.push("-p".into());
            args.push(parent.to_string());
        }
        args.push("-F".into());
        args.push("-".into());

        let env = [
            ("GIT_AUTHOR_NAME", author.name.as_str()),
            ("GIT_AUTHOR_EMAIL", author.email.as_str()),
            ("GIT_AUTHOR_DATE", author.date.as_str()),
            ("GIT_COMMITTER_NAME", committer.name.as_str()),
            ("GIT_COMMITTER_EMAIL", committer.email.as_str()),
            ("GIT_COMMITTER_DATE", committer.date.as_str()),
        ];
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.git_ok_with(&arg_refs, &env, Some(message)).await?;
        Ok(CommitHash::new(out)?)
    }

    /// Three-way merge a commit's tree onto a new parent, using the commit's
    /// own parent as the merge base. Returns the merged tree; nothing is
    /// committed and the working tree is untouched.
    ///
    /// # Errors
    ///
    /// `GitError::Conflict` when the trees do not merge cleanly. No objects
    /// are left behind besides unreachable trees, which git gc collects.
    pub async fn pick_tree(
        &self,
        commit: &CommitHeader,
        new_parent: &CommitHash,
    ) -> Result<TreeHash, GitError> {
        let base = commit
            .first_parent()
            .ok_or_else(|| GitError::NotACommit(format!("{} has no parent", commit.commit_id)))?;

        let merge_base = format!("--merge-base={}", base);
        let ours = new_parent.to_string();
        let theirs = commit.commit_id.to_string();
        let args = [
            "merge-tree",
            "--write-tree",
            "--messages",
            "-z",
            &merge_base,
            &ours,
            &theirs,
        ];
        let out = self.git(&args).await?;

        match out.status {
            0 => parse_merge_tree_oid(&out.stdout),
            1 => Err(GitError::Conflict(parse_merge_tree_conflicts(&out.stdout))),
            _ => Err(plumbing_error(&self.git_path, &args, &out)),
        }
    }

    /// Cherry-pick a commit onto a new parent: [`Self::pick_tree`] followed
    /// by `commit-tree`.
    ///
    /// The author is preserved from the source commit; the committer is this
    /// invocation's identity, so reruns within one invocation are stable.
    pub async fn cherry_pick_commit(
        &self,
        commit: &CommitHeader,
        new_parent: &CommitHash,
        message: &str,
    ) -> Result<CommitHash, GitError> {
        let tree = self.pick_tree(commit, new_parent).await?;
        let author = Signature {
            name: commit.author_name.clone(),
            email: commit.author_email.clone(),
            date: commit.author_date.clone(),
        };
        self.commit_tree(&tree, &[new_parent], &author, &self.committer(), message)
            .await
    }

    /// Canonical fingerprint of the patch `parent..commit`.
    ///
    /// The fingerprint is a SHA-256 over the unified diff with one context
    /// line and blob-id lines stripped, so it survives rebases that rewrite
    /// ids without changing content. An empty diff yields an empty string.
    pub async fn patch_fingerprint(
        &self,
        parent: &CommitHash,
        commit: &CommitHash,
    ) -> Result<String, GitError> {
        let out = self
            .git_ok(&[
                "diff-tree",
                "--no-commit-id",
                "--no-color",
                "--no-textconv",
                "-U1",
                "-p",
                parent.as_str(),
                commit.as_str(),
            ])
            .await?;
        Ok(fingerprint_patch(&out))
    }

    /// `files changed / insertions / deletions` summary for a patchset row.
    pub async fn diff_summary(&self, parent: &str, commit: &str) -> Result<String, GitError> {
        let out = self
            .git_ok(&["diff", "--shortstat", parent, commit])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Build a commit against which `new_head` can be diffed to show only
    /// the changes the author made, excluding upstream movement between
    /// `old_base` and `new_base`.
    ///
    /// Files untouched by the old diff keep their `new_base` versions; files
    /// the old diff touched are reset to their `old_head` versions. Diffing
    /// the result against `new_head` therefore hides pure-upstream changes.
    pub async fn make_virtual_diff_target(
        &self,
        old_base: &CommitHash,
        old_head: &CommitHash,
        new_base: &CommitHash,
        new_head: &CommitHash,
        parent: Option<&CommitHash>,
    ) -> Result<CommitHash, GitError> {
        let raw = self
            .git_ok(&[
                "diff-tree",
                "-r",
                "--no-commit-id",
                "--raw",
                old_base.as_str(),
                old_head.as_str(),
            ])
            .await?;
        let index_info = diff_tree_raw_to_index_info(&raw)?;
        if index_info.is_empty() {
            // Nothing was changed, so new_base itself is the right target.
            return Ok(new_base.clone());
        }

        let index = self.transient_index();
        let index_path = index.path.to_string_lossy().into_owned();
        let env = [("GIT_INDEX_FILE", index_path.as_str())];

        self.git_ok_with(&["read-tree", new_base.as_str()], &env, None)
            .await?;
        self.git_ok_with(
            &["update-index", "--index-info"],
            &env,
            Some(&index_info.join("\n")),
        )
        .await?;
        let tree = TreeHash::new(self.git_ok_with(&["write-tree"], &env, None).await?)?;

        let message = format!(
            "revup virtual diff target\n\n{}\n{}\n{}\n{}",
            old_base, old_head, new_base, new_head
        );
        let parents: Vec<&CommitHash> = parent.into_iter().collect();
        let identity = self.committer();
        self.commit_tree(&tree, &parents, &identity, &identity, &message)
            .await
    }

    fn transient_index(&self) -> TransientIndex {
        TransientIndex {
            path: self
                .scratch_dir()
                .join(format!("index-{}", uuid::Uuid::new_v4())),
            keep: self.keep_temp,
        }
    }

    // ----------------------------------------------------------------------
    // Remote operations
    // ----------------------------------------------------------------------

    /// Fetch specific objects without moving any refs.
    pub async fn fetch_objects(&self, oids: &[CommitHash]) -> Result<(), GitError> {
        if oids.is_empty() {
            return Ok(());
        }
        let mut args: Vec<String> = vec![
            "fetch".into(),
            "--no-write-fetch-head".into(),
            "--no-auto-maintenance".into(),
            "--quiet".into(),
            self.remote_name.clone(),
        ];
        args.extend(oids.iter().map(|oid| oid.to_string()));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git_ok(&arg_refs).await?;
        Ok(())
    }

    /// Push a batch of refs to `remote` with per-ref lease checks.
    ///
    /// A failed lease rejects only that ref; the others still land. The
    /// returned outcomes preserve the order of `targets`.
    pub async fn push_refs(
        &self,
        remote: &str,
        targets: &[PushTarget],
    ) -> Result<Vec<PushOutcome>, GitError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        // No --quiet: it would suppress the porcelain report.
        let mut args: Vec<String> = vec!["push".into(), "--porcelain".into(), "--no-verify".into()];
        for target in targets {
            let lease = match &target.lease {
                PushLease::Tracking => format!("--force-with-lease=refs/heads/{}", target.branch),
                PushLease::Absent => format!("--force-with-lease=refs/heads/{}:", target.branch),
                PushLease::Expect(oid) => {
                    format!("--force-with-lease=refs/heads/{}:{}", target.branch, oid)
                }
                PushLease::Force => continue,
            };
            args.push(lease);
        }
        args.push(remote.to_string());
        for target in targets {
            let prefix = match target.lease {
                PushLease::Force => "+",
                _ => "",
            };
            args.push(format!("{}{}:refs/heads/{}", prefix, target.oid, target.branch));
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.git_with(&arg_refs, &[], None).await?;
        // Exit 1 with porcelain output means per-ref rejections; anything
        // else non-zero is a transport failure.
        if !out.success() && out.stdout.trim().is_empty() {
            return Err(plumbing_error(&self.git_path, &arg_refs, &out));
        }
        parse_push_porcelain(&out.stdout, targets)
    }

    /// Create or move a local branch with an explicit old-value precondition.
    pub async fn update_local_branch(
        &self,
        branch: &str,
        new: &CommitHash,
    ) -> Result<(), GitError> {
        let refname = format!("refs/heads/{}", branch);
        let old = match self.git(&["rev-parse", "--verify", "--quiet", &refname]).await? {
            out if out.success() => out.stdout.trim().to_string(),
            // Empty old value asserts the ref does not exist yet.
            _ => String::new(),
        };
        self.git_ok(&[
            "update-ref",
            "-m",
            "revup: update local branch",
            &refname,
            new.as_str(),
            &old,
        ])
        .await?;
        Ok(())
    }

    /// URL of a configured remote, if any.
    pub async fn remote_url(&self, remote: &str) -> Result<Option<String>, GitError> {
        let out = self.git(&["remote", "get-url", remote]).await?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Owner/name of the forge repository a remote points at.
    pub async fn repo_handle(
        &self,
        forge_host: &str,
        remote: &str,
    ) -> Result<Option<RepoHandle>, GitError> {
        Ok(self
            .remote_url(remote)
            .await?
            .as_deref()
            .and_then(|url| parse_remote_repo(url, forge_host)))
    }
}

/// A uniquely named index file under the scratch directory.
///
/// Each instance is owned by a single task, so access is serialized by
/// construction. The file is removed on drop unless `--keep-temp` is set.
struct TransientIndex {
    path: PathBuf,
    keep: bool,
}

impl Drop for TransientIndex {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn plumbing_error(git_path: &str, args: &[&str], out: &ShellOutput) -> GitError {
    GitError::Plumbing {
        command: output::quote_command(std::iter::once(git_path).chain(args.iter().copied())),
        status: out.status,
        stderr: out.stderr.trim_end().to_string(),
    }
}

/// The local part of an email address, used as the default uploader.
pub(crate) fn uploader_from_email(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

// --------------------------------------------------------------------------
// Plumbing output parsers
// --------------------------------------------------------------------------

/// Parse `git rev-list --header` output into commit headers.
pub(crate) fn parse_rev_list_headers(raw: &str) -> Result<Vec<CommitHeader>, GitError> {
    raw.split('\0')
        .filter(|block| !block.trim().is_empty())
        .map(parse_commit_block)
        .collect()
}

fn parse_commit_block(block: &str) -> Result<CommitHeader, GitError> {
    let malformed = |detail: &str| GitError::Parse {
        what: "rev-list --header output".into(),
        detail: detail.to_string(),
    };

    let mut lines = block.lines();
    let commit_id = CommitHash::new(lines.next().ok_or_else(|| malformed("empty block"))?.trim())?;

    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut committer = None;
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("tree ") {
            tree = Some(TreeHash::new(value)?);
        } else if let Some(value) = line.strip_prefix("parent ") {
            parents.push(CommitHash::new(value)?);
        } else if let Some(value) = line.strip_prefix("author ") {
            author = Some(parse_signature(value).ok_or_else(|| malformed(line))?);
        } else if let Some(value) = line.strip_prefix("committer ") {
            committer = Some(parse_signature(value).ok_or_else(|| malformed(line))?);
        }
        // Other headers (gpgsig continuation lines, mergetag, etc) are
        // irrelevant here and skipped.
    }

    let message = lines
        .map(|line| line.strip_prefix("    ").unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n");

    let author = author.ok_or_else(|| malformed("missing author"))?;
    let committer = committer.ok_or_else(|| malformed("missing committer"))?;
    Ok(CommitHeader {
        commit_id,
        tree: tree.ok_or_else(|| malformed("missing tree"))?,
        parents,
        author_name: author.name,
        author_email: author.email,
        author_date: author.date,
        committer_name: committer.name,
        committer_email: committer.email,
        committer_date: committer.date,
        message,
    })
}

/// Parse `Name <email> epoch tz` from an author/committer header line.
fn parse_signature(value: &str) -> Option<Signature> {
    let open = value.find(" <")?;
    let close = value[open..].find("> ")? + open;
    Some(Signature {
        name: value[..open].to_string(),
        email: value[open + 2..close].to_string(),
        date: value[close + 2..].to_string(),
    })
}

/// First NUL-delimited token of `merge-tree -z` output: the result tree.
fn parse_merge_tree_oid(stdout: &str) -> Result<TreeHash, GitError> {
    let oid = stdout.split('\0').next().unwrap_or("").trim();
    TreeHash::new(oid).map_err(|_| GitError::Parse {
        what: "merge-tree output".into(),
        detail: stdout.chars().take(80).collect(),
    })
}

/// Parse conflict records from `merge-tree --write-tree --messages -z`
/// output after exit code 1.
///
/// The output is `<tree> <conflicted-entries…>` NUL NUL `<informational>`,
/// where the informational section is a flat NUL-separated list of
/// `<num-paths> <paths…> <kind> <message>` groups.
pub(crate) fn parse_merge_tree_conflicts(stdout: &str) -> MergeConflict {
    let sections: Vec<&str> = stdout.split("\0\0").collect();
    let tree = sections
        .first()
        .and_then(|s| s.split('\0').next())
        .and_then(|oid| TreeHash::new(oid.trim()).ok());

    let mut files = Vec::new();
    if let Some(informational) = sections.get(1) {
        let fields: Vec<&str> = informational.split('\0').collect();
        let mut i = 0;
        while i + 2 < fields.len() {
            let Ok(num_paths) = fields[i].trim().parse::<usize>() else {
                break;
            };
            if i + num_paths + 2 >= fields.len() {
                break;
            }
            files.push(ConflictFile {
                paths: fields[i + 1..i + 1 + num_paths]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                kind: fields[i + 1 + num_paths].to_string(),
                message: fields[i + 2 + num_paths].trim().to_string(),
            });
            i += num_paths + 3;
        }
    }
    MergeConflict { tree, files }
}

/// SHA-256 over a unified diff with unstable lines removed.
///
/// Blob-id (`index`) lines change across rebases even when content does
/// not, so they are excluded. An empty diff maps to the empty string, which
/// matches any other empty diff.
pub(crate) fn fingerprint_patch(diff: &str) -> String {
    if diff.trim().is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    for line in diff.lines() {
        if line.starts_with("index ") {
            continue;
        }
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Convert `diff-tree --raw` lines into `update-index --index-info` lines
/// holding the post-image of each changed path.
fn diff_tree_raw_to_index_info(raw: &str) -> Result<Vec<String>, GitError> {
    let mut ret = Vec::new();
    for line in raw.lines() {
        if line.is_empty() {
            continue;
        }
        let malformed = || GitError::Parse {
            what: "diff-tree --raw output".into(),
            detail: line.to_string(),
        };
        // :<old_mode> <new_mode> <old_hash> <new_hash> <type>\t<path>
        let body = line.strip_prefix(':').ok_or_else(malformed)?;
        let (meta, path) = body.split_once('\t').ok_or_else(malformed)?;
        let fields: Vec<&str> = meta.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(malformed());
        }
        ret.push(format!("{} {} 0\t{}", fields[1], fields[3], path));
    }
    Ok(ret)
}

/// Parse `git push --porcelain` output into per-target outcomes.
///
/// Porcelain lines look like `<flag>\t<from>:<to>\t<summary>`; `!` marks a
/// rejected ref. Targets not mentioned (transport died first) are reported
/// rejected with a generic reason.
pub(crate) fn parse_push_porcelain(
    stdout: &str,
    targets: &[PushTarget],
) -> Result<Vec<PushOutcome>, GitError> {
    let mut rejections: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for line in stdout.lines() {
        let Some((flag, rest)) = line.split_once('\t') else {
            continue;
        };
        let mut cols = rest.split('\t');
        let Some(refspec) = cols.next() else {
            continue;
        };
        let Some(to) = refspec.split(':').nth(1) else {
            continue;
        };
        let branch = to.strip_prefix("refs/heads/").unwrap_or(to).to_string();
        seen.insert(branch.clone());
        if flag == "!" {
            let reason = cols.next().unwrap_or("rejected").to_string();
            rejections.insert(branch, reason);
        }
    }

    Ok(targets
        .iter()
        .map(|target| PushOutcome {
            branch: target.branch.clone(),
            rejection: match rejections.get(&target.branch) {
                Some(reason) => Some(reason.clone()),
                None if seen.contains(&target.branch) => None,
                None if seen.is_empty() => None,
                None => Some("not reported by push".to_string()),
            },
        })
        .collect())
}

/// Extract owner/name from a forge remote URL, for both ssh and https
/// spellings of the configured host.
pub(crate) fn parse_remote_repo(url: &str, host: &str) -> Option<RepoHandle> {
    let strip_suffix = |s: &str| {
        let s = s.trim_end_matches('/');
        s.strip_suffix(".git").unwrap_or(s).to_string()
    };

    // ssh: [user@]host:owner/name[.git]
    if let Some((authority, path)) = url.split_once(':') {
        let host_part = authority.rsplit('@').next().unwrap_or(authority);
        if host_part == host && !path.starts_with("//") {
            let mut parts = path.splitn(2, '/');
            if let (Some(owner), Some(name)) = (parts.next(), parts.next()) {
                if !owner.is_empty() && !name.is_empty() {
                    return Some(RepoHandle {
                        owner: owner.to_string(),
                        name: strip_suffix(name),
                    });
                }
            }
        }
    }

    // https: scheme://host/owner/name[.git]
    let marker = format!("{}/", host);
    if let Some(idx) = url.find(&marker) {
        let rest = &url[idx + marker.len()..];
        let mut parts = rest.splitn(2, '/');
        if let (Some(owner), Some(name)) = (parts.next(), parts.next()) {
            let name = strip_suffix(name.split('/').next().unwrap_or(name));
            if !owner.is_empty() && !name.is_empty() {
                return Some(RepoHandle {
                    owner: owner.to_string(),
                    name,
                });
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    mod rev_list_parsing {
        use super::*;

        const SAMPLE: &str = concat!(
            "1111111111111111111111111111111111111111\n",
            "tree 2222222222222222222222222222222222222222\n",
            "parent 3333333333333333333333333333333333333333\n",
            "author Ada Lovelace <ada@example.com> 1700000000 +0100\n",
            "committer Charles Babbage <cb@example.com> 1700000100 +0000\n",
            "\n",
            "    Add the engine\n",
            "    \n",
            "    Topic: engine\n",
            "\0"
        );

        #[test]
        fn parses_one_commit() {
            let commits = parse_rev_list_headers(SAMPLE).unwrap();
            assert_eq!(commits.len(), 1);
            let c = &commits[0];
            assert_eq!(c.commit_id.as_str(), &"1".repeat(40));
            assert_eq!(c.tree.as_str(), &"2".repeat(40));
            assert_eq!(c.parents.len(), 1);
            assert_eq!(c.author_name, "Ada Lovelace");
            assert_eq!(c.author_email, "ada@example.com");
            assert_eq!(c.author_date, "1700000000 +0100");
            assert_eq!(c.committer_name, "Charles Babbage");
            assert_eq!(c.subject(), "Add the engine");
            assert_eq!(c.message, "Add the engine\n\nTopic: engine");
        }

        #[test]
        fn parses_multiple_blocks() {
            let two = format!("{}{}", SAMPLE, SAMPLE.replace('1', "4"));
            let commits = parse_rev_list_headers(&two).unwrap();
            assert_eq!(commits.len(), 2);
            assert_eq!(commits[1].commit_id.as_str(), &"4".repeat(40));
        }

        #[test]
        fn empty_input_is_empty() {
            assert!(parse_rev_list_headers("").unwrap().is_empty());
        }

        #[test]
        fn root_commit_has_no_parents() {
            let root = SAMPLE.replace("parent 3333333333333333333333333333333333333333\n", "");
            let commits = parse_rev_list_headers(&root).unwrap();
            assert!(commits[0].parents.is_empty());
        }
    }

    mod merge_tree_parsing {
        use super::*;

        #[test]
        fn clean_merge_yields_tree() {
            let stdout = format!("{}\0", "a".repeat(40));
            let tree = parse_merge_tree_oid(&stdout).unwrap();
            assert_eq!(tree.as_str(), &"a".repeat(40));
        }

        #[test]
        fn conflict_records_paths() {
            // tree + conflicted entries, then informational groups.
            let stdout = format!(
                "{tree}\0100644 {blob} 1\tsrc/lib.rs\0\0\
                 1\0src/lib.rs\0Auto-merging\0Auto-merging src/lib.rs\n\0\
                 1\0src/lib.rs\0CONFLICT (contents)\0CONFLICT (content): Merge conflict in src/lib.rs\n\0",
                tree = "b".repeat(40),
                blob = "c".repeat(40),
            );
            let conflict = parse_merge_tree_conflicts(&stdout);
            assert_eq!(conflict.tree.clone().unwrap().as_str(), &"b".repeat(40));
            assert_eq!(conflict.files.len(), 2);
            assert_eq!(conflict.conflicting_paths(), vec!["src/lib.rs"]);
            assert_eq!(conflict.files[1].kind, "CONFLICT (contents)");
        }

        #[test]
        fn garbage_informational_section_is_tolerated() {
            let stdout = format!("{}\0\0not-a-number\0x\0", "d".repeat(40));
            let conflict = parse_merge_tree_conflicts(&stdout);
            assert!(conflict.files.is_empty());
            assert!(conflict.tree.is_some());
        }
    }

    mod fingerprints {
        use super::*;

        const DIFF_A: &str = "diff --git a/f b/f\nindex 1111111..2222222 100644\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n";

        #[test]
        fn empty_diff_is_empty_fingerprint() {
            assert_eq!(fingerprint_patch(""), "");
            assert_eq!(fingerprint_patch("  \n"), "");
        }

        #[test]
        fn blob_ids_do_not_affect_fingerprint() {
            let rebased = DIFF_A.replace("1111111..2222222", "3333333..4444444");
            assert_eq!(fingerprint_patch(DIFF_A), fingerprint_patch(&rebased));
        }

        #[test]
        fn content_changes_fingerprint() {
            let other = DIFF_A.replace("+new", "+different");
            assert_ne!(fingerprint_patch(DIFF_A), fingerprint_patch(&other));
        }
    }

    mod push_porcelain {
        use super::*;

        fn target(branch: &str) -> PushTarget {
            PushTarget {
                oid: CommitHash::new("a".repeat(40)).unwrap(),
                branch: branch.to_string(),
                lease: PushLease::Tracking,
            }
        }

        #[test]
        fn all_ok() {
            let stdout = "To github.com:o/r.git\n*\tabc:refs/heads/revup/u/main/foo\t[new branch]\n";
            let outcomes =
                parse_push_porcelain(stdout, &[target("revup/u/main/foo")]).unwrap();
            assert!(outcomes[0].rejection.is_none());
        }

        #[test]
        fn lease_rejection_is_reported() {
            let stdout = concat!(
                "To github.com:o/r.git\n",
                "*\tabc:refs/heads/revup/u/main/foo\t[new branch]\n",
                "!\tdef:refs/heads/revup/u/main/bar\t[rejected] (stale info)\n",
            );
            let outcomes = parse_push_porcelain(
                stdout,
                &[target("revup/u/main/foo"), target("revup/u/main/bar")],
            )
            .unwrap();
            assert!(outcomes[0].rejection.is_none());
            assert_eq!(
                outcomes[1].rejection.as_deref(),
                Some("[rejected] (stale info)")
            );
        }
    }

    mod remote_urls {
        use super::*;

        #[test]
        fn ssh_form() {
            let handle = parse_remote_repo("git@github.com:octo/repo.git", "github.com").unwrap();
            assert_eq!(handle.owner, "octo");
            assert_eq!(handle.name, "repo");
        }

        #[test]
        fn https_form() {
            let handle = parse_remote_repo("https://github.com/octo/repo", "github.com").unwrap();
            assert_eq!(handle, RepoHandle { owner: "octo".into(), name: "repo".into() });
        }

        #[test]
        fn enterprise_host() {
            let handle =
                parse_remote_repo("git@github.example.com:team/tool.git", "github.example.com")
                    .unwrap();
            assert_eq!(handle.owner, "team");
        }

        #[test]
        fn wrong_host_is_none() {
            assert!(parse_remote_repo("git@gitlab.com:octo/repo.git", "github.com").is_none());
        }
    }

    mod helpers {
        use super::*;

        #[test]
        fn uploader_is_email_local_part() {
            assert_eq!(uploader_from_email("ada@example.com"), "ada");
            assert_eq!(uploader_from_email("no-at-sign"), "no-at-sign");
        }

        #[test]
        fn index_info_conversion() {
            let raw = ":100644 100644 aaa bbb M\tsrc/main.rs\n:000000 100644 000 ccc A\tREADME.md";
            let lines = diff_tree_raw_to_index_info(raw).unwrap();
            assert_eq!(lines, vec!["100644 bbb 0\tsrc/main.rs", "100644 ccc 0\tREADME.md"]);
        }
    }
}
