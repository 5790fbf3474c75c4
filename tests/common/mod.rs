//! Shared test fixtures.
//!
//! `TestRepo` builds a throwaway repository with a bare "origin" remote, so
//! tests can exercise the real pipeline end to end: commits are created with
//! the actual git binary, pushes land in the bare remote, and the forge is
//! mocked.

// Each test crate uses a different slice of the fixture.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

use revup::git::{Git, GitOptions, Shell};
use revup::ui::output::Verbosity;

pub const TEST_EMAIL: &str = "test@example.com";

/// A local repository with a bare `origin` remote.
pub struct TestRepo {
    dir: TempDir,
    remote: TempDir,
}

impl TestRepo {
    /// Create a repository with one commit on `main`, pushed to origin.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let remote = TempDir::new().expect("remote temp dir");

        run_git(remote.path(), &["init", "--bare", "-b", "main"]);

        let repo = Self { dir, remote };
        repo.git_ok(&["init", "-b", "main"]);
        repo.git_ok(&["config", "user.email", TEST_EMAIL]);
        repo.git_ok(&["config", "user.name", "Test User"]);
        repo.git_ok(&["config", "core.editor", "true"]);
        repo.git_ok(&["config", "protocol.file.allow", "always"]);

        std::fs::write(repo.path().join("README.md"), "# test\n").unwrap();
        repo.git_ok(&["add", "README.md"]);
        repo.git_ok(&["commit", "-m", "Initial commit"]);

        let remote_path = repo.remote.path().to_string_lossy().into_owned();
        repo.git_ok(&["remote", "add", "origin", &remote_path]);
        repo.git_ok(&["push", "-u", "origin", "main"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the work repo, panicking on failure; returns stdout.
    pub fn git_ok(&self, args: &[&str]) -> String {
        run_git(self.path(), args)
    }

    /// Write a file and commit it with the given message.
    pub fn commit_file(&self, file: &str, content: &str, message: &str) {
        std::fs::write(self.path().join(file), content).unwrap();
        self.git_ok(&["add", file]);
        self.git_ok(&["commit", "-m", message]);
    }

    /// Commit with no tree change.
    pub fn commit_empty(&self, message: &str) {
        self.git_ok(&["commit", "--allow-empty", "-m", message]);
    }

    /// Open the adapter on this repository.
    pub async fn open(&self) -> Git {
        self.open_with(GitOptions::default()).await
    }

    pub async fn open_with(&self, options: GitOptions) -> Git {
        let shell = Shell::new(self.path().to_path_buf(), Verbosity::Quiet);
        Git::open(shell, options).await.expect("open test repo")
    }

    /// Branch heads currently on the bare remote.
    pub fn remote_refs(&self) -> HashMap<String, String> {
        let out = run_git(
            self.remote.path(),
            &["for-each-ref", "--format=%(refname) %(objectname)", "refs/heads"],
        );
        out.lines()
            .filter_map(|line| {
                let (name, oid) = line.split_once(' ')?;
                Some((
                    name.strip_prefix("refs/heads/").unwrap_or(name).to_string(),
                    oid.to_string(),
                ))
            })
            .collect()
    }

    /// Resolve a rev in the work repo.
    pub fn rev_parse(&self, rev: &str) -> String {
        self.git_ok(&["rev-parse", rev]).trim().to_string()
    }
}

/// Run git in a directory, panicking on failure.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_DATE", "2024-05-01T12:00:00 +0000")
        .env("GIT_COMMITTER_DATE", "2024-05-01T12:00:00 +0000")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed:\n{}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}
