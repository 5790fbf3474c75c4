//! Integration tests for the git adapter against real repositories.

mod common;

use common::{TestRepo, TEST_EMAIL};

use revup::core::types::CommitHash;
use revup::git::{GitError, GitOptions, PushLease, PushTarget};

#[tokio::test]
async fn open_resolves_identity_and_falls_back_to_master() {
    let repo = TestRepo::new();
    let git = repo.open().await;
    assert_eq!(git.email, TEST_EMAIL);
    assert_eq!(git.uploader(), "test");
    assert_eq!(git.main_branch, "main");

    // A repo tracking only origin/master falls back from main.
    let repo = TestRepo::new();
    repo.git_ok(&["push", "origin", "main:master"]);
    repo.git_ok(&["update-ref", "-d", "refs/remotes/origin/main"]);
    let git = repo.open().await;
    assert_eq!(git.main_branch, "master");
}

#[tokio::test]
async fn rev_list_headers_parse_real_commits() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "Add a\n\nTopic: foo\nReviewers: alice");
    repo.commit_file("b.txt", "b\n", "Add b");
    let git = repo.open().await;

    let commits = git
        .rev_list_headers("HEAD", Some("origin/main"))
        .await
        .unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].subject(), "Add a");
    assert_eq!(commits[0].body(), "Topic: foo\nReviewers: alice");
    assert_eq!(commits[0].author_email, TEST_EMAIL);
    assert_eq!(commits[1].subject(), "Add b");
    assert_eq!(
        commits[1].first_parent().unwrap().as_str(),
        commits[0].commit_id.as_str()
    );
}

#[tokio::test]
async fn fork_point_and_distance() {
    let repo = TestRepo::new();
    let main_tip = repo.rev_parse("HEAD");
    repo.commit_file("a.txt", "a\n", "one");
    repo.commit_file("b.txt", "b\n", "two");
    let git = repo.open().await;

    let fork = git.fork_point("HEAD", "origin/main").await.unwrap();
    assert_eq!(fork.as_str(), main_tip);
    assert_eq!(
        git.distance_to_fork_point("HEAD", "origin/main", 0)
            .await
            .unwrap(),
        2
    );
    assert!(git.is_ancestor("origin/main", "HEAD").await.unwrap());
    assert!(!git.is_ancestor("HEAD", "origin/main").await.unwrap());

    // A head with no commits of its own forks at itself.
    let fork = git.fork_point("origin/main", "HEAD").await.unwrap();
    assert_eq!(fork.as_str(), main_tip);
}

#[tokio::test]
async fn cherry_pick_preserves_author_and_message() {
    let repo = TestRepo::new();
    let base = repo.rev_parse("HEAD");
    repo.commit_file("noise.txt", "noise\n", "Unrelated change");
    repo.commit_file("a.txt", "a\n", "Add a\n\nWith a body");
    let git = repo.open().await;

    let commits = git
        .rev_list_headers("HEAD", Some("origin/main"))
        .await
        .unwrap();
    let to_pick = &commits[1];
    let new_parent = CommitHash::new(base.clone()).unwrap();

    let picked = git
        .cherry_pick_commit(to_pick, &new_parent, &to_pick.message)
        .await
        .unwrap();
    let picked_header = git.commit_header(picked.as_str()).await.unwrap();
    assert_eq!(picked_header.message, to_pick.message);
    assert_eq!(picked_header.author_email, to_pick.author_email);
    assert_eq!(picked_header.author_date, to_pick.author_date);
    assert_eq!(picked_header.first_parent().unwrap().as_str(), base);

    // The user's repository state is untouched.
    assert_eq!(repo.git_ok(&["status", "--porcelain"]).trim(), "");
}

#[tokio::test]
async fn cherry_pick_repeats_are_stable_within_one_invocation() {
    let repo = TestRepo::new();
    let base = repo.rev_parse("HEAD");
    repo.commit_file("noise.txt", "noise\n", "Unrelated change");
    repo.commit_file("a.txt", "a\n", "Add a");
    let git = repo.open().await;

    let commits = git
        .rev_list_headers("HEAD", Some("origin/main"))
        .await
        .unwrap();
    let new_parent = CommitHash::new(base).unwrap();
    let first = git
        .cherry_pick_commit(&commits[1], &new_parent, &commits[1].message)
        .await
        .unwrap();
    let second = git
        .cherry_pick_commit(&commits[1], &new_parent, &commits[1].message)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn cherry_pick_conflict_reports_paths() {
    let repo = TestRepo::new();
    repo.commit_file("shared.txt", "base\n", "Set up shared file");
    repo.git_ok(&["push", "origin", "main"]);
    let base = repo.rev_parse("HEAD");
    repo.commit_file("shared.txt", "first edit\n", "First edit");
    repo.commit_file("shared.txt", "second edit\n", "Second edit");
    let git = repo.open().await;

    let commits = git
        .rev_list_headers("HEAD", Some("origin/main"))
        .await
        .unwrap();
    // Picking the second edit directly onto the base conflicts: its parent
    // had "first edit" there.
    let err = git
        .cherry_pick_commit(
            &commits[1],
            &CommitHash::new(base).unwrap(),
            &commits[1].message,
        )
        .await
        .unwrap_err();
    match err {
        GitError::Conflict(conflict) => {
            assert!(conflict.conflicting_paths().contains(&"shared.txt"));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn patch_fingerprints_survive_rebases() {
    let repo = TestRepo::new();
    let base = repo.rev_parse("HEAD");
    repo.commit_file("noise.txt", "noise\n", "Unrelated change");
    repo.commit_file("a.txt", "a\n", "Add a");
    let git = repo.open().await;

    let commits = git
        .rev_list_headers("HEAD", Some("origin/main"))
        .await
        .unwrap();
    let original = git
        .patch_fingerprint(commits[1].first_parent().unwrap(), &commits[1].commit_id)
        .await
        .unwrap();

    // Rebase the commit onto the base and fingerprint the copy.
    let new_parent = CommitHash::new(base).unwrap();
    let picked = git
        .cherry_pick_commit(&commits[1], &new_parent, &commits[1].message)
        .await
        .unwrap();
    let rebased = git.patch_fingerprint(&new_parent, &picked).await.unwrap();
    assert_eq!(original, rebased);

    // A different change fingerprints differently.
    let other = git
        .patch_fingerprint(commits[0].first_parent().unwrap(), &commits[0].commit_id)
        .await
        .unwrap();
    assert_ne!(original, other);
}

#[tokio::test]
async fn identical_trees_detect_empty_commits() {
    let repo = TestRepo::new();
    repo.commit_empty("An empty commit");
    let git = repo.open().await;
    assert!(git.have_identical_trees("HEAD", "HEAD~1").await.unwrap());

    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "Not empty");
    let git = repo.open().await;
    assert!(!git.have_identical_trees("HEAD", "HEAD~1").await.unwrap());
}

#[tokio::test]
async fn base_branch_detection_prefers_nearest() {
    let repo = TestRepo::new();
    // rel1.1 diverges from main, and the stack continues from rel1.1.
    repo.commit_file("rel.txt", "rel\n", "Release branch work");
    repo.git_ok(&["push", "origin", "main:rel1.1"]);
    repo.commit_file("feature.txt", "f\n", "Feature work");

    let git = repo
        .open_with(GitOptions {
            base_branch_globs: vec!["rel*".to_string()],
            ..GitOptions::default()
        })
        .await;
    let best = git.best_base_branch("HEAD").await.unwrap();
    assert_eq!(best, "origin/rel1.1");
}

#[tokio::test]
async fn push_refs_honors_leases() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "Add a");
    let head = CommitHash::new(repo.rev_parse("HEAD")).unwrap();
    let git = repo.open().await;

    // New branch with an absent lease lands.
    let outcomes = git
        .push_refs(
            "origin",
            &[PushTarget {
                oid: head.clone(),
                branch: "revup/test/main/foo".to_string(),
                lease: PushLease::Absent,
            }],
        )
        .await
        .unwrap();
    assert!(outcomes[0].rejection.is_none());
    assert_eq!(
        repo.remote_refs()["revup/test/main/foo"],
        head.as_str().to_string()
    );

    // Re-pushing with a stale expectation is rejected per-ref.
    let stale = CommitHash::new(repo.rev_parse("HEAD~1")).unwrap();
    let outcomes = git
        .push_refs(
            "origin",
            &[PushTarget {
                oid: stale.clone(),
                branch: "revup/test/main/foo".to_string(),
                lease: PushLease::Expect(stale.clone()),
            }],
        )
        .await
        .unwrap();
    assert!(outcomes[0].rejection.is_some());
    // The remote kept the original head.
    assert_eq!(
        repo.remote_refs()["revup/test/main/foo"],
        head.as_str().to_string()
    );
}

#[tokio::test]
async fn update_local_branch_creates_and_moves() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "Add a");
    let head = CommitHash::new(repo.rev_parse("HEAD")).unwrap();
    let git = repo.open().await;

    git.update_local_branch("revup/test/main/foo", &head)
        .await
        .unwrap();
    assert_eq!(repo.rev_parse("refs/heads/revup/test/main/foo"), head.as_str());

    let older = CommitHash::new(repo.rev_parse("HEAD~1")).unwrap();
    git.update_local_branch("revup/test/main/foo", &older)
        .await
        .unwrap();
    assert_eq!(
        repo.rev_parse("refs/heads/revup/test/main/foo"),
        older.as_str()
    );
}

#[tokio::test]
async fn virtual_diff_target_hides_upstream_movement() {
    let repo = TestRepo::new();
    let old_base = CommitHash::new(repo.rev_parse("HEAD")).unwrap();
    // The old head changed a.txt on the old base.
    repo.commit_file("a.txt", "feature\n", "Feature change");
    let old_head = CommitHash::new(repo.rev_parse("HEAD")).unwrap();
    // Upstream moved: main gained an unrelated file.
    repo.git_ok(&["checkout", "-q", "-b", "upstream", "main"]);
    repo.git_ok(&["reset", "-q", "--hard", old_base.as_str()]);
    repo.commit_file("upstream.txt", "u\n", "Upstream change");
    let new_base = CommitHash::new(repo.rev_parse("HEAD")).unwrap();
    repo.commit_file("a.txt", "feature\n", "Feature change rebased");
    let new_head = CommitHash::new(repo.rev_parse("HEAD")).unwrap();

    let git = repo.open().await;
    let target = git
        .make_virtual_diff_target(&old_base, &old_head, &new_base, &new_head, None)
        .await
        .unwrap();

    // Diffing target..new_head must not mention the upstream file.
    let diff = repo.git_ok(&["diff", "--name-only", target.as_str(), new_head.as_str()]);
    assert!(!diff.contains("upstream.txt"), "upstream leak: {}", diff);
}
