//! Topic graph construction and validation against real repositories.

mod common;

use common::TestRepo;

use revup::topics::{AutoAddUsers, BranchFormat, ReviewOptions, StackError, TopicStack};
use revup::ui::output::Verbosity;

fn review_options() -> ReviewOptions {
    ReviewOptions {
        uploader: "test".to_string(),
        self_authored_only: true,
        ..ReviewOptions::default()
    }
}

fn stack(git: &revup::git::Git) -> TopicStack<'_> {
    TopicStack::new(
        git,
        Verbosity::Quiet,
        "HEAD".to_string(),
        None,
        None,
        BranchFormat::default(),
    )
}

#[tokio::test]
async fn groups_commits_by_topic_in_first_appearance_order() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar");
    repo.commit_file("c.txt", "c\n", "Three\n\nTopic: foo");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    assert_eq!(topics.topics.len(), 2);
    assert_eq!(topics.topics[0].name, "foo");
    assert_eq!(topics.topics[0].commits.len(), 2);
    assert_eq!(topics.topics[1].name, "bar");
}

#[tokio::test]
async fn topicless_commits_are_held_back_unless_auto_topic() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "Just a change");
    let git = repo.open().await;

    let mut topics = stack(&git);
    let err = topics.populate_topics(false, false, &[]).await.unwrap_err();
    assert!(matches!(err, StackError::NoTopics(1)));

    let mut topics = stack(&git);
    topics.populate_topics(true, false, &[]).await.unwrap();
    assert_eq!(topics.topics[0].name, "Just_a_change");
}

#[tokio::test]
async fn relative_must_appear_after_its_target() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo\nRelative: bar");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    let err = topics.populate_reviews(&review_options()).await.unwrap_err();
    assert!(matches!(err, StackError::RelativeOrder { .. }));
}

#[tokio::test]
async fn unknown_relative_is_assumed_merged() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo\nRelative: landed-long-ago");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    topics.populate_reviews(&review_options()).await.unwrap();
    // Treated as a root topic on the detected base.
    assert_eq!(topics.topics[0].relative, None);
    assert_eq!(topics.reviews.len(), 1);
    assert_eq!(topics.reviews[0].remote_base, "main");
}

#[tokio::test]
async fn branch_sets_must_nest_within_the_relative() {
    let repo = TestRepo::new();
    repo.git_ok(&["push", "origin", "main:rel1.1"]);
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo\nBranches: main");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar\nRelative: foo\nBranches: rel1.1");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    let err = topics.populate_reviews(&review_options()).await.unwrap_err();
    assert!(matches!(err, StackError::BranchesNotInRelative { .. }));
}

#[tokio::test]
async fn relative_inherits_branches_and_produces_one_review_per_base() {
    let repo = TestRepo::new();
    repo.git_ok(&["push", "origin", "main:rel1.1"]);
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo\nBranches: main, rel1.1");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar\nRelative: foo");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    topics.populate_reviews(&review_options()).await.unwrap();

    // Two reviews per topic, and bar's reviews target foo's heads.
    assert_eq!(topics.reviews.len(), 4);
    let bar_main = topics
        .reviews
        .iter()
        .find(|r| r.remote_head == "revup/test/main/bar")
        .unwrap();
    assert_eq!(bar_main.remote_base, "revup/test/main/foo");
    let bar_rel = topics
        .reviews
        .iter()
        .find(|r| r.remote_head == "revup/test/rel1.1/bar")
        .unwrap();
    assert_eq!(bar_rel.remote_base, "revup/test/rel1.1/foo");
}

#[tokio::test]
async fn uploader_disagreement_with_relative_fails() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo\nUploader: ada");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar\nRelative: foo\nUploader: grace");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    let err = topics.populate_reviews(&review_options()).await.unwrap_err();
    assert!(matches!(err, StackError::UploaderMismatch { .. }));
}

#[tokio::test]
async fn relative_chain_ignores_relative_tags() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar");
    repo.commit_file("c.txt", "c\n", "Three\n\nTopic: baz\nRelative: foo");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    topics
        .populate_reviews(&ReviewOptions {
            relative_chain: true,
            ..review_options()
        })
        .await
        .unwrap();

    // Chained in commit order: foo <- bar <- baz, Relative tag ignored.
    assert_eq!(topics.topics[1].relative, Some(0));
    assert_eq!(topics.topics[2].relative, Some(1));
    let baz = topics
        .reviews
        .iter()
        .find(|r| r.remote_head == "revup/test/main/baz")
        .unwrap();
    assert_eq!(baz.remote_base, "revup/test/main/bar");
}

#[tokio::test]
async fn empty_only_topics_are_dropped() {
    let repo = TestRepo::new();
    repo.commit_empty("Marker\n\nTopic: empty");
    repo.commit_file("a.txt", "a\n", "Real\n\nTopic: real");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    topics.populate_reviews(&review_options()).await.unwrap();
    assert_eq!(topics.topics.len(), 1);
    assert_eq!(topics.topics[0].name, "real");
    assert_eq!(topics.reviews.len(), 1);
}

#[tokio::test]
async fn dropped_relative_links_are_rewired_through() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo");
    repo.commit_empty("Gap\n\nTopic: gap\nRelative: foo");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar\nRelative: gap");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    topics.populate_reviews(&review_options()).await.unwrap();

    // The empty topic disappears; bar re-parents onto foo.
    assert_eq!(topics.topics.len(), 2);
    let bar = topics
        .reviews
        .iter()
        .find(|r| r.remote_head == "revup/test/main/bar")
        .unwrap();
    assert_eq!(bar.remote_base, "revup/test/main/foo");
}

#[tokio::test]
async fn disagreeing_single_valued_directives_fail() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo\nUploader: ada");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: foo\nUploader: grace");
    let git = repo.open().await;

    let mut topics = stack(&git);
    let err = topics.populate_topics(false, false, &[]).await.unwrap_err();
    assert!(matches!(err, StackError::ConflictingValues { .. }));
}

#[tokio::test]
async fn positional_topics_limit_the_upload_with_ancestors() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "One\n\nTopic: foo");
    repo.commit_file("b.txt", "b\n", "Two\n\nTopic: bar\nRelative: foo");
    repo.commit_file("c.txt", "c\n", "Three\n\nTopic: baz");
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics
        .populate_topics(false, false, &["bar".to_string()])
        .await
        .unwrap();
    let names: Vec<&str> = topics.topics.iter().map(|t| t.name.as_str()).collect();
    // bar pulls in its relative ancestor foo; baz is left out.
    assert_eq!(names, vec!["foo", "bar"]);
}

#[tokio::test]
async fn non_self_authored_topics_are_skipped() {
    let repo = TestRepo::new();
    repo.commit_file("a.txt", "a\n", "Mine\n\nTopic: mine");
    repo.git_ok(&[
        "-c",
        "user.email=other@example.com",
        "-c",
        "user.name=Other",
        "commit",
        "--allow-empty",
        "-m",
        "Theirs\n\nTopic: theirs",
    ]);
    std::fs::write(repo.path().join("t.txt"), "t\n").unwrap();
    repo.git_ok(&["add", "t.txt"]);
    repo.git_ok(&[
        "-c",
        "user.email=other@example.com",
        "-c",
        "user.name=Other",
        "commit",
        "-m",
        "Theirs too\n\nTopic: theirs",
    ]);
    let git = repo.open().await;

    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    topics.populate_reviews(&review_options()).await.unwrap();
    assert_eq!(topics.topics.len(), 1);
    assert_eq!(topics.topics[0].name, "mine");

    // With the filter off, both topics upload.
    let mut topics = stack(&git);
    topics.populate_topics(false, false, &[]).await.unwrap();
    topics
        .populate_reviews(&ReviewOptions {
            self_authored_only: false,
            auto_add_users: AutoAddUsers::No,
            ..review_options()
        })
        .await
        .unwrap();
    assert_eq!(topics.topics.len(), 2);
}
