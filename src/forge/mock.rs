//! forge::mock
//!
//! In-memory forge implementation for deterministic testing.
//!
//! # Design
//!
//! The mock stores PRs, users, and labels in memory behind a mutex, mirrors
//! the GitHub client's resolution rules (shortest prefix match for users,
//! exact match for labels), and records every mutation so tests can assert
//! on exactly what the reconciler decided to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::traits::{
    Forge, ForgeError, PrComment, PrInfo, PrState, PrUpdate, RepoQuery, MAX_COMMENTS_TO_QUERY,
};

/// Recorded mutation, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOperation {
    CreatePr {
        head: String,
        base: String,
        title: String,
        draft: bool,
    },
    UpdatePr {
        id: String,
        base: Option<String>,
        title: Option<String>,
        body: Option<String>,
        draft: Option<bool>,
    },
    AddComment {
        pr: String,
        text: String,
    },
    EditComment {
        id: String,
        text: String,
    },
}

#[derive(Debug, Default)]
struct MockForgeInner {
    prs: Vec<PrInfo>,
    /// login -> node id
    users: HashMap<String, String>,
    /// name -> node id
    labels: HashMap<String, String>,
    next_pr: u64,
    next_comment: u64,
    operations: Vec<MockOperation>,
    fail_next: Option<ForgeError>,
}

/// Mock forge. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockForge {
    inner: Arc<Mutex<MockForgeInner>>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolvable user.
    pub fn add_user(&self, login: &str) {
        let mut inner = self.lock();
        let id = format!("U_{}", login);
        inner.users.insert(login.to_string(), id);
    }

    /// Register an existing label.
    pub fn add_label(&self, name: &str) {
        let mut inner = self.lock();
        let id = format!("L_{}", name);
        inner.labels.insert(name.to_string(), id);
    }

    /// Seed a pre-existing PR (id and url are assigned).
    pub fn seed_pr(&self, mut pr: PrInfo) -> String {
        let mut inner = self.lock();
        inner.next_pr += 1;
        pr.id = format!("PR_{}", inner.next_pr);
        pr.url = format!("https://github.example/pull/{}", inner.next_pr);
        if pr.state.is_none() {
            pr.state = Some(PrState::Open);
        }
        let id = pr.id.clone();
        inner.prs.push(pr);
        id
    }

    /// Make the next forge call fail with the given error.
    pub fn fail_next(&self, error: ForgeError) {
        self.lock().fail_next = Some(error);
    }

    /// The current state of a PR, by head ref.
    pub fn pr_by_head(&self, head: &str) -> Option<PrInfo> {
        self.lock().prs.iter().rev().find(|p| p.head_ref == head).cloned()
    }

    /// Everything the callers mutated, in order.
    pub fn operations(&self) -> Vec<MockOperation> {
        self.lock().operations.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockForgeInner> {
        self.inner.lock().expect("mock forge lock")
    }

    fn take_failure(&self) -> Option<ForgeError> {
        self.lock().fail_next.take()
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn query_repo(
        &self,
        head_refs: &[String],
        users: &[String],
        labels: &[String],
    ) -> Result<RepoQuery, ForgeError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let inner = self.lock();

        let mut result = RepoQuery {
            repo_id: "R_1".to_string(),
            ..RepoQuery::default()
        };

        for head in head_refs {
            let pr = inner
                .prs
                .iter()
                .rev()
                .find(|p| p.head_ref == *head)
                .map(|p| {
                    let mut pr = p.clone();
                    pr.comments.truncate(MAX_COMMENTS_TO_QUERY);
                    pr
                });
            result.prs.push(pr);
        }

        for name in users {
            let best = inner
                .users
                .iter()
                .filter(|(login, _)| login.starts_with(name.as_str()))
                .min_by_key(|(login, _)| login.len());
            match best {
                Some((login, id)) => {
                    result.user_ids.insert(name.clone(), id.clone());
                    result.user_logins.insert(name.clone(), login.clone());
                }
                None => result.unresolved_users.push(name.clone()),
            }
        }

        for name in labels {
            match inner.labels.get(name) {
                Some(id) => {
                    result.label_ids.insert(name.clone(), id.clone());
                }
                None => result.unresolved_labels.push(name.clone()),
            }
        }

        Ok(result)
    }

    async fn create_prs(&self, _repo_id: &str, prs: &mut [PrInfo]) -> Result<(), ForgeError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut inner = self.lock();
        for pr in prs.iter_mut() {
            inner.next_pr += 1;
            pr.id = format!("PR_{}", inner.next_pr);
            pr.url = format!("https://github.example/pull/{}", inner.next_pr);
            pr.state = Some(PrState::Open);
            inner.operations.push(MockOperation::CreatePr {
                head: pr.head_ref.clone(),
                base: pr.base_ref.clone(),
                title: pr.title.clone(),
                draft: pr.is_draft,
            });
            inner.prs.push(pr.clone());
        }
        Ok(())
    }

    async fn update_prs(&self, updates: &[PrUpdate]) -> Result<(), ForgeError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut inner = self.lock();
        for update in updates {
            inner.operations.push(MockOperation::UpdatePr {
                id: update.id.clone(),
                base: update.base_ref.clone(),
                title: update.title.clone(),
                body: update.body.clone(),
                draft: update.is_draft,
            });

            // Comment mutations are logged even when the PR is unknown, the
            // way a real batch would fail piecewise.
            for comment in &update.comments {
                match &comment.id {
                    Some(id) => inner.operations.push(MockOperation::EditComment {
                        id: id.clone(),
                        text: comment.text.clone(),
                    }),
                    None => inner.operations.push(MockOperation::AddComment {
                        pr: update.id.clone(),
                        text: comment.text.clone(),
                    }),
                }
            }

            let labels: Vec<(String, String)> = inner
                .labels
                .iter()
                .map(|(name, id)| (name.clone(), id.clone()))
                .collect();
            let users: Vec<(String, String)> = inner
                .users
                .iter()
                .map(|(login, id)| (login.clone(), id.clone()))
                .collect();
            let mut next_comment = inner.next_comment;

            let Some(pr) = inner.prs.iter_mut().find(|p| p.id == update.id) else {
                continue;
            };
            if let Some(base) = &update.base_ref {
                pr.base_ref = base.clone();
            }
            if let Some(title) = &update.title {
                pr.title = title.clone();
            }
            if let Some(body) = &update.body {
                pr.body = body.clone();
            }
            if let Some(draft) = update.is_draft {
                pr.is_draft = draft;
            }
            for id in &update.label_ids {
                pr.label_ids.insert(id.clone());
                if let Some((name, _)) = labels.iter().find(|(_, lid)| lid == id) {
                    pr.labels.insert(name.clone());
                }
            }
            for id in &update.reviewer_ids {
                pr.reviewer_ids.insert(id.clone());
                if let Some((login, _)) = users.iter().find(|(_, uid)| uid == id) {
                    pr.reviewers.insert(login.clone());
                }
            }
            for id in &update.assignee_ids {
                pr.assignee_ids.insert(id.clone());
                if let Some((login, _)) = users.iter().find(|(_, uid)| uid == id) {
                    pr.assignees.insert(login.clone());
                }
            }
            for comment in &update.comments {
                match &comment.id {
                    Some(id) => {
                        if let Some(existing) =
                            pr.comments.iter_mut().find(|c| c.id.as_ref() == Some(id))
                        {
                            existing.text = comment.text.clone();
                        }
                    }
                    None => {
                        next_comment += 1;
                        pr.comments.push(PrComment {
                            id: Some(format!("C_{}", next_comment)),
                            text: comment.text.clone(),
                        });
                    }
                }
            }
            inner.next_comment = next_comment;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_assigns_ids_and_urls() {
        let forge = MockForge::new();
        let mut prs = vec![PrInfo {
            head_ref: "revup/ada/main/foo".into(),
            base_ref: "main".into(),
            title: "Add foo".into(),
            ..PrInfo::default()
        }];
        forge.create_prs("R_1", &mut prs).await.unwrap();
        assert_eq!(prs[0].id, "PR_1");
        assert!(prs[0].url.ends_with("/pull/1"));
        assert!(forge.pr_by_head("revup/ada/main/foo").is_some());
    }

    #[tokio::test]
    async fn query_resolves_shortest_prefix_match() {
        let forge = MockForge::new();
        forge.add_user("alice");
        forge.add_user("alicia");
        let result = forge
            .query_repo(&[], &["ali".to_string(), "nobody".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(result.user_logins["ali"], "alice");
        assert_eq!(result.unresolved_users, vec!["nobody"]);
    }

    #[tokio::test]
    async fn update_applies_fields_and_comments() {
        let forge = MockForge::new();
        forge.add_label("bug");
        let id = forge.seed_pr(PrInfo {
            head_ref: "revup/ada/main/foo".into(),
            base_ref: "main".into(),
            title: "old".into(),
            ..PrInfo::default()
        });
        forge
            .update_prs(&[PrUpdate {
                id: id.clone(),
                title: Some("new".into()),
                label_ids: ["L_bug".to_string()].into(),
                comments: vec![PrComment {
                    id: None,
                    text: "hello".into(),
                }],
                ..PrUpdate::default()
            }])
            .await
            .unwrap();
        let pr = forge.pr_by_head("revup/ada/main/foo").unwrap();
        assert_eq!(pr.title, "new");
        assert!(pr.labels.contains("bug"));
        assert_eq!(pr.comments.len(), 1);
        assert!(forge
            .operations()
            .iter()
            .any(|op| matches!(op, MockOperation::AddComment { .. })));
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let forge = MockForge::new();
        forge.fail_next(ForgeError::RateLimited);
        assert!(forge.query_repo(&[], &[], &[]).await.is_err());
        assert!(forge.query_repo(&[], &[], &[]).await.is_ok());
    }
}
