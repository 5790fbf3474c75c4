//! forge::github
//!
//! GitHub forge implementation over the GraphQL API.
//!
//! # Design
//!
//! Everything is batched. One aliased query resolves every PR head ref,
//! user short-form, and label in a single round trip; one aliased mutation
//! creates all new PRs; one more applies every update (field edits, label
//! adds, review requests, draft toggles, comments). Queries are retried on
//! transport failures with bounded backoff; mutations are never retried,
//! because replaying a partially applied mutation batch would duplicate
//! comments and reviews.
//!
//! # Authentication
//!
//! All calls carry a bearer OAuth token. The token never appears in logs;
//! it is registered with the output redaction filter at construction.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;

use super::traits::{
    Forge, ForgeError, PrComment, PrInfo, PrState, PrUpdate, RepoQuery, MAX_COMMENTS_TO_QUERY,
};
use crate::core::types::CommitHash;
use crate::git::RepoHandle;
use crate::ui::output::{self, Verbosity};

/// Concurrent in-flight HTTP requests.
const HTTP_POOL_SIZE: usize = 8;

/// Retry attempts for idempotent (query) requests.
const QUERY_ATTEMPTS: u32 = 3;

/// How many prefix matches to consider when resolving a user short-form.
const USERS_PER_QUERY: usize = 25;

/// GitHub forge client.
pub struct GitHubForge {
    client: Client,
    token: String,
    endpoint: String,
    repo: RepoHandle,
    /// Where head branches live; equals `repo` when not using a fork.
    fork: RepoHandle,
    verbosity: Verbosity,
    pool: Semaphore,
}

impl GitHubForge {
    /// Create a client for a repository (and the fork heads are pushed to).
    pub fn new(
        token: impl Into<String>,
        github_url: &str,
        proxy: Option<&str>,
        repo: RepoHandle,
        fork: RepoHandle,
        verbosity: Verbosity,
    ) -> Result<Self, ForgeError> {
        let token = token.into();
        output::redact(token.clone(), "<GITHUB_OAUTH>");

        let mut builder = Client::builder().timeout(Duration::from_secs(60));
        if let Some(proxy) = proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| ForgeError::Network(format!("invalid proxy: {}", e)))?,
            );
        }
        let client = builder
            .build()
            .map_err(|e| ForgeError::Network(e.to_string()))?;

        Ok(Self {
            client,
            token,
            endpoint: format!("https://api.{}/graphql", github_url),
            repo,
            fork,
            verbosity,
            pool: Semaphore::new(HTTP_POOL_SIZE),
        })
    }

    /// Issue one GraphQL request.
    ///
    /// With `require_success`, GraphQL-level errors become `ForgeError::Api`;
    /// otherwise the raw response is returned so callers can pick through
    /// partial results (used for PR creation, which can partially fail).
    async fn graphql(
        &self,
        query: &str,
        variables: Value,
        require_success: bool,
    ) -> Result<Value, ForgeError> {
        let _permit = self.pool.acquire().await.expect("http pool closed");

        output::debug(format!("# POST {}", self.endpoint), self.verbosity);
        output::debug(format!("GraphQL query:\n{}", query), self.verbosity);
        output::debug(
            format!("GraphQL variables:\n{}", variables),
            self.verbosity,
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header("User-Agent", "revup")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| ForgeError::Network(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ForgeError::Network(format!("bad response body: {}", e)))?;
        output::debug(format!("GraphQL response ({}):\n{}", status, body), self.verbosity);

        match status.as_u16() {
            200 => {}
            401 => return Err(ForgeError::AuthFailed("invalid or expired token".into())),
            403 => {
                return Err(ForgeError::AuthFailed(
                    extract_message(&body).unwrap_or_else(|| "permission denied".into()),
                ))
            }
            429 => return Err(ForgeError::RateLimited),
            s if status.is_server_error() => {
                return Err(ForgeError::Network(format!("server error {}", s)))
            }
            s => {
                return Err(ForgeError::Api {
                    status: s,
                    message: extract_message(&body).unwrap_or_else(|| "request failed".into()),
                })
            }
        }

        if require_success {
            if let Some(errors) = body.get("errors").and_then(Value::as_array) {
                if !errors.is_empty() {
                    let message = errors
                        .iter()
                        .filter_map(|e| e.get("message").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n");
                    return Err(ForgeError::Api { status: 200, message });
                }
            }
        }
        Ok(body)
    }

    /// Query with bounded-backoff retries on transport failures.
    async fn graphql_query(&self, query: &str, variables: Value) -> Result<Value, ForgeError> {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 1;
        loop {
            match self.graphql(query, variables.clone(), true).await {
                Err(err) if err.is_retryable() && attempt < QUERY_ATTEMPTS => {
                    output::warn(
                        format!("forge query failed ({}), retrying in {:?}", err, delay),
                        self.verbosity,
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Forge for GitHubForge {
    async fn query_repo(
        &self,
        head_refs: &[String],
        users: &[String],
        labels: &[String],
    ) -> Result<RepoQuery, ForgeError> {
        let mut declarations = vec!["$owner: String!".to_string(), "$name: String!".to_string()];
        let mut variables = Map::new();
        variables.insert("owner".into(), json!(&self.repo.owner));
        variables.insert("name".into(), json!(&self.repo.name));

        let mut selections = String::new();
        for (i, head) in head_refs.iter().enumerate() {
            declarations.push(format!("$pr{}: String!", i));
            variables.insert(format!("pr{}", i), json!(head));
            selections.push_str(&format!(
                "pr_out{i}: pullRequests(headRefName: $pr{i}, states: [OPEN, MERGED], first: 1, \
                 orderBy: {{direction: DESC, field: UPDATED_AT}}) {{ ...PrResult }}, ",
                i = i
            ));
        }
        for (i, user) in users.iter().enumerate() {
            declarations.push(format!("$user{}: String!", i));
            variables.insert(format!("user{}", i), json!(user));
            selections.push_str(&format!(
                "user_out{i}: assignableUsers(query: $user{i}, first: {n}) {{ ...UserResult }}, ",
                i = i,
                n = USERS_PER_QUERY
            ));
        }
        for (i, label) in labels.iter().enumerate() {
            declarations.push(format!("$label{}: String!", i));
            variables.insert(format!("label{}", i), json!(label));
            selections.push_str(&format!(
                "label_out{i}: label(name: $label{i}) {{ ...LabelResult }}, ",
                i = i
            ));
        }

        let mut query = format!(
            "query GetPrResults({}) {{ repository(name: $name, owner: $owner) {{ id {} }} }}",
            declarations.join(", "),
            selections
        );
        if !users.is_empty() {
            query.push_str(
                "\nfragment UserResult on UserConnection { nodes { login id } totalCount }",
            );
        }
        if !labels.is_empty() {
            query.push_str("\nfragment LabelResult on Label { id name }");
        }
        if !head_refs.is_empty() {
            query.push_str(&format!(
                "\nfragment PrResult on PullRequestConnection {{ nodes {{ \
                 id state url baseRefName headRefOid body title isDraft \
                 commits(first: 1) {{ nodes {{ commit {{ parents(first: 1) {{ nodes {{ oid }} }} }} }} }} \
                 reviewRequests(first: 25) {{ nodes {{ requestedReviewer {{ ... on User {{ login id }} }} }} }} \
                 latestReviews(first: 25) {{ nodes {{ author {{ ... on User {{ login id }} }} viewerDidAuthor }} }} \
                 assignees(first: 25) {{ nodes {{ ... on User {{ login id }} }} }} \
                 labels(first: 25) {{ nodes {{ name id }} }} \
                 comments(first: {}) {{ nodes {{ body id }} }} \
                 }} totalCount }}",
                MAX_COMMENTS_TO_QUERY
            ));
        }

        let body = self.graphql_query(&query, Value::Object(variables)).await?;
        let repository = &body["data"]["repository"];

        let mut result = RepoQuery {
            repo_id: repository["id"].as_str().unwrap_or_default().to_string(),
            ..RepoQuery::default()
        };

        for (i, head) in head_refs.iter().enumerate() {
            let nodes = &repository[format!("pr_out{}", i)]["nodes"];
            let pr = nodes
                .as_array()
                .filter(|nodes| nodes.len() == 1)
                .map(|nodes| parse_pr_node(&nodes[0], head));
            result.prs.push(pr.flatten());
        }

        for (i, name) in users.iter().enumerate() {
            let node = &repository[format!("user_out{}", i)];
            let nodes = node["nodes"].as_array().cloned().unwrap_or_default();
            let total = node["totalCount"].as_u64().unwrap_or(0) as usize;
            if nodes.is_empty() || total > nodes.len() {
                // Nothing matched, or the prefix is too ambiguous to trust.
                result.unresolved_users.push(name.clone());
                continue;
            }
            let best = nodes
                .iter()
                .filter_map(|n| {
                    Some((n["login"].as_str()?, n["id"].as_str()?))
                })
                .min_by_key(|(login, _)| login.len());
            match best {
                Some((login, id)) => {
                    result.user_ids.insert(name.clone(), id.to_string());
                    result.user_logins.insert(name.clone(), login.to_string());
                }
                None => result.unresolved_users.push(name.clone()),
            }
        }

        for (i, name) in labels.iter().enumerate() {
            let node = &repository[format!("label_out{}", i)];
            match node["id"].as_str() {
                Some(id) if !node.is_null() => {
                    result.label_ids.insert(name.clone(), id.to_string());
                }
                _ => result.unresolved_labels.push(name.clone()),
            }
        }

        Ok(result)
    }

    async fn create_prs(&self, repo_id: &str, prs: &mut [PrInfo]) -> Result<(), ForgeError> {
        if prs.is_empty() {
            return Ok(());
        }

        let mut declarations = Vec::new();
        let mut variables = Map::new();
        let mut selections = String::new();
        for (i, pr) in prs.iter().enumerate() {
            let head = if self.fork.owner == self.repo.owner {
                pr.head_ref.clone()
            } else {
                format!("{}:{}", self.fork.owner, pr.head_ref)
            };
            declarations.push(format!("$pr{}: CreatePullRequestInput!", i));
            variables.insert(
                format!("pr{}", i),
                json!({
                    "baseRefName": &pr.base_ref,
                    "body": &pr.body,
                    "clientMutationId": "revup",
                    "headRefName": head,
                    "repositoryId": repo_id,
                    "title": &pr.title,
                    "draft": pr.is_draft,
                }),
            );
            selections.push_str(&format!(
                "pr_out{i}: createPullRequest(input: $pr{i}) {{ pullRequest {{ id url }} }}, ",
                i = i
            ));
        }
        let mutation = format!("mutation ({}) {{ {} }}", declarations.join(", "), selections);

        // Creation can partially fail (e.g. branch already merged), so
        // pick through the response instead of failing wholesale.
        let body = self
            .graphql(&mutation, Value::Object(variables), false)
            .await?;
        for (i, pr) in prs.iter_mut().enumerate() {
            let node = &body["data"][format!("pr_out{}", i)]["pullRequest"];
            if let (Some(id), Some(url)) = (node["id"].as_str(), node["url"].as_str()) {
                pr.id = id.to_string();
                pr.url = url.to_string();
            }
        }
        Ok(())
    }

    async fn update_prs(&self, updates: &[PrUpdate]) -> Result<(), ForgeError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut declarations = Vec::new();
        let mut variables = Map::new();
        // Comment creations render first so fresh comments land on top.
        let mut comment_parts = String::new();
        let mut parts = String::new();
        let mut counter = 0usize;

        let mut alias = |declarations: &mut Vec<String>,
                         variables: &mut Map<String, Value>,
                         target: &mut String,
                         field: &str,
                         input_type: &str,
                         input: Value,
                         counter: &mut usize| {
            let var = format!("in{}", *counter);
            declarations.push(format!("${}: {}!", var, input_type));
            variables.insert(var.clone(), input);
            target.push_str(&format!(
                "out{}: {}(input: ${}) {{ clientMutationId }}, ",
                *counter, field, var
            ));
            *counter += 1;
        };

        for update in updates {
            let mut fields = json!({
                "clientMutationId": "revup",
                "pullRequestId": &update.id,
            });
            let obj = fields.as_object_mut().expect("object literal");
            if let Some(base) = &update.base_ref {
                obj.insert("baseRefName".into(), json!(base));
            }
            if let Some(body) = &update.body {
                obj.insert("body".into(), json!(body));
            }
            if let Some(title) = &update.title {
                obj.insert("title".into(), json!(title));
            }
            alias(
                &mut declarations,
                &mut variables,
                &mut parts,
                "updatePullRequest",
                "UpdatePullRequestInput",
                fields,
                &mut counter,
            );

            if !update.label_ids.is_empty() {
                alias(
                    &mut declarations,
                    &mut variables,
                    &mut parts,
                    "addLabelsToLabelable",
                    "AddLabelsToLabelableInput",
                    json!({
                        "labelIds": &update.label_ids,
                        "clientMutationId": "revup",
                        "labelableId": &update.id,
                    }),
                    &mut counter,
                );
            }
            if !update.reviewer_ids.is_empty() {
                alias(
                    &mut declarations,
                    &mut variables,
                    &mut parts,
                    "requestReviews",
                    "RequestReviewsInput",
                    json!({
                        "userIds": &update.reviewer_ids,
                        "clientMutationId": "revup",
                        "pullRequestId": &update.id,
                        "union": true,
                    }),
                    &mut counter,
                );
            }
            if !update.assignee_ids.is_empty() {
                alias(
                    &mut declarations,
                    &mut variables,
                    &mut parts,
                    "addAssigneesToAssignable",
                    "AddAssigneesToAssignableInput",
                    json!({
                        "assigneeIds": &update.assignee_ids,
                        "clientMutationId": "revup",
                        "assignableId": &update.id,
                    }),
                    &mut counter,
                );
            }
            if let Some(draft) = update.is_draft {
                let (field, input_type) = if draft {
                    ("convertPullRequestToDraft", "ConvertPullRequestToDraftInput")
                } else {
                    (
                        "markPullRequestReadyForReview",
                        "MarkPullRequestReadyForReviewInput",
                    )
                };
                alias(
                    &mut declarations,
                    &mut variables,
                    &mut parts,
                    field,
                    input_type,
                    json!({
                        "clientMutationId": "revup",
                        "pullRequestId": &update.id,
                    }),
                    &mut counter,
                );
            }
            for comment in &update.comments {
                match &comment.id {
                    Some(id) => alias(
                        &mut declarations,
                        &mut variables,
                        &mut parts,
                        "updateIssueComment",
                        "UpdateIssueCommentInput",
                        json!({
                            "body": &comment.text,
                            "clientMutationId": "revup",
                            "id": id,
                        }),
                        &mut counter,
                    ),
                    None => alias(
                        &mut declarations,
                        &mut variables,
                        &mut comment_parts,
                        "addComment",
                        "AddCommentInput",
                        json!({
                            "body": &comment.text,
                            "clientMutationId": "revup",
                            "subjectId": &update.id,
                        }),
                        &mut counter,
                    ),
                }
            }
        }

        let mutation = format!(
            "mutation ({}) {{ {}{} }}",
            declarations.join(", "),
            comment_parts,
            parts
        );
        self.graphql(&mutation, Value::Object(variables), true)
            .await?;
        Ok(())
    }
}

fn extract_message(body: &Value) -> Option<String> {
    body.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parse one PR node from the batched query.
fn parse_pr_node(node: &Value, head_ref: &str) -> Option<PrInfo> {
    let head_oid = node["headRefOid"]
        .as_str()
        .and_then(|s| CommitHash::new(s).ok());
    // GitHub's baseRefOid field reports the tip of the base branch, which
    // may not exist locally. The parent of the PR's first commit is the
    // base it was actually uploaded against.
    let base_oid = node["commits"]["nodes"]
        .as_array()
        .and_then(|nodes| nodes.first())
        .and_then(|n| n["commit"]["parents"]["nodes"][0]["oid"].as_str())
        .and_then(|s| CommitHash::new(s).ok())
        .or_else(|| head_oid.clone());

    let mut info = PrInfo {
        id: node["id"].as_str()?.to_string(),
        url: node["url"].as_str().unwrap_or_default().to_string(),
        state: node["state"].as_str().map(PrState::from_api),
        base_ref: node["baseRefName"].as_str().unwrap_or_default().to_string(),
        head_ref: head_ref.to_string(),
        base_oid,
        head_oid,
        title: node["title"].as_str().unwrap_or_default().to_string(),
        body: node["body"].as_str().unwrap_or_default().to_string(),
        is_draft: node["isDraft"].as_bool().unwrap_or(false),
        ..PrInfo::default()
    };

    for label in node["labels"]["nodes"].as_array().into_iter().flatten() {
        if let (Some(name), Some(id)) = (label["name"].as_str(), label["id"].as_str()) {
            info.labels.insert(name.to_string());
            info.label_ids.insert(id.to_string());
        }
    }
    for request in node["reviewRequests"]["nodes"].as_array().into_iter().flatten() {
        let reviewer = &request["requestedReviewer"];
        if let (Some(login), Some(id)) = (reviewer["login"].as_str(), reviewer["id"].as_str()) {
            info.reviewers.insert(login.to_string());
            info.reviewer_ids.insert(id.to_string());
        }
    }
    for review in node["latestReviews"]["nodes"].as_array().into_iter().flatten() {
        if review["viewerDidAuthor"].as_bool() == Some(false) {
            if let (Some(login), Some(id)) =
                (review["author"]["login"].as_str(), review["author"]["id"].as_str())
            {
                info.reviewers.insert(login.to_string());
                info.reviewer_ids.insert(id.to_string());
            }
        }
    }
    for assignee in node["assignees"]["nodes"].as_array().into_iter().flatten() {
        if let (Some(login), Some(id)) = (assignee["login"].as_str(), assignee["id"].as_str()) {
            info.assignees.insert(login.to_string());
            info.assignee_ids.insert(id.to_string());
        }
    }
    for comment in node["comments"]["nodes"].as_array().into_iter().flatten() {
        info.comments.push(PrComment {
            id: comment["id"].as_str().map(str::to_string),
            text: comment["body"].as_str().unwrap_or_default().to_string(),
        });
    }

    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr_node() -> Value {
        json!({
            "id": "PR_1",
            "state": "OPEN",
            "url": "https://github.com/o/r/pull/1",
            "baseRefName": "main",
            "headRefOid": "a".repeat(40),
            "body": "The body",
            "title": "The title",
            "isDraft": false,
            "commits": { "nodes": [ { "commit": { "parents": { "nodes": [ { "oid": "b".repeat(40) } ] } } } ] },
            "reviewRequests": { "nodes": [ { "requestedReviewer": { "login": "alice", "id": "U_1" } } ] },
            "latestReviews": { "nodes": [
                { "author": { "login": "bob", "id": "U_2" }, "viewerDidAuthor": false },
                { "author": { "login": "me", "id": "U_3" }, "viewerDidAuthor": true }
            ] },
            "assignees": { "nodes": [ { "login": "carol", "id": "U_4" } ] },
            "labels": { "nodes": [ { "name": "bug", "id": "L_1" } ] },
            "comments": { "nodes": [ { "body": "first", "id": "C_1" } ] }
        })
    }

    #[test]
    fn parses_full_pr_node() {
        let info = parse_pr_node(&pr_node(), "revup/ada/main/foo").unwrap();
        assert_eq!(info.id, "PR_1");
        assert_eq!(info.head_ref, "revup/ada/main/foo");
        assert_eq!(info.base_ref, "main");
        assert_eq!(info.head_oid.as_ref().unwrap().as_str(), &"a".repeat(40));
        // base oid comes from the first commit's parent, not the base tip
        assert_eq!(info.base_oid.as_ref().unwrap().as_str(), &"b".repeat(40));
        assert!(info.reviewers.contains("alice"));
        // a review authored by someone else counts as a reviewer
        assert!(info.reviewers.contains("bob"));
        // the viewer's own review does not
        assert!(!info.reviewers.contains("me"));
        assert!(info.assignees.contains("carol"));
        assert!(info.labels.contains("bug"));
        assert_eq!(info.comments.len(), 1);
        assert_eq!(info.comments[0].id.as_deref(), Some("C_1"));
    }

    #[test]
    fn missing_id_means_no_pr() {
        assert!(parse_pr_node(&json!({ "url": "x" }), "head").is_none());
    }
}
