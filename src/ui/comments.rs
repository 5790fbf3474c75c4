//! ui::comments
//!
//! Pure functions rendering the two PR comments revup maintains: the review
//! graph and the patchsets table.
//!
//! # Design
//!
//! These functions take immutable inputs and return strings. Rendering is
//! byte-stable for the same input, so the reconciler decides whether to
//! update a comment by comparing the rendered text with what is already on
//! the PR. Lines use CRLF throughout because the forge normalizes comment
//! bodies to CRLF; anything else would make every comparison miss.
//!
//! The patchsets comment is append-only and is itself the source of truth
//! for patchset history: [`parse_rows`] recovers every row from a rendered
//! comment.

use crate::core::types::CommitHash;

/// First line of a review-graph comment; also how one is recognized.
pub const REVIEW_GRAPH_HEADER: &str = "Reviews in this chain:\r\n";

/// Header of a patchsets comment; also how one is recognized.
pub const PATCHSETS_HEADER: &str =
    "| # | head | base | diff | diff (upstream) | date | summary |\r\n| - | - | - | - | - | - | - |";

/// One PR in a relative chain, for graph rendering.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub url: String,
    pub title: String,
    /// Indexes of nodes whose PRs target this one.
    pub children: Vec<usize>,
}

/// Render the chain rooted at `root` as a box-drawing tree, ancestors
/// first, one PR per line.
pub fn render_chain(nodes: &[GraphNode], root: usize) -> String {
    let mut out = String::new();
    render_chain_node(nodes, root, "", "└", &mut out);
    out
}

fn render_chain_node(nodes: &[GraphNode], index: usize, back: &str, prefix: &str, out: &mut String) {
    let node = &nodes[index];
    out.push_str(&format!("{}{}{} {}\r\n", back, prefix, node.url, node.title));
    let child_back = format!("{}{}", back, if prefix == "└" { "\u{3000}" } else { "│" });
    for (i, &child) in node.children.iter().enumerate() {
        let child_prefix = if i == node.children.len() - 1 { "└" } else { "├" };
        render_chain_node(nodes, child, &child_back, child_prefix, out);
    }
}

/// The full review-graph comment for one PR: the chain with that PR's own
/// line bolded.
pub fn render_review_graph(chain: &str, url: &str, title: &str) -> String {
    let highlighted = chain
        .replace(url, &format!("**{}**", url))
        .replace(title, &format!("**{}**", title));
    format!("{}{}", REVIEW_GRAPH_HEADER, highlighted)
}

/// One row of the patchsets table.
///
/// Cells hold already-rendered markdown (links included); this keeps
/// rendering and parsing exact inverses of each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchsetRow {
    pub number: u64,
    pub head: String,
    pub base: String,
    pub diff: String,
    pub upstream_diff: String,
    pub date: String,
    pub summary: String,
}

/// Markdown link to a commit, relative to the forge root.
pub fn commit_link(owner: &str, repo: &str, oid: &CommitHash) -> String {
    format!("[{}](/{}/{}/commit/{})", oid.short(), owner, repo, oid)
}

/// Markdown `diff` link comparing two commits.
pub fn compare_link(owner: &str, repo: &str, from: &CommitHash, to: &CommitHash) -> String {
    format!("[diff](/{}/{}/compare/{}..{})", owner, repo, from, to)
}

/// Append a row to an existing patchsets comment (or start a fresh one when
/// `existing` is `None`).
pub fn append_row(existing: Option<&str>, row: &PatchsetRow) -> String {
    let mut text = existing.unwrap_or(PATCHSETS_HEADER).to_string();
    text.push_str(&format!(
        "\r\n| {} | {} | {} | {} | {} | {} | {} |",
        row.number, row.head, row.base, row.diff, row.upstream_diff, row.date, row.summary
    ));
    text
}

/// The number the next appended row should carry, reading the last row of
/// an existing comment. `None` when the comment isn't a patchsets table or
/// its last row doesn't parse.
pub fn next_number(existing: &str) -> Option<u64> {
    if !existing.starts_with(PATCHSETS_HEADER) {
        return None;
    }
    if existing.len() == PATCHSETS_HEADER.len() {
        return Some(0);
    }
    let last = existing.split("\r\n").last()?;
    let cells: Vec<&str> = last.split('|').collect();
    if cells.len() < 2 {
        return None;
    }
    cells[1].trim().parse::<u64>().ok().map(|n| n + 1)
}

/// Recover all rows from a rendered patchsets comment, in order.
pub fn parse_rows(text: &str) -> Vec<PatchsetRow> {
    let Some(body) = text.strip_prefix(PATCHSETS_HEADER) else {
        return Vec::new();
    };
    body.split("\r\n")
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let cells: Vec<&str> = line.split('|').map(str::trim).collect();
            // Leading and trailing '|' produce empty first/last cells.
            if cells.len() != 9 {
                return None;
            }
            Some(PatchsetRow {
                number: cells[1].parse().ok()?,
                head: cells[2].to_string(),
                base: cells[3].to_string(),
                diff: cells[4].to_string(),
                upstream_diff: cells[5].to_string(),
                date: cells[6].to_string(),
                summary: cells[7].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(fill: char) -> CommitHash {
        CommitHash::new(fill.to_string().repeat(40)).unwrap()
    }

    mod review_graph {
        use super::*;

        fn nodes() -> Vec<GraphNode> {
            vec![
                GraphNode {
                    url: "https://x/pull/1".into(),
                    title: "Root change".into(),
                    children: vec![1, 2],
                },
                GraphNode {
                    url: "https://x/pull/2".into(),
                    title: "Middle change".into(),
                    children: vec![],
                },
                GraphNode {
                    url: "https://x/pull/3".into(),
                    title: "Leaf change".into(),
                    children: vec![],
                },
            ]
        }

        #[test]
        fn chain_is_ancestors_first() {
            let chain = render_chain(&nodes(), 0);
            let lines: Vec<&str> = chain.split("\r\n").filter(|l| !l.is_empty()).collect();
            assert_eq!(lines.len(), 3);
            assert!(lines[0].starts_with("└https://x/pull/1"));
            assert!(lines[1].contains("├https://x/pull/2"));
            assert!(lines[2].contains("└https://x/pull/3"));
        }

        #[test]
        fn rendering_is_deterministic() {
            let a = render_chain(&nodes(), 0);
            let b = render_chain(&nodes(), 0);
            assert_eq!(a, b);
        }

        #[test]
        fn own_line_is_bolded() {
            let chain = render_chain(&nodes(), 0);
            let comment = render_review_graph(&chain, "https://x/pull/2", "Middle change");
            assert!(comment.starts_with(REVIEW_GRAPH_HEADER));
            assert!(comment.contains("**https://x/pull/2** **Middle change**"));
            assert!(!comment.contains("**https://x/pull/1**"));
        }
    }

    mod patchsets {
        use super::*;

        fn row(number: u64) -> PatchsetRow {
            PatchsetRow {
                number,
                head: commit_link("octo", "repo", &oid('a')),
                base: commit_link("octo", "repo", &oid('b')),
                diff: compare_link("octo", "repo", &oid('b'), &oid('a')),
                upstream_diff: compare_link("octo", "repo", &oid('c'), &oid('a')),
                date: "2024-05-01T12:00:00Z".into(),
                summary: "2 files changed, 10 insertions(+)".into(),
            }
        }

        #[test]
        fn fresh_comment_starts_at_zero() {
            let text = append_row(None, &row(0));
            assert!(text.starts_with(PATCHSETS_HEADER));
            assert_eq!(next_number(&text), Some(1));
        }

        #[test]
        fn appending_preserves_existing_rows() {
            let first = append_row(None, &row(0));
            let second = append_row(Some(&first), &row(1));
            assert!(second.starts_with(&first));
            assert_eq!(next_number(&second), Some(2));
        }

        #[test]
        fn foreign_comment_is_not_a_table() {
            assert_eq!(next_number("Thanks for the PR!"), None);
        }

        #[test]
        fn rows_round_trip() {
            let text = append_row(Some(&append_row(None, &row(0))), &row(1));
            let rows = parse_rows(&text);
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0], row(0));
            assert_eq!(rows[1], row(1));
        }

        #[test]
        fn links_render_relative_to_forge_root() {
            assert_eq!(
                commit_link("o", "r", &oid('a')),
                format!("[aaaaaaaa](/o/r/commit/{})", "a".repeat(40))
            );
            assert!(compare_link("o", "r", &oid('b'), &oid('a'))
                .starts_with("[diff](/o/r/compare/"));
        }
    }
}
