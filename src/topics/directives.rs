//! topics::directives
//!
//! Commit-message directive parsing.
//!
//! # Grammar
//!
//! Directives are lines of the form `Name: value1, value2, …` anywhere in a
//! commit message body. Names are case-insensitive; multi-valued names also
//! accept a trailing `s` (and looser plural spellings like `Branches`).
//! Values are comma-separated and whitespace-trimmed.
//!
//! Unknown `Name:` lines are left in the message untouched and surfaced as
//! warnings. Recognized lines are removed from the trimmed message, which is
//! what `--trim-tags` pushes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from directive parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("directive '{0}' has an empty value")]
    EmptyValue(String),

    #[error("directive '{0}' may only be given once with a single value")]
    DuplicateSingle(String),

    #[error("invalid branch format '{0}' (expected user+branch, user, branch, or none)")]
    InvalidBranchFormat(String),

    #[error("invalid value '{0}' for update-pr-body (expected true or false)")]
    InvalidBool(String),
}

/// The recognized directive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DirectiveKind {
    Topic,
    Relative,
    Branches,
    Reviewers,
    Assignees,
    Labels,
    Uploader,
    BranchFormat,
    RelativeBranch,
    UpdatePrBody,
}

impl DirectiveKind {
    /// Match a (lowercased) tag name, accepting plural spellings for the
    /// multi-valued directives.
    fn parse(name: &str) -> Option<Self> {
        match name {
            "topic" => return Some(Self::Topic),
            "relative" => return Some(Self::Relative),
            "uploader" => return Some(Self::Uploader),
            "branch-format" => return Some(Self::BranchFormat),
            "relative-branch" => return Some(Self::RelativeBranch),
            "update-pr-body" => return Some(Self::UpdatePrBody),
            _ => {}
        }
        // Plurals don't even have to be grammatically correct.
        let singular = name
            .strip_suffix("ees")
            .map(|s| format!("{}ee", s))
            .or_else(|| name.strip_suffix("es").map(str::to_string))
            .or_else(|| name.strip_suffix('s').map(str::to_string))
            .unwrap_or_else(|| name.to_string());
        match singular.as_str() {
            "branch" => Some(Self::Branches),
            "reviewer" => Some(Self::Reviewers),
            "assignee" => Some(Self::Assignees),
            "label" => Some(Self::Labels),
            _ => None,
        }
    }

    /// Whether repeated occurrences union (true) or error (false).
    pub fn is_multi_valued(self) -> bool {
        matches!(
            self,
            Self::Branches | Self::Reviewers | Self::Assignees | Self::Labels
        )
    }

    /// Canonical (lowercase, singular) name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Relative => "relative",
            Self::Branches => "branch",
            Self::Reviewers => "reviewer",
            Self::Assignees => "assignee",
            Self::Labels => "label",
            Self::Uploader => "uploader",
            Self::BranchFormat => "branch-format",
            Self::RelativeBranch => "relative-branch",
            Self::UpdatePrBody => "update-pr-body",
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Remote branch naming scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchFormat {
    /// `revup/<uploader>/<base>/<topic>`
    #[default]
    UserAndBranch,
    /// `revup/<uploader>/<topic>`
    User,
    /// `revup/<base>/<topic>`
    Branch,
    /// `revup/<topic>`
    Bare,
}

impl BranchFormat {
    /// Compute the remote branch name for a (topic, base) pair.
    pub fn remote_branch(self, uploader: &str, base: &str, topic: &str) -> String {
        match self {
            BranchFormat::UserAndBranch => format!("revup/{}/{}/{}", uploader, base, topic),
            BranchFormat::User => format!("revup/{}/{}", uploader, topic),
            BranchFormat::Branch => format!("revup/{}/{}", base, topic),
            BranchFormat::Bare => format!("revup/{}", topic),
        }
    }
}

impl FromStr for BranchFormat {
    type Err = DirectiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user+branch" => Ok(Self::UserAndBranch),
            "user" => Ok(Self::User),
            "branch" => Ok(Self::Branch),
            "none" => Ok(Self::Bare),
            other => Err(DirectiveError::InvalidBranchFormat(other.to_string())),
        }
    }
}

impl fmt::Display for BranchFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserAndBranch => "user+branch",
            Self::User => "user",
            Self::Branch => "branch",
            Self::Bare => "none",
        };
        write!(f, "{}", s)
    }
}

/// All directives extracted from one commit message.
///
/// Multi-valued directives keep first-appearance order and deduplicate.
/// Single-valued directives hold exactly one value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub topic: Option<String>,
    pub relative: Option<String>,
    pub branches: Vec<String>,
    pub reviewers: Vec<String>,
    pub assignees: Vec<String>,
    pub labels: Vec<String>,
    pub uploader: Option<String>,
    pub branch_format: Option<BranchFormat>,
    pub relative_branch: Option<String>,
    pub update_pr_body: Option<bool>,
}

impl Directives {
    fn multi_slot(&mut self, kind: DirectiveKind) -> &mut Vec<String> {
        match kind {
            DirectiveKind::Branches => &mut self.branches,
            DirectiveKind::Reviewers => &mut self.reviewers,
            DirectiveKind::Assignees => &mut self.assignees,
            DirectiveKind::Labels => &mut self.labels,
            _ => unreachable!("not a multi-valued directive"),
        }
    }

    fn set_single(&mut self, kind: DirectiveKind, value: String) -> Result<(), DirectiveError> {
        let slot = match kind {
            DirectiveKind::Topic => &mut self.topic,
            DirectiveKind::Relative => &mut self.relative,
            DirectiveKind::Uploader => &mut self.uploader,
            DirectiveKind::RelativeBranch => &mut self.relative_branch,
            DirectiveKind::BranchFormat => {
                let parsed = value.parse()?;
                return replace_none(&mut self.branch_format, parsed, kind);
            }
            DirectiveKind::UpdatePrBody => {
                let parsed = match value.as_str() {
                    "true" => true,
                    "false" => false,
                    other => return Err(DirectiveError::InvalidBool(other.to_string())),
                };
                return replace_none(&mut self.update_pr_body, parsed, kind);
            }
            _ => unreachable!("not a single-valued directive"),
        };
        replace_none(slot, value, kind)
    }
}

fn replace_none<T>(
    slot: &mut Option<T>,
    value: T,
    kind: DirectiveKind,
) -> Result<(), DirectiveError> {
    if slot.is_some() {
        return Err(DirectiveError::DuplicateSingle(kind.name().to_string()));
    }
    *slot = Some(value);
    Ok(())
}

/// Result of parsing one commit message.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub directives: Directives,
    /// The message with recognized directive lines removed.
    pub trimmed: String,
    /// Unrecognized `Name:` lines, reported but preserved.
    pub unknown: Vec<String>,
}

/// Whether a line has the `Name: values` shape.
fn split_directive_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
        return None;
    }
    Some((name, value))
}

/// Parse every directive in a commit message.
///
/// # Errors
///
/// - `EmptyValue` for a recognized directive with nothing on the right
/// - `DuplicateSingle` when a single-valued directive appears twice or
///   carries more than one value
pub fn parse_message(message: &str) -> Result<ParsedMessage, DirectiveError> {
    let mut directives = Directives::default();
    let mut kept_lines = Vec::new();
    let mut unknown = Vec::new();
    // The subject line is never a directive, even when it looks like one.
    let mut lines = message.lines();

    if let Some(subject) = lines.next() {
        kept_lines.push(subject);
    }
    for line in lines {
        let Some((raw_name, raw_value)) = split_directive_line(line) else {
            kept_lines.push(line);
            continue;
        };
        let name = raw_name.trim().to_ascii_lowercase();
        let Some(kind) = DirectiveKind::parse(&name) else {
            unknown.push(name);
            kept_lines.push(line);
            continue;
        };

        let values: Vec<String> = raw_value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if values.is_empty() {
            return Err(DirectiveError::EmptyValue(kind.name().to_string()));
        }

        if kind.is_multi_valued() {
            let slot = directives.multi_slot(kind);
            for value in values {
                if !slot.contains(&value) {
                    slot.push(value);
                }
            }
        } else {
            if values.len() > 1 {
                return Err(DirectiveError::DuplicateSingle(kind.name().to_string()));
            }
            directives.set_single(kind, values.into_iter().next().expect("one value"))?;
        }
    }

    Ok(ParsedMessage {
        directives,
        trimmed: kept_lines.join("\n").trim().to_string(),
        unknown,
    })
}

/// Synthesize a topic name from a commit subject for `--auto-topic`:
/// the first five words joined by `_`, with branch-hostile characters
/// removed.
pub fn auto_topic_name(trimmed_message: &str) -> String {
    trimmed_message
        .split_whitespace()
        .take(5)
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| !matches!(c, ':' | '[' | ']' | '~' | '^' | '?' | '*' | '\\'))
        .collect()
}

/// Extract a label from a conventional subject prefix: `name: rest` or
/// `[name] rest` contributes `name` (lowercased).
pub fn subject_prefix_label(subject: &str) -> Option<String> {
    let is_label_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';

    if let Some(rest) = subject.strip_prefix('[') {
        let end = rest.find(']')?;
        let label = &rest[..end];
        if !label.is_empty() && label.chars().all(is_label_char) {
            return Some(label.to_ascii_lowercase());
        }
        return None;
    }
    let (prefix, _) = subject.split_once(':')?;
    if !prefix.is_empty() && prefix.chars().all(is_label_char) {
        Some(prefix.to_ascii_lowercase())
    } else {
        None
    }
}

/// Union a set of user aliases (`old:new`) into reviewer/assignee lists.
pub fn apply_user_aliases(names: &mut Vec<String>, aliases: &[(String, String)]) {
    for (alias, target) in aliases {
        if let Some(pos) = names.iter().position(|n| n == alias) {
            names.remove(pos);
            if !names.contains(target) {
                names.push(target.clone());
            }
        }
    }
}

/// Deduplicating union preserving the order of `extra` after `names`.
pub fn union_into(names: &mut Vec<String>, extra: &[String]) {
    for value in extra {
        if !names.contains(value) {
            names.push(value.clone());
        }
    }
}

/// Sorted de-duplicated view, for places that need set semantics.
pub fn as_set(names: &[String]) -> BTreeSet<&str> {
    names.iter().map(String::as_str).collect()
}
