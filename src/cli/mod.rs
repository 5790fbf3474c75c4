//! cli
//!
//! Command-line interface layer.
//!
//! # Responsibilities
//!
//! - Parse arguments and merge them with the layered config
//! - Open the repository and construct the forge client
//! - Dispatch to the upload pipeline or the toolkit commands
//!
//! The CLI layer is thin: all upload logic lives in [`crate::upload`] and
//! [`crate::topics`].

pub mod args;

use anyhow::{bail, Context, Result};
use clap::CommandFactory;

use crate::core::config::{Config, CONFIG_PATH_ENV, GLOBAL_SECTION};
use crate::forge::github::GitHubForge;
use crate::git::{Git, GitOptions, RepoHandle, Shell};
use crate::topics::TopicStack;
use crate::ui::output::{self, Verbosity};
use crate::upload::UploadOptions;
use args::{Cli, Command, ToolkitCommand, UploadArgs};

/// Run the CLI application. Returns the process exit code.
pub async fn run() -> Result<u8> {
    let cli = <Cli as clap::Parser>::parse();
    let verbosity = Verbosity::from_flags(false, cli.verbose);

    if let Command::Completion { shell } = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
        return Ok(0);
    }

    let repo_root = discover_repo_root().await;
    let config = Config::load(repo_root.as_deref()).with_context(|| {
        format!(
            "loading configuration (set {} to use a different user file)",
            CONFIG_PATH_ENV
        )
    })?;
    let settings = Settings::resolve(&cli, &config)?;

    let shell = Shell::new(std::env::current_dir()?, verbosity);
    let git = Git::open(
        shell,
        GitOptions {
            git_path: settings.git_path.clone(),
            // All pushes and fetches go to the fork when one is configured.
            remote_name: settings.push_remote().to_string(),
            main_branch: settings.main_branch.clone(),
            base_branch_globs: settings.base_branch_globs.clone(),
            keep_temp: cli.keep_temp,
        },
    )
    .await?;

    match cli.command {
        Command::Upload(upload_args) => {
            run_upload(&git, &settings, &config, upload_args, verbosity).await
        }
        Command::Toolkit { command } => run_toolkit(&git, command, verbosity).await,
        Command::Completion { .. } => unreachable!("handled above"),
    }
}

/// Global settings merged from flags and config.
#[derive(Debug)]
struct Settings {
    github_url: String,
    remote_name: String,
    fork_name: Option<String>,
    github_oauth: Option<String>,
    proxy: Option<String>,
    git_path: Option<String>,
    main_branch: String,
    base_branch_globs: Vec<String>,
}

impl Settings {
    fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let get = |flag: &Option<String>, key: &str| -> Option<String> {
            flag.clone()
                .or_else(|| config.get(GLOBAL_SECTION, key).map(str::to_string))
        };

        let github_oauth = get(&cli.github_oauth, "github_oauth")
            .or_else(|| std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()));
        if let Some(token) = &github_oauth {
            // So users don't leak the token when sharing logs.
            output::redact(token.clone(), "<GITHUB_OAUTH>");
        }

        let globs = get(&cli.base_branch_globs, "base_branch_globs")
            .unwrap_or_default()
            .split([',', '\n'])
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            github_url: get(&cli.github_url, "github_url").unwrap_or_else(|| "github.com".into()),
            remote_name: get(&cli.remote_name, "remote_name").unwrap_or_else(|| "origin".into()),
            fork_name: get(&cli.fork_name, "fork_name").filter(|f| !f.is_empty()),
            github_oauth,
            proxy: get(&cli.proxy, "proxy"),
            git_path: get(&cli.git_path, "git_path"),
            main_branch: get(&cli.main_branch, "main_branch").unwrap_or_else(|| "main".into()),
            base_branch_globs: globs,
        })
    }

    /// The remote heads are pushed to: the fork when set, else the remote.
    fn push_remote(&self) -> &str {
        self.fork_name.as_deref().unwrap_or(&self.remote_name)
    }
}

async fn run_upload(
    git: &Git,
    settings: &Settings,
    config: &Config,
    args: UploadArgs,
    verbosity: Verbosity,
) -> Result<u8> {
    let repo = repo_handle_or_fail(git, settings, &settings.remote_name).await?;
    let fork = match &settings.fork_name {
        Some(fork_name) if *fork_name != settings.remote_name => {
            let fork = repo_handle_or_fail(git, settings, fork_name).await?;
            if fork.name != repo.name {
                bail!(
                    "configured fork remote '{}' is not the same repo as remote '{}'",
                    fork_name,
                    settings.remote_name
                );
            }
            fork
        }
        _ => repo.clone(),
    };

    let Some(token) = settings.github_oauth.clone() else {
        bail!(
            "No GitHub OAuth token found! Set the GITHUB_TOKEN environment variable, \
             or make one at https://github.com/settings/tokens/new (revup needs full \
             repo permissions) and put it under [revup] github_oauth in ~/.revupconfig"
        );
    };
    let forge = GitHubForge::new(
        token,
        &settings.github_url,
        settings.proxy.as_deref(),
        repo.clone(),
        fork.clone(),
        verbosity,
    )?;

    let opts = upload_options(args, config)?;
    crate::upload::run(git, &forge, &repo, &fork, &opts, verbosity).await
}

/// Merge upload flags with the `[upload]` config section.
fn upload_options(args: UploadArgs, config: &Config) -> Result<UploadOptions> {
    let section = "upload";
    let defaults = UploadOptions::default();

    let update_pr_body_flag = args.update_pr_body();
    let review_graph_flag = args.review_graph();
    let patchsets_flag = args.patchsets();
    let self_authored_flag = args.self_authored_only();

    let flag = |on: bool, key: &str| -> Result<bool> {
        Ok(on || config.get_bool(section, key)?.unwrap_or(false))
    };
    let paired = |given: Option<bool>, key: &str, default: bool| -> Result<bool> {
        Ok(match given {
            Some(value) => value,
            None => config.get_bool(section, key)?.unwrap_or(default),
        })
    };
    let string = |given: Option<String>, key: &str| -> Option<String> {
        given.or_else(|| config.get(section, key).map(str::to_string))
    };

    let auto_add_users = match string(None, "auto_add_users") {
        Some(value) if args.auto_add_users.is_none() => {
            value.parse().map_err(|e: String| anyhow::anyhow!(e))?
        }
        _ => args.auto_add_users.unwrap_or(defaults.auto_add_users),
    };
    let branch_format = match string(None, "branch_format") {
        Some(value) if args.branch_format.is_none() => value.parse()?,
        _ => args.branch_format.unwrap_or(defaults.branch_format),
    };

    let labels = string(args.labels, "labels")
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let user_aliases = string(args.user_aliases, "user_aliases")
        .map(parse_user_aliases)
        .transpose()?
        .unwrap_or_default();

    Ok(UploadOptions {
        base_branch: string(args.base_branch, "base_branch"),
        relative_branch: string(args.relative_branch, "relative_branch"),
        rebase: flag(args.rebase, "rebase")?,
        relative_chain: flag(args.relative_chain, "relative_chain")?,
        auto_topic: flag(args.auto_topic, "auto_topic")?,
        skip_confirm: flag(args.skip_confirm, "skip_confirm")?,
        dry_run: args.dry_run,
        push_only: flag(args.push_only, "push_only")?,
        status: args.status,
        update_pr_body: paired(update_pr_body_flag, "update_pr_body", true)?,
        review_graph: paired(review_graph_flag, "review_graph", true)?,
        patchsets: paired(patchsets_flag, "patchsets", true)?,
        self_authored_only: paired(self_authored_flag, "self_authored_only", true)?,
        trim_tags: flag(args.trim_tags, "trim_tags")?,
        create_local_branches: flag(args.create_local_branches, "create_local_branches")?,
        auto_add_users,
        labels,
        user_aliases,
        uploader: string(args.uploader, "uploader"),
        branch_format,
        head: args.head.unwrap_or(defaults.head),
        pre_upload: string(args.pre_upload, "pre_upload"),
        topics: args.topics,
    })
}

fn parse_user_aliases(csv: String) -> Result<Vec<(String, String)>> {
    csv.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|mapping| match mapping.split_once(':') {
            Some((alias, target)) if !alias.is_empty() && !target.is_empty() => {
                Ok((alias.to_string(), target.to_string()))
            }
            _ => bail!("invalid user alias '{}' (expected old:new)", mapping),
        })
        .collect()
}

async fn repo_handle_or_fail(
    git: &Git,
    settings: &Settings,
    remote: &str,
) -> Result<RepoHandle> {
    match git.repo_handle(&settings.github_url, remote).await? {
        Some(handle) => Ok(handle),
        None => bail!(
            "configured remote '{remote}' does not point to a {host} repository; \
             set it with `git remote set-url {remote} git@{host}:OWNER/PROJECT`",
            remote = remote,
            host = settings.github_url,
        ),
    }
}

async fn run_toolkit(git: &Git, command: ToolkitCommand, verbosity: Verbosity) -> Result<u8> {
    match command {
        ToolkitCommand::DetectBranch { show_all } => {
            if show_all {
                for candidate in git.best_base_branch_candidates("HEAD").await? {
                    output::print(candidate, verbosity);
                }
            } else {
                output::print(git.best_base_branch("HEAD").await?, verbosity);
            }
        }
        ToolkitCommand::CherryPick { commit, parent } => {
            let header = git.commit_header(&commit).await?;
            let parent = git.resolve_commit(&parent).await?;
            let new_commit = git
                .cherry_pick_commit(&header, &parent, &header.message)
                .await?;
            output::print(new_commit, verbosity);
        }
        ToolkitCommand::ForkPoint { branches } => {
            let point = git.fork_point(&branches[0], &branches[1]).await?;
            output::print(point, verbosity);
        }
        ToolkitCommand::ListTopics {
            base_branch,
            relative_branch,
        } => {
            let mut stack = TopicStack::new(
                git,
                verbosity,
                "HEAD".to_string(),
                base_branch,
                relative_branch,
                Default::default(),
            );
            stack.populate_topics(false, false, &[]).await?;
            for topic in &stack.topics {
                output::print(&topic.name, verbosity);
                for commit in &topic.commits {
                    output::print(format!("  {}", commit.subject()), verbosity);
                }
            }
        }
    }
    Ok(0)
}

/// Best-effort repo root discovery for config loading, before the real
/// `Git` context exists.
async fn discover_repo_root() -> Option<std::path::PathBuf> {
    let shell = Shell::new(std::env::current_dir().ok()?, Verbosity::Quiet);
    let out = shell
        .run("git", &["rev-parse", "--show-toplevel"])
        .await
        .ok()?;
    if out.success() {
        Some(std::path::PathBuf::from(out.stdout.trim()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_alias_parsing() {
        let aliases = parse_user_aliases("al:alice, bo:bob".to_string()).unwrap();
        assert_eq!(
            aliases,
            vec![
                ("al".to_string(), "alice".to_string()),
                ("bo".to_string(), "bob".to_string())
            ]
        );
        assert!(parse_user_aliases("justaname".to_string()).is_err());
    }

    #[test]
    fn upload_options_from_config() {
        let config = Config::default();
        let opts = upload_options(UploadArgs::default(), &config).unwrap();
        assert!(opts.update_pr_body);
        assert!(opts.patchsets);
        assert!(opts.self_authored_only);
        assert!(!opts.rebase);
        assert_eq!(opts.head, "HEAD");
    }
}
