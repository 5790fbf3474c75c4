//! core::config
//!
//! Layered ini configuration.
//!
//! # Precedence
//!
//! Values are resolved in this order (later overrides earlier):
//! 1. Built-in defaults (owned by the CLI layer)
//! 2. Repo file `<repo-root>/.revupconfig`
//! 3. User file (`$REVUP_CONFIG_PATH` or `~/.revupconfig`)
//! 4. Command-line flags (not handled here)
//!
//! # File Format
//!
//! Standard ini. Section names are command names, with `[revup]` holding
//! global options. Keys use `_` on disk where the command line uses `-`:
//! `revup upload --skip-confirm` is `[upload] skip_confirm = true`.
//!
//! # Security
//!
//! The user file can hold an OAuth token, so it must be owned by the current
//! user with mode `0600`. Loading fails otherwise with a remediation hint.

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

/// Environment variable overriding the user config path.
pub const CONFIG_PATH_ENV: &str = "REVUP_CONFIG_PATH";

/// Config file name, both in the repo root and in `$HOME`.
pub const CONFIG_FILE_NAME: &str = ".revupconfig";

/// Section holding global (command-independent) options.
pub const GLOBAL_SECTION: &str = "revup";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("config file '{path}' is not owned by the current user")]
    NotOwned { path: PathBuf },

    #[error("permissions too loose on config file '{path}'; try `chmod 0600 {path}`", path = .path.display())]
    InsecurePermissions { path: PathBuf },

    #[error("invalid value '{value}' for {section}.{key}: expected true or false")]
    InvalidBool {
        section: String,
        key: String,
        value: String,
    },
}

/// Merged configuration from the repo and user files.
///
/// Accessors apply precedence automatically: the user file overrides the
/// repo file, and absent files contribute nothing.
#[derive(Debug, Default)]
pub struct Config {
    repo: Option<Ini>,
    user: Option<Ini>,
}

impl Config {
    /// Load configuration for a repository.
    ///
    /// Missing files are fine; malformed or insecure files are errors.
    pub fn load(repo_root: Option<&Path>) -> Result<Self, ConfigError> {
        let repo = match repo_root {
            Some(root) => load_ini(&root.join(CONFIG_FILE_NAME), false)?,
            None => None,
        };
        let user = match user_config_path() {
            Some(path) => load_ini(&path, true)?,
            None => None,
        };
        Ok(Self { repo, user })
    }

    /// Look up a string value, user file first.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        for source in [&self.user, &self.repo] {
            if let Some(value) = source
                .as_ref()
                .and_then(|ini| ini.section(Some(section)))
                .and_then(|props| props.get(key))
            {
                return Some(value);
            }
        }
        None
    }

    /// Look up a boolean value (`true`/`false`).
    pub fn get_bool(&self, section: &str, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(section, key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(ConfigError::InvalidBool {
                section: section.to_string(),
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    #[cfg(test)]
    fn from_strings(repo: Option<&str>, user: Option<&str>) -> Self {
        let parse = |s: &str| Ini::load_from_str(s).expect("test ini");
        Self {
            repo: repo.map(parse),
            user: user.map(parse),
        }
    }
}

/// Resolve the user config path: `$REVUP_CONFIG_PATH`, else `~/.revupconfig`.
fn user_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| Path::new(&home).join(CONFIG_FILE_NAME))
}

fn load_ini(path: &Path, check_permissions: bool) -> Result<Option<Ini>, ConfigError> {
    if !path.is_file() {
        return Ok(None);
    }
    if check_permissions {
        verify_permissions(path)?;
    }
    Ini::load_from_file(path)
        .map(Some)
        .map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

#[cfg(unix)]
fn verify_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    // Safety: geteuid never fails.
    let euid = unsafe { libc_geteuid() };
    if meta.uid() != euid {
        return Err(ConfigError::NotOwned {
            path: path.to_path_buf(),
        });
    }
    if meta.mode() & 0o177 != 0 {
        return Err(ConfigError::InsecurePermissions {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn verify_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
unsafe fn libc_geteuid() -> u32 {
    extern "C" {
        fn geteuid() -> u32;
    }
    geteuid()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_files_yield_nothing() {
        let config = Config::default();
        assert_eq!(config.get("upload", "skip_confirm"), None);
    }

    #[test]
    fn user_overrides_repo() {
        let config = Config::from_strings(
            Some("[revup]\nmain_branch = master\nremote_name = origin\n"),
            Some("[revup]\nmain_branch = main\n"),
        );
        assert_eq!(config.get(GLOBAL_SECTION, "main_branch"), Some("main"));
        assert_eq!(config.get(GLOBAL_SECTION, "remote_name"), Some("origin"));
    }

    #[test]
    fn bool_parsing() {
        let config = Config::from_strings(
            Some("[upload]\nskip_confirm = true\nrebase = maybe\n"),
            None,
        );
        assert_eq!(config.get_bool("upload", "skip_confirm").unwrap(), Some(true));
        assert_eq!(config.get_bool("upload", "dry_run").unwrap(), None);
        assert!(config.get_bool("upload", "rebase").is_err());
    }

    #[cfg(unix)]
    mod permissions {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        #[test]
        fn rejects_world_readable_user_file() {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join(CONFIG_FILE_NAME);
            std::fs::write(&path, "[revup]\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
            assert!(matches!(
                load_ini(&path, true),
                Err(ConfigError::InsecurePermissions { .. })
            ));
        }

        #[test]
        fn accepts_0600_user_file() {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join(CONFIG_FILE_NAME);
            std::fs::write(&path, "[upload]\nrebase = true\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
            assert!(load_ini(&path, true).unwrap().is_some());
        }
    }
}
