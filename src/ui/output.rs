//! ui::output
//!
//! Output formatting and display.
//!
//! # Design
//!
//! Output is formatted consistently and respects the quiet flag. Debug output
//! (subprocess invocations, GraphQL traffic) is only shown with `--verbose`.
//! Secrets registered via [`redact`] are masked in every message.

use std::fmt::Display;
use std::sync::{Mutex, OnceLock};

/// Output verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Quiet mode - minimal output
    Quiet,
    /// Normal mode - standard output
    Normal,
    /// Verbose mode - every subprocess and API call
    Verbose,
}

impl Verbosity {
    /// Create verbosity from flags.
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        if verbose {
            Verbosity::Verbose
        } else if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }
}

fn redactions() -> &'static Mutex<Vec<(String, String)>> {
    static REDACTIONS: OnceLock<Mutex<Vec<(String, String)>>> = OnceLock::new();
    REDACTIONS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a secret to be masked in all subsequent output.
pub fn redact(secret: impl Into<String>, replacement: impl Into<String>) {
    let secret = secret.into();
    if secret.is_empty() {
        return;
    }
    redactions()
        .lock()
        .expect("redaction lock")
        .push((secret, replacement.into()));
}

fn apply_redactions(message: String) -> String {
    let guard = redactions().lock().expect("redaction lock");
    let mut message = message;
    for (secret, replacement) in guard.iter() {
        message = message.replace(secret, replacement);
    }
    message
}

/// Print a message (respects quiet mode).
pub fn print(message: impl Display, verbosity: Verbosity) {
    if verbosity != Verbosity::Quiet {
        println!("{}", apply_redactions(message.to_string()));
    }
}

/// Print a debug message (only in verbose mode).
pub fn debug(message: impl Display, verbosity: Verbosity) {
    if verbosity == Verbosity::Verbose {
        eprintln!("[debug] {}", apply_redactions(message.to_string()));
    }
}

/// Print an error message (always shown).
pub fn error(message: impl Display) {
    eprintln!("error: {}", apply_redactions(message.to_string()));
}

/// Print a warning message (respects quiet mode).
pub fn warn(message: impl Display, verbosity: Verbosity) {
    if verbosity != Verbosity::Quiet {
        eprintln!("warning: {}", apply_redactions(message.to_string()));
    }
}

/// Quote a command line for logging, the way a shell would want it back.
pub fn quote_command<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || "'\"\\$".contains(c)) {
                format!("'{}'", arg.replace('\'', "'\\''"))
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
