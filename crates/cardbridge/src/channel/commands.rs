use std::path::{Path, PathBuf};

use crate::error::Error;

pub const HELP_TEXT: &str = "\
Send any message to run it as a task in the current workspace.

/cd <path>  switch workspace (starts a fresh agent session)
/reset      forget the agent session, keep the workspace
/stop       cancel the running task
/status     show workspace, session and task state
/help       show this message";

/// A slash command from the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Cd(String),
    Reset,
    Stop,
    Status,
    Unknown(String),
}

impl Command {
    /// Parse `text` as a command. Returns `None` for ordinary messages.
    ///
    /// The command word is matched case-insensitively; the argument keeps
    /// its case.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let (word, rest) = match text.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (text, ""),
        };
        let command = match word.to_lowercase().as_str() {
            "/help" => Command::Help,
            "/cd" => Command::Cd(rest.to_string()),
            "/reset" => Command::Reset,
            "/stop" => Command::Stop,
            "/status" => Command::Status,
            _ => Command::Unknown(word.to_string()),
        };
        Some(command)
    }
}

/// Resolve a `/cd` argument to an existing directory.
///
/// `~` expands to `$HOME`; relative paths are taken against `current`.
pub async fn resolve_workspace(arg: &str, current: Option<&Path>) -> Result<PathBuf, Error> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err(Error::Validation("usage: /cd <path>".into()));
    }

    let expanded = if arg == "~" || arg.starts_with("~/") {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| Error::Validation("cannot expand ~: HOME is not set".into()))?;
        let mut path = PathBuf::from(home);
        if let Some(rest) = arg.strip_prefix("~/") {
            path.push(rest);
        }
        path
    } else {
        PathBuf::from(arg)
    };

    let candidate = if expanded.is_absolute() {
        expanded
    } else {
        match current {
            Some(base) => base.join(expanded),
            None => {
                return Err(Error::Validation(format!(
                    "relative path '{arg}' needs a workspace; use an absolute path"
                )));
            }
        }
    };

    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| Error::Validation(format!("no such directory: {}", candidate.display())))?;
    let is_dir = tokio::fs::metadata(&resolved)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(Error::Validation(format!(
            "not a directory: {}",
            resolved.display()
        )));
    }
    Ok(resolved)
}
