use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::parser::{Direction, StageRole};

/// Failures while resolving or applying a `<` / `>` redirection.
#[derive(Debug, Error)]
pub enum RedirectionError {
    #[error("invalid: no file name for {0} redirect")]
    MissingFile(Direction),
    #[error("invalid: multiple standard {0} redirects")]
    Duplicate(Direction),
    #[error("invalid standard {direction} redirect `{}`: {}", .path.display(), .source.desc())]
    Open {
        direction: Direction,
        path: PathBuf,
        source: Errno,
    },
    #[error("cannot rebind standard {direction}: {}", .source.desc())]
    Rebind { direction: Direction, source: Errno },
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("error in creating child process: {0}")]
    Spawn(#[source] Errno),
    #[error(transparent)]
    Redirection(#[from] RedirectionError),
    #[error("invalid: {direction} redirect {}", placement(.role))]
    RedirectionPlacement { direction: Direction, role: StageRole },
    #[error("{program}: {reason}")]
    Exec { program: String, reason: String },
    #[error("error in child process termination: {0}")]
    Wait(#[source] Errno),
    #[error("too many tokens: {count} (limit {limit})")]
    TooManyTokens { count: usize, limit: usize },
    #[error("missing command {}", placement(.0))]
    MissingCommand(StageRole),
    #[error("cannot create pipe: {0}")]
    Pipe(#[source] Errno),
    #[error("cannot install interrupt handler: {0}")]
    Signal(#[source] io::Error),
    #[error("error reading input: {0}")]
    Readline(#[from] rustyline::error::ReadlineError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShellError {
    /// Builds an `Exec` error from the errno `execvp` returned.
    pub fn exec(program: &str, errno: Errno) -> Self {
        ShellError::Exec {
            program: program.to_string(),
            reason: exec_reason(errno).to_string(),
        }
    }

    /// Whether the shell itself must stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShellError::Wait(_) | ShellError::Readline(_))
    }
}

/// Why `execvp` failed, worded for the user. Static so a forked child can
/// print it without allocating.
pub fn exec_reason(errno: Errno) -> &'static str {
    match errno {
        Errno::ENOENT => "command not found",
        Errno::EACCES => "permission denied",
        other => other.desc(),
    }
}

fn placement(role: &StageRole) -> &'static str {
    match role {
        StageRole::Standalone => "on this line",
        StageRole::Writer => "before pipe",
        StageRole::Reader => "after pipe",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let dup = ShellError::from(RedirectionError::Duplicate(Direction::Output));
        assert_eq!(dup.to_string(), "invalid: multiple standard output redirects");

        let placed = ShellError::RedirectionPlacement {
            direction: Direction::Input,
            role: StageRole::Reader,
        };
        assert_eq!(placed.to_string(), "invalid: input redirect after pipe");

        let missing = ShellError::exec("nosuchprog", Errno::ENOENT);
        assert_eq!(missing.to_string(), "nosuchprog: command not found");
    }

    #[test]
    fn test_only_wait_and_readline_are_fatal() {
        assert!(ShellError::Wait(Errno::EINVAL).is_fatal());
        assert!(!ShellError::Spawn(Errno::EAGAIN).is_fatal());
        assert!(!ShellError::MissingCommand(StageRole::Writer).is_fatal());
    }
}
