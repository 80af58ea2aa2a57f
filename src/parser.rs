use crate::error::{RedirectionError, ShellError};
use std::fmt;
use std::path::PathBuf;

/// Default upper bound on tokens accepted from one line.
pub const MAX_TOKENS: usize = 100;

const PIPE: char = '|';
const INPUT: char = '<';
const OUTPUT: char = '>';

/// Which standard stream a redirection rebinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a token sequence relative to the pipe boundary.
///
/// The writer stage may only redirect its input, the reader stage may only
/// redirect its output. A standalone command may do both, once each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Standalone,
    Writer,
    Reader,
}

impl StageRole {
    fn allows(self, direction: Direction) -> bool {
        !matches!(
            (self, direction),
            (StageRole::Writer, Direction::Output) | (StageRole::Reader, Direction::Input)
        )
    }
}

/// A tokenized command line, classified by the number of pipe boundaries.
///
/// Stages borrow from the caller's tokens; nothing is copied.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandLine<'a> {
    Simple(&'a [String]),
    Pipeline {
        writer: &'a [String],
        reader: &'a [String],
    },
}

/// Everything a child needs to replace its image: the argument vector plus
/// the files to bind onto stdin/stdout first.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StagePlan {
    pub argv: Vec<String>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl StagePlan {
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Splits a raw line into word tokens. `<`, `>` and `|` always stand alone.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.trim().chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if is_special(ch) {
            tokens.push(ch.to_string());
            chars.next();
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || is_special(c) {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    tokens
}

fn is_special(ch: char) -> bool {
    ch == INPUT || ch == OUTPUT || ch == PIPE
}

/// Rejects lines longer than `limit` tokens.
pub fn check_token_limit(tokens: &[String], limit: usize) -> Result<(), ShellError> {
    if tokens.len() > limit {
        return Err(ShellError::TooManyTokens {
            count: tokens.len(),
            limit,
        });
    }
    Ok(())
}

/// Returns the index of the first token carrying a pipe marker.
pub fn find_pipe(tokens: &[String]) -> Option<usize> {
    tokens.iter().position(|token| token.contains(PIPE))
}

/// Partitions `tokens` around the pipe-bearing token at `at`, which lands in
/// neither half.
pub fn split_pipeline(tokens: &[String], at: usize) -> (&[String], &[String]) {
    (&tokens[..at], &tokens[at + 1..])
}

pub fn classify(tokens: &[String]) -> CommandLine<'_> {
    match find_pipe(tokens) {
        Some(at) => {
            let (writer, reader) = split_pipeline(tokens, at);
            CommandLine::Pipeline { writer, reader }
        }
        None => CommandLine::Simple(tokens),
    }
}

fn redirection_of(token: &str) -> Option<Direction> {
    if token.starts_with(INPUT) {
        Some(Direction::Input)
    } else if token.starts_with(OUTPUT) {
        Some(Direction::Output)
    } else {
        None
    }
}

/// Walks one stage's tokens, routing each redirection marker and its
/// filename into the plan and copying every other token into `argv` in
/// order. Nothing is opened here.
pub fn build_stage(tokens: &[String], role: StageRole) -> Result<StagePlan, ShellError> {
    let mut plan = StagePlan::default();
    let mut iter = tokens.iter();

    while let Some(token) = iter.next() {
        let Some(direction) = redirection_of(token) else {
            plan.argv.push(token.clone());
            continue;
        };
        if !role.allows(direction) {
            return Err(ShellError::RedirectionPlacement { direction, role });
        }
        let slot = match direction {
            Direction::Input => &mut plan.input,
            Direction::Output => &mut plan.output,
        };
        if slot.is_some() {
            return Err(RedirectionError::Duplicate(direction).into());
        }
        // Another marker is never a filename: `>>` arrives as `>`, `>`.
        let file = iter
            .next()
            .filter(|file| redirection_of(file).is_none() && !file.contains(PIPE))
            .ok_or(RedirectionError::MissingFile(direction))?;
        *slot = Some(PathBuf::from(file));
    }

    if plan.argv.is_empty() {
        return Err(ShellError::MissingCommand(role));
    }
    Ok(plan)
}
