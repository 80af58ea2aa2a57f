use crate::config::{ShellConfig, PROMPT};
use crate::error::ShellError;
use crate::exec::execute_command;
use crate::parser::{check_token_limit, classify, tokenize};
use crate::signals::ForegroundChild;
use nix::libc::STDIN_FILENO;
use nix::unistd::isatty;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// One read attempt from the user.
pub enum Line {
    Input(String),
    Interrupted,
    Eof,
}

/// Where command lines come from.
pub trait LineSource {
    fn read_line(&mut self) -> Result<Line, ShellError>;

    /// Called once per non-blank line that will be executed.
    fn record(&mut self, _line: &str) {}

    /// Called once when the shell loop ends.
    fn finish(&mut self) {}
}

/// Terminal input through rustyline, with persistent history.
pub struct Interactive {
    editor: DefaultEditor,
    history: Option<PathBuf>,
}

impl Interactive {
    pub fn new(history: Option<PathBuf>) -> Result<Self, ShellError> {
        let mut editor = DefaultEditor::new()?;
        if let Some(path) = history.as_deref().filter(|path| path.exists()) {
            if let Err(err) = editor.load_history(path) {
                warn!(%err, path = %path.display(), "could not load history");
            }
        }
        Ok(Interactive { editor, history })
    }
}

impl LineSource for Interactive {
    fn read_line(&mut self) -> Result<Line, ShellError> {
        match self.editor.readline(PROMPT) {
            Ok(line) => Ok(Line::Input(line)),
            Err(ReadlineError::Interrupted) => Ok(Line::Interrupted),
            Err(ReadlineError::Eof) => Ok(Line::Eof),
            Err(err) => Err(err.into()),
        }
    }

    fn record(&mut self, line: &str) {
        let _ = self.editor.add_history_entry(line);
    }

    fn finish(&mut self) {
        if let Some(path) = &self.history {
            if let Err(err) = self.editor.save_history(path) {
                warn!(%err, path = %path.display(), "could not save history");
            }
        }
    }
}

/// Plain line-by-line reading from any buffered reader, usually stdin.
pub struct Plain<R> {
    input: R,
    emit_prompt: bool,
}

impl<R: BufRead> Plain<R> {
    pub fn new(input: R, emit_prompt: bool) -> Self {
        Plain { input, emit_prompt }
    }
}

impl<R: BufRead> LineSource for Plain<R> {
    fn read_line(&mut self) -> Result<Line, ShellError> {
        if self.emit_prompt {
            let mut stdout = io::stdout();
            stdout.write_all(PROMPT.as_bytes())?;
            stdout.flush()?;
        }
        let mut line = String::new();
        loop {
            match self.input.read_line(&mut line) {
                Ok(0) => return Ok(Line::Eof),
                Ok(_) => return Ok(Line::Input(line)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Picks rustyline when a human is at a terminal, plain stdin otherwise.
pub fn line_source(config: &ShellConfig) -> Result<Box<dyn LineSource>, ShellError> {
    if config.emit_prompt && isatty(STDIN_FILENO).unwrap_or(false) {
        Ok(Box::new(Interactive::new(config.history.clone())?))
    } else {
        Ok(Box::new(Plain::new(io::stdin().lock(), config.emit_prompt)))
    }
}

/// Runs the main shell loop: reads a line, tokenizes it and executes it,
/// until end of input. Only a fatal error ends the loop early.
pub fn run_shell(
    config: &ShellConfig,
    source: &mut dyn LineSource,
    foreground: &ForegroundChild,
) -> Result<(), ShellError> {
    let result = shell_loop(config, source, foreground);
    source.finish();
    result
}

fn shell_loop(
    config: &ShellConfig,
    source: &mut dyn LineSource,
    foreground: &ForegroundChild,
) -> Result<(), ShellError> {
    loop {
        let line = match source.read_line()? {
            Line::Input(line) => line,
            Line::Interrupted => continue,
            Line::Eof => {
                if config.emit_prompt {
                    println!();
                }
                return Ok(());
            }
        };

        let tokens = tokenize(&line);
        if tokens.is_empty() {
            continue;
        }
        source.record(line.trim());
        debug!(?tokens, "received command");

        if let Err(err) = check_token_limit(&tokens, config.max_tokens) {
            eprintln!("mysh: {err}");
            continue;
        }

        match execute_command(classify(&tokens), foreground) {
            Ok(status) => debug!(status, "command finished"),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => eprintln!("mysh: {err}"),
        }
    }
}
