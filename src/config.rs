use crate::parser::MAX_TOKENS;
use std::path::PathBuf;
use std::process;

/// Prompt printed before each line.
pub const PROMPT: &str = "my-shell> ";

const HISTORY_FILE: &str = ".mysh_history";

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "MYSH_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub emit_prompt: bool,
    pub verbose: bool,
    pub max_tokens: usize,
    pub history: Option<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            emit_prompt: true,
            verbose: false,
            max_tokens: MAX_TOKENS,
            history: dirs_next::home_dir().map(|home| home.join(HISTORY_FILE)),
        }
    }
}

/// What the command line asked for.
#[derive(Debug, PartialEq, Eq)]
pub enum Invocation {
    Run(ShellConfig),
    Help,
}

/// Parses the shell's own flags (without the program name).
pub fn parse_args<I, S>(args: I) -> Result<Invocation, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut config = ShellConfig::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_ref() {
            "-h" => return Ok(Invocation::Help),
            "-v" => config.verbose = true,
            "-p" => config.emit_prompt = false,
            "-t" => {
                let value = args.next().ok_or("-t requires a token count")?;
                config.max_tokens = match value.as_ref().parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("invalid token count `{}`", value.as_ref())),
                };
            }
            other => return Err(format!("unknown option `{other}`")),
        }
    }
    Ok(Invocation::Run(config))
}

pub fn print_usage() -> ! {
    println!("Usage: mysh [-hvp] [-t <n>]");
    println!("   -h       Print this help message");
    println!("   -v       Enable verbose mode");
    println!("   -p       Do not print a command prompt");
    println!("   -t <n>   Accept at most <n> tokens per line (default {MAX_TOKENS})");
    println!("Set {LOG_ENV} to override the log filter.");
    process::exit(1);
}
