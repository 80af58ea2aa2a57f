mod config;
mod error;
mod exec;
mod parser;
mod redirect;
mod shell;
mod signals;

use config::{Invocation, ShellConfig, LOG_ENV};
use std::env;
use std::io;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse command-line arguments.
    let config = match config::parse_args(env::args().skip(1)) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help) => config::print_usage(),
        Err(msg) => {
            eprintln!("mysh: {msg}");
            config::print_usage();
        }
    };
    init_logging(&config);

    // Install the Ctrl-C bridge before any child can exist.
    let foreground = signals::ForegroundChild::new();
    if let Err(err) = signals::install_interrupt_bridge(&foreground) {
        eprintln!("mysh: {err}");
        process::exit(1);
    }

    let result = shell::line_source(&config)
        .and_then(|mut source| shell::run_shell(&config, source.as_mut(), &foreground));
    if let Err(err) = result {
        eprintln!("mysh: {err}");
        process::exit(1);
    }
}

fn init_logging(config: &ShellConfig) {
    let default = if config.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
