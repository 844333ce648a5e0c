//! `vsbx`: run a command inside a policy-driven sandbox.
//!
//! Exit code mirrors the child: its exit status on normal termination, 1
//! when the child was signalled or the configuration was unusable.

use clap::Parser;
use std::path::PathBuf;
use tracing::debug;
use vsbx_core::SandboxManager;
use vsbx_core::config::load_default_settings;
use vsbx_core::config::load_settings;

#[derive(Debug, Parser)]
#[command(
    name = "vsbx",
    about = "Sandbox a shell command with filesystem and network policy",
    after_help = "Positional tokens are joined with single spaces, which loses \
                  the original quoting; use -c for commands that need it."
)]
struct Cli {
    /// Settings file (defaults to ~/.vsbx-settings.json when present).
    #[arg(short = 's', long = "settings", value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Command string to run through the shell.
    #[arg(short = 'c', long = "command", value_name = "COMMAND", conflicts_with = "tokens")]
    command: Option<String>,

    /// Command tokens.
    #[arg(value_name = "TOKENS", trailing_var_arg = true, allow_hyphen_values = true)]
    tokens: Vec<String>,
}

#[tokio::main]
async fn main() {
    init_logging();
    let code = run(Cli::parse()).await;
    std::process::exit(code);
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_env("VSBX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> i32 {
    let command = match cli.command {
        Some(command) => command,
        None if !cli.tokens.is_empty() => cli.tokens.join(" "),
        None => {
            eprintln!("vsbx: no command given (pass tokens or -c \"<command>\")");
            return 1;
        }
    };

    let config = match &cli.settings {
        Some(path) => load_settings(path),
        None => load_default_settings(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("vsbx: {err}");
            return 1;
        }
    };

    let manager = match SandboxManager::new(config) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("vsbx: {err}");
            return 1;
        }
    };

    let wrapped = match manager.wrap(&command).await {
        Ok(wrapped) => wrapped,
        Err(err) => {
            eprintln!("vsbx: {err}");
            manager.reset().await;
            return 1;
        }
    };
    debug!(wrapped = %wrapped, "running wrapped command");

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
    let status = tokio::process::Command::new(shell)
        .arg("-c")
        .arg(&wrapped)
        .status()
        .await;

    let code = match status {
        Ok(status) => match status.code() {
            Some(code) => code,
            None => {
                eprintln!("vsbx: command terminated by signal");
                1
            }
        },
        Err(err) => {
            eprintln!("vsbx: failed to spawn shell: {err}");
            1
        }
    };

    let violations = manager.annotate_stderr(&command, "");
    if !violations.is_empty() {
        eprint!("{violations}");
    }

    manager.reset().await;
    code
}
