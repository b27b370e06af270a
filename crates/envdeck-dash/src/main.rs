mod app;
mod backend;
mod config;
mod exec;
mod help;
mod launch;
mod logging;
mod msg;
mod sentinel;
mod theme;
mod ui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "envdeck",
    version,
    about = "Terminal dashboard for local development environments"
)]
struct Cli {
    /// Run the dashboard inside an already started tmux instance.
    #[arg(long, hide = true)]
    inner: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    #[command(hide = true)]
    Keys,
    #[command(hide = true, name = "config-help")]
    ConfigHelp,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Keys) => return help::run_static(help::Page::Keys).map(|()| ExitCode::SUCCESS),
        Some(Command::ConfigHelp) => {
            return help::run_static(help::Page::Config).map(|()| ExitCode::SUCCESS)
        }
        None => {}
    }

    let role = if cli.inner { "inner" } else { "outer" };
    let log_guard = logging::init_logging(role);
    let log_path = log_guard.as_ref().and_then(|guard| guard.path.as_ref());
    tracing::info!(
        role,
        pid = std::process::id(),
        log = ?log_path,
        "envdeck_start"
    );

    if cli.inner {
        launch::run_inner().await
    } else {
        tokio::task::spawn_blocking(launch::run_outer)
            .await
            .context("launcher thread")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_flag_is_accepted() {
        let cli = Cli::try_parse_from(["envdeck", "--inner"]).expect("parse");
        assert!(cli.inner);
        assert!(cli.command.is_none());
    }

    #[test]
    fn hidden_help_subcommands_parse() {
        let cli = Cli::try_parse_from(["envdeck", "config-help"]).expect("parse");
        assert!(matches!(cli.command, Some(Command::ConfigHelp)));
        let cli = Cli::try_parse_from(["envdeck", "keys"]).expect("parse");
        assert!(matches!(cli.command, Some(Command::Keys)));
    }
}
