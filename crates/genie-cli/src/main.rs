//! Genie CLI - operate an isolated compute cell through a shared data plane.
//!
//! The same binary serves both roles: `genie server run` inside the cell,
//! `genie client …` outside it. The two sides only ever meet in the
//! configured transport.

mod client;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "genie")]
#[command(about = "Run an allow-listed set of commands inside an isolated cell")]
struct Cli {
    /// Path to the config file (falls back to GENIE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Server-side commands
    #[command(subcommand)]
    Server(ServerCommand),

    /// Client commands to interact with a genie server
    #[command(subcommand)]
    Client(ClientCommand),
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Run a genie server until interrupted
    Run,
}

#[derive(Subcommand, Debug)]
enum ClientCommand {
    /// Manage sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Forward a kubectl invocation to the current session
    Kubectl {
        /// Arguments passed through to kubectl
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Create a new session with that name and print its id
    #[command(
        after_help = "Example: export GENIE_SESSION=$(genie client session create my-session)"
    )]
    Create { name: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    // Logs go to stderr; stdout is reserved for session ids and command
    // output so the client composes in shell pipelines.
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let result = match cli.command {
        Command::Server(ServerCommand::Run) => server::run(cli.config.as_deref()).await,
        Command::Client(ClientCommand::Session(SessionCommand::Create { name })) => {
            client::create_session(cli.config.as_deref(), &name).await
        }
        Command::Client(ClientCommand::Kubectl { args }) => {
            client::kubectl(cli.config.as_deref(), args).await
        }
    };

    match result {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("genie: {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_kubectl_args_pass_through_flags() {
        let cli = Cli::parse_from([
            "genie", "client", "kubectl", "get", "pods", "-n", "default",
        ]);
        match cli.command {
            Command::Client(ClientCommand::Kubectl { args }) => {
                assert_eq!(args, vec!["get", "pods", "-n", "default"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::parse_from([
            "genie", "server", "run", "--config", "/etc/genie/config.yaml",
        ]);
        assert_eq!(
            cli.config,
            Some(PathBuf::from("/etc/genie/config.yaml"))
        );
    }
}
