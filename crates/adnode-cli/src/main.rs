//! adnode - operator CLI for the campaign-link miner node.
//!
//! Talks to a running `adnode-daemon` over its local operator socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use adnode_core::config::{NodeConfig, default_operator_socket};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod client;
mod commands;

use client::OperatorClient;

/// adnode - campaign-link miner node
#[derive(Parser, Debug)]
#[command(name = "adnode")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Node configuration file, read for the operator socket path
    #[arg(short, long, default_value = "adnode.toml")]
    config: PathBuf,

    /// Path to the operator socket (overrides the configuration file)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Campaign link commands
    #[command(subcommand)]
    Campaigns(CampaignCommands),

    /// Two-factor code commands
    #[command(name = "2fa", subcommand)]
    TwoFactor(TwoFactorCommands),

    /// Show node status
    Status,

    /// Self-update commands
    #[command(subcommand)]
    Update(UpdateCommands),

    /// Stop the node (graceful shutdown)
    Kill {
        /// Wait until the node has exited, up to this many seconds
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "30")]
        wait: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignCommands {
    /// List active campaign links
    #[command(alias = "ls")]
    Links,

    /// Replace a campaign's link with a fresh one
    Refresh {
        /// Campaign identifier
        campaign_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum TwoFactorCommands {
    /// List codes that can still be used
    List,

    /// Mark a code as used
    Consume {
        /// The code
        code: String,
    },
}

#[derive(Subcommand, Debug)]
enum UpdateCommands {
    /// Check for a new release now, and upgrade if one is found
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let socket_path = resolve_socket(&cli);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run(cli.command, &socket_path, cli.json))
}

/// `--socket`, else the configuration file's `daemon.operator_socket`, else
/// the default runtime path.
fn resolve_socket(cli: &Cli) -> PathBuf {
    if let Some(socket) = &cli.socket {
        return socket.clone();
    }
    if cli.config.exists() {
        match NodeConfig::from_file(&cli.config) {
            Ok(config) => return config.daemon.operator_socket,
            Err(e) => tracing::warn!(
                config = %cli.config.display(),
                error = %e,
                "ignoring unreadable configuration file"
            ),
        }
    }
    default_operator_socket()
}

async fn run(command: Commands, socket_path: &Path, json: bool) -> Result<()> {
    let mut client = OperatorClient::connect(socket_path)
        .await
        .context("failed to connect to adnode")?;

    match command {
        Commands::Campaigns(CampaignCommands::Links) => {
            commands::links::list(&mut client, json).await
        },
        Commands::Campaigns(CampaignCommands::Refresh { campaign_id }) => {
            commands::links::refresh(&mut client, &campaign_id, json).await
        },
        Commands::TwoFactor(TwoFactorCommands::List) => {
            commands::two_factor::list(&mut client, json).await
        },
        Commands::TwoFactor(TwoFactorCommands::Consume { code }) => {
            commands::two_factor::consume(&mut client, &code, json).await
        },
        Commands::Status => commands::node::status(&mut client, json).await,
        Commands::Update(UpdateCommands::Check) => {
            commands::node::update_check(&mut client, json).await
        },
        Commands::Kill { wait } => {
            commands::node::kill(&mut client, socket_path, wait.map(Duration::from_secs), json)
                .await
        },
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn two_factor_subcommand_name() {
        let cli = Cli::try_parse_from(["adnode", "2fa", "consume", "482913"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::TwoFactor(TwoFactorCommands::Consume { ref code }) if code == "482913"
        ));
    }

    #[test]
    fn json_flag_is_global() {
        let cli = Cli::try_parse_from(["adnode", "campaigns", "links", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn kill_wait_defaults() {
        let cli = Cli::try_parse_from(["adnode", "kill", "--wait"]).unwrap();
        assert!(matches!(cli.command, Commands::Kill { wait: Some(30) }));
        let cli = Cli::try_parse_from(["adnode", "kill"]).unwrap();
        assert!(matches!(cli.command, Commands::Kill { wait: None }));
    }

    #[test]
    fn explicit_socket_wins() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = tmp.path().join("adnode.toml");
        std::fs::write(
            &config,
            concat!(
                "[identity]\nwallet_name = \"miner\"\nhotkey = \"default\"\n\n",
                "[daemon]\noperator_socket = \"/srv/adnode/op.sock\"\n",
            ),
        )
        .unwrap();

        let config = config.to_str().unwrap();

        let cli = Cli::try_parse_from(["adnode", "--config", config, "status"]).unwrap();
        assert_eq!(resolve_socket(&cli), PathBuf::from("/srv/adnode/op.sock"));

        let cli = Cli::try_parse_from([
            "adnode",
            "--config",
            config,
            "--socket",
            "/tmp/other.sock",
            "status",
        ])
        .unwrap();
        assert_eq!(resolve_socket(&cli), PathBuf::from("/tmp/other.sock"));
    }
}
