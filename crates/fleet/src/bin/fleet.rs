//! Fleet CLI - start, inspect and tear down node pools.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet::{Fleet, FleetConfig, SystemKind};

/// Fleet CLI - provision nodes on Compute Engine or Kubernetes.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Provision and manage bootstrap node pools")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables are used when unset).
    #[arg(long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Backend to use, overriding the configuration.
    #[arg(long)]
    system: Option<SystemKind>,

    /// Ownership label, overriding the configuration.
    #[arg(long)]
    owner: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start nodes.
    Start {
        /// Number of nodes.
        #[arg(long, allow_negative_numbers = true)]
        count: i64,
    },

    /// List owned nodes.
    List,

    /// Print a file from a node.
    Read {
        /// Node name.
        #[arg(long)]
        node: String,

        /// Absolute path on the node.
        #[arg(long)]
        path: String,
    },

    /// Follow a node's container logs.
    Tail {
        /// Node name.
        #[arg(long)]
        node: String,
    },

    /// Delete all owned nodes.
    Teardown {
        /// Also delete the backend's resource group (Kubernetes namespace).
        #[arg(long, default_value = "false")]
        namespace: bool,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<FleetConfig> {
    let mut config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => FleetConfig::from_env().context("Failed to read configuration from environment")?,
    };
    if let Some(system) = cli.system {
        config.system = system;
    }
    if let Some(owner) = &cli.owner {
        config.owner.clone_from(owner);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let config = load_config(&cli)?;
    let fleet = Fleet::connect(config)
        .await
        .context("Failed to initialize fleet")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Start { count } => {
            let result = fleet.start(count, &cancel).await.context("Start failed")?;
            for node in &result.nodes {
                let endpoint = node
                    .endpoint()
                    .map_or_else(|| "-".to_string(), ToString::to_string);
                println!("{}\t{}\t{}", node.name(), node.state(), endpoint);
            }
            if let Some(e) = result.partial_error() {
                bail!(e);
            }
        }

        Commands::List => {
            let nodes = fleet.list().await.context("Failed to list nodes")?;
            if nodes.is_empty() {
                info!("No nodes found");
            }
            for node in nodes {
                let endpoint = node
                    .endpoint()
                    .map_or_else(|| "-".to_string(), ToString::to_string);
                println!("{}\t{}\t{}", node.name(), node.kind(), endpoint);
            }
        }

        Commands::Read { node, path } => {
            let node = fleet.find(&node).await?;
            let content = fleet
                .read(&node, &path, &cancel)
                .await
                .with_context(|| format!("Failed to read {path} on {}", node.name()))?;
            std::io::stdout().write_all(&content)?;
        }

        Commands::Tail { node } => {
            let node = fleet.find(&node).await?;
            let mut stream = fleet
                .tail(&node, &cancel)
                .await
                .with_context(|| format!("Failed to tail {}", node.name()))?;
            let mut stdout = std::io::stdout();
            while let Some(chunk) = stream.next().await {
                stdout.write_all(&chunk?)?;
                stdout.flush()?;
            }
        }

        Commands::Teardown { namespace } => {
            let report = fleet.shutdown().await.context("Teardown failed")?;
            info!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Nodes deleted"
            );
            if namespace {
                fleet
                    .delete_group()
                    .await
                    .context("Failed to delete resource group")?;
            }
        }
    }

    Ok(())
}
