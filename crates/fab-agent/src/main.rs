//! fab-agent - FabEdge node agent
//!
//! Keeps IPsec tunnels, routes and iptables rules of this node in line with
//! the topology file written by the operator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fab_agent::{AgentConfig, bootstrap, manager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "fab-agent")]
#[command(about = "FabEdge node agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run {
        /// Path to config file
        #[arg(short, long, env = "FAB_AGENT_CONFIG", default_value = "/etc/fabedge/agent.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("fab_agent=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_agent(config).await,
    }
}

async fn run_agent(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Arc::new(AgentConfig::from_file(&config_path)?);
    init_tracing(config.json_logs)?;
    info!(
        config = %config_path.display(),
        topology = %config.paths.network_conf.display(),
        cni = %config.route.cni,
        gossip = config.gossip.enabled,
        "starting fab-agent"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutting down");
            cancel.cancel();
        });
    }

    let propagation = bootstrap::spawn_propagation(&config, cancel.clone()).await?;
    let manager = bootstrap::build_manager(Arc::clone(&config));
    manager.run(cancel).await;

    if let Some(task) = propagation {
        manager::join_background(vec![task]).await;
    }
    Ok(())
}
