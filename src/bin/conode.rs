use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use conode::{ConodeConfig, LocalCluster};
use conode_byzcoin::Signer;
use conode_crypto::point_to_bytes;

#[derive(Parser)]
#[command(name = "conode")]
#[command(about = "Skipchains, a permissioned ledger and Calypso on a local cothority", long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a local cluster, bootstrap a ledger with an LTS and serve until interrupted
    Run,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = ConodeConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run => run(cfg).await?,
        Commands::Config => println!("{}", cfg.to_json()?),
    }
    Ok(())
}

async fn run(cfg: ConodeConfig) -> Result<()> {
    info!("Starting {} conodes...", cfg.nodes);
    let cluster = LocalCluster::start(cfg)?;
    let owner = Signer::generate();
    let boot = cluster.bootstrap(&owner).await.context("bootstrapping the ledger")?;

    println!("byzcoin id:  {}", boot.byzcoin_id);
    println!("genesis darc: {}", boot.darc.get_base_id());
    println!("lts id:      {}", boot.lts.instance_id);
    println!("lts key:     {}", hex::encode(point_to_bytes(&boot.lts.x)));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
