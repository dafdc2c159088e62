use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use emission_oracle::chain::{
    EvmRpc, HolderSnapshot, HttpHolderSource, HttpRosterSource, RosterSnapshot, Shared,
};
use emission_oracle::claim::AddressClaim;
use emission_oracle::config::Config;
use emission_oracle::positions::{HttpPriceOracle, PositionFetcher, PriceOracle, SubgraphClient};
use emission_oracle::ratelimit::RateLimiter;
use emission_oracle::scheduler::Scheduler;
use emission_oracle::server::{run_server, AppState};
use emission_oracle::store::Store;
use emission_oracle::version::Version;
use emission_oracle::votes::intake::VoteIntake;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "emission-oracle",
    about = "Vote-driven emission coordination for a liquidity-mining subnet"
)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let version = match Version::load(Path::new("VERSION")) {
        Ok(version) => version,
        Err(error) => {
            warn!("VERSION file unreadable ({error:#}), using crate version");
            env!("CARGO_PKG_VERSION").parse()?
        }
    };
    info!("emission-oracle {version} starting (netuid {})", config.chain.netuid);

    let store = Arc::new(Store::open(&config.resolved_db_path())?);
    let chain = Arc::new(EvmRpc::new(
        config.chain.rpc_url.clone(),
        config.chain.factory_address.clone(),
    ));
    let holders = Arc::new(Shared::new(HolderSnapshot::empty()));
    let roster = Arc::new(Shared::new(RosterSnapshot::empty()));
    let limiter = Arc::new(RateLimiter::new());

    let holder_source = Arc::new(HttpHolderSource::new(config.sources.holders_url.clone()));
    let roster_source = Arc::new(HttpRosterSource::new(config.sources.roster_url.clone()));
    let subgraph = Arc::new(SubgraphClient::new(
        config.subgraph.url.clone(),
        config.subgraph.api_key.clone(),
    ));
    let oracle: Option<Arc<dyn PriceOracle>> = config
        .sources
        .price_oracle_url
        .as_ref()
        .map(|url| Arc::new(HttpPriceOracle::new(url.clone())) as Arc<dyn PriceOracle>);

    let intake = VoteIntake::new(
        store.clone(),
        chain.clone(),
        holders.clone(),
        limiter.clone(),
        config.chain.block_window,
    );
    let claim = AddressClaim::new(
        store.clone(),
        chain.clone(),
        roster.clone(),
        limiter.clone(),
        config.chain.block_window,
    );
    let fetcher = PositionFetcher::new(store.clone(), subgraph);

    let csv_dir = config
        .logging
        .csv_snapshots
        .then(|| PathBuf::from(config.logging.csv_dir.clone()));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        chain.clone(),
        holders.clone(),
        roster.clone(),
        holder_source,
        roster_source,
        limiter.clone(),
        config.chain.netuid,
        csv_dir,
    ));

    // The first holders build gates startup; exit non-zero if it fails.
    scheduler.startup().await?;
    tokio::spawn(scheduler.run());

    let bind: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow!("invalid bind address: {e}"))?;
    let state = Arc::new(AppState::new(
        config, store, chain, holders, roster, limiter, intake, claim, fetcher, oracle, version,
    ));
    run_server(state, bind).await?;

    info!("shutdown complete");
    Ok(())
}
