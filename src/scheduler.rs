use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::chain::holders::HOLDERS_TTL_SECS;
use crate::chain::roster::ROSTER_TTL_SECS;
use crate::chain::{
    HolderSnapshot, HolderSource, PoolChain, RosterSnapshot, RosterSource, Shared,
};
use crate::output::csv::write_holders_snapshot;
use crate::ratelimit::RateLimiter;
use crate::store::Store;

const SNAPSHOT_CHECK_SECS: u64 = 60;
const COOLDOWN_CLEANUP_SECS: u64 = 60 * 60;
const RATELIMIT_PRUNE_SECS: u64 = 5 * 60;
const BACKFILL_BATCH_SIZE: usize = 5;
const BACKFILL_GAP: Duration = Duration::from_secs(1);

/// Background work: snapshot refreshes, cooldown cleanup, rate-limit
/// pruning, startup backfill.
pub struct Scheduler {
    store: Arc<Store>,
    chain: Arc<dyn PoolChain>,
    holders: Arc<Shared<HolderSnapshot>>,
    roster: Arc<Shared<RosterSnapshot>>,
    holder_source: Arc<dyn HolderSource>,
    roster_source: Arc<dyn RosterSource>,
    limiter: Arc<RateLimiter>,
    netuid: u16,
    csv_dir: Option<PathBuf>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn PoolChain>,
        holders: Arc<Shared<HolderSnapshot>>,
        roster: Arc<Shared<RosterSnapshot>>,
        holder_source: Arc<dyn HolderSource>,
        roster_source: Arc<dyn RosterSource>,
        limiter: Arc<RateLimiter>,
        netuid: u16,
        csv_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            chain,
            holders,
            roster,
            holder_source,
            roster_source,
            limiter,
            netuid,
            csv_dir,
        }
    }

    /// Startup sequence. The first holders build is load-bearing: without
    /// it every vote would bounce off the alpha gate, so failure is fatal.
    pub async fn startup(&self) -> Result<()> {
        self.refresh_holders()
            .await
            .context("initial holders snapshot build failed")?;
        if let Err(error) = self.refresh_roster().await {
            warn!("initial roster build failed (miners gate degraded): {error:#}");
        }
        self.backfill_pool_metadata().await;
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut snapshots = tokio::time::interval(Duration::from_secs(SNAPSHOT_CHECK_SECS));
        let mut cooldowns = tokio::time::interval(Duration::from_secs(COOLDOWN_CLEANUP_SECS));
        let mut windows = tokio::time::interval(Duration::from_secs(RATELIMIT_PRUNE_SECS));

        loop {
            tokio::select! {
                _ = snapshots.tick() => {
                    if self.holders.get().age_secs() > HOLDERS_TTL_SECS {
                        if let Err(error) = self.refresh_holders().await {
                            warn!("holders refresh failed, keeping previous snapshot: {error:#}");
                        }
                    }
                    if self.roster.get().age_secs() > ROSTER_TTL_SECS {
                        if let Err(error) = self.refresh_roster().await {
                            warn!("roster refresh failed, keeping previous snapshot: {error:#}");
                        }
                    }
                }
                _ = cooldowns.tick() => {
                    match self.store.cleanup_expired_cooldowns(Utc::now().timestamp()) {
                        Ok(removed) if removed > 0 => {
                            info!("cleaned up {removed} expired cooldowns");
                        }
                        Ok(_) => {}
                        Err(error) => warn!("cooldown cleanup failed: {}", error.kind()),
                    }
                }
                _ = windows.tick() => {
                    let pruned = self.limiter.prune();
                    if pruned > 0 {
                        info!("pruned {pruned} rate-limit windows");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }

    async fn refresh_holders(&self) -> Result<()> {
        let balances = self.holder_source.fetch_holders(self.netuid).await?;
        let snapshot = HolderSnapshot::new(balances);
        info!("holders snapshot rebuilt: {} entries", snapshot.balances.len());
        if let Some(dir) = &self.csv_dir {
            match write_holders_snapshot(dir, &snapshot) {
                Ok(path) => info!("holders snapshot logged to {}", path.display()),
                Err(error) => warn!("holders CSV log failed: {error:#}"),
            }
        }
        self.holders.replace(snapshot);
        Ok(())
    }

    async fn refresh_roster(&self) -> Result<()> {
        let miners = self.roster_source.fetch_roster(self.netuid).await?;
        let snapshot = RosterSnapshot::new(miners);
        info!("roster rebuilt: {} miners", snapshot.miners.len());
        self.roster.replace(snapshot);
        Ok(())
    }

    /// Re-read metadata for pools whose symbol columns are still empty, in
    /// batches of five with a one-second gap to spare the RPC endpoint.
    async fn backfill_pool_metadata(&self) {
        let missing = match self.store.pools_missing_symbols() {
            Ok(missing) => missing,
            Err(error) => {
                warn!("pool backfill scan failed: {}", error.kind());
                return;
            }
        };
        if missing.is_empty() {
            return;
        }
        info!("backfilling metadata for {} pools", missing.len());
        let mut batches = missing.chunks(BACKFILL_BATCH_SIZE).peekable();
        while let Some(batch) = batches.next() {
            for address in batch {
                match self.chain.pool_metadata(address).await {
                    Ok(metadata) => {
                        if let Err(error) = self.store.upsert_pool(&metadata) {
                            warn!("pool backfill write failed for {address}: {}", error.kind());
                        }
                    }
                    Err(error) => warn!("pool backfill fetch failed for {address}: {error:#}"),
                }
            }
            if batches.peek().is_some() {
                tokio::time::sleep(BACKFILL_GAP).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use super::Scheduler;
    use crate::chain::holders::HolderBalance;
    use crate::chain::{
        HolderSnapshot, HolderSource, PoolChain, PoolMetadata, RosterSnapshot, RosterSource,
        Shared,
    };
    use crate::ratelimit::RateLimiter;
    use crate::store::Store;

    struct StubChain;

    #[async_trait]
    impl PoolChain for StubChain {
        async fn block_number(&self) -> Result<u64> {
            Ok(1)
        }

        async fn is_canonical_pool(&self, _pool: &str) -> Result<bool> {
            Ok(true)
        }

        async fn pool_metadata(&self, pool: &str) -> Result<PoolMetadata> {
            Ok(PoolMetadata {
                address: pool.to_string(),
                token0: "0x01".into(),
                token1: "0x02".into(),
                fee: 500,
                liquidity: 7,
                symbol0: Some("T0".into()),
                symbol1: Some("T1".into()),
            })
        }
    }

    struct StubHolders(bool);

    #[async_trait]
    impl HolderSource for StubHolders {
        async fn fetch_holders(&self, _netuid: u16) -> Result<HashMap<String, HolderBalance>> {
            if !self.0 {
                return Err(anyhow!("crawler offline"));
            }
            let mut out = HashMap::new();
            out.insert(
                "5Voter".to_string(),
                HolderBalance {
                    alpha_raw: 10,
                    tao_raw: 0,
                },
            );
            Ok(out)
        }
    }

    struct StubRoster;

    #[async_trait]
    impl RosterSource for StubRoster {
        async fn fetch_roster(&self, _netuid: u16) -> Result<Vec<String>> {
            Ok(vec!["5Miner".to_string()])
        }
    }

    fn scheduler(holders_ok: bool, store: Arc<Store>) -> Scheduler {
        Scheduler::new(
            store,
            Arc::new(StubChain),
            Arc::new(Shared::new(HolderSnapshot::empty())),
            Arc::new(Shared::new(RosterSnapshot::empty())),
            Arc::new(StubHolders(holders_ok)),
            Arc::new(StubRoster),
            Arc::new(RateLimiter::new()),
            10,
            None,
        )
    }

    #[tokio::test]
    async fn startup_fails_without_a_holders_build() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        assert!(scheduler(false, store).startup().await.is_err());
    }

    #[tokio::test]
    async fn startup_builds_snapshots_and_backfills_pools() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        store
            .upsert_pool(&PoolMetadata {
                address: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
                token0: "0x01".into(),
                token1: "0x02".into(),
                fee: 500,
                liquidity: 0,
                symbol0: None,
                symbol1: None,
            })
            .expect("seed pool");

        let scheduler = scheduler(true, store.clone());
        scheduler.startup().await.expect("startup");

        assert!(scheduler.holders.get().holds_alpha("5Voter"));
        assert!(scheduler.roster.get().contains("5Miner"));
        let refilled = store
            .pool("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .expect("read")
            .expect("present");
        assert_eq!(refilled.symbol0.as_deref(), Some("T0"));
    }
}
