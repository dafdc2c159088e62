pub mod math;
pub mod price;
pub mod subgraph;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::ServiceError;
use crate::store::Store;

pub use price::{HttpPriceOracle, PriceOracle};
pub use subgraph::{PositionSource, SubgraphClient};

pub const POSITION_CACHE_TTL_SECS: i64 = 60;

/// One concentrated-liquidity position as read from the subgraph.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: String,
    pub owner: String,
    pub liquidity: f64,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub pool: PositionPool,
    pub token0: TokenMeta,
    pub token1: TokenMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionPool {
    pub id: String,
    pub fee_tier: u32,
    pub tick: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenMeta {
    pub symbol: String,
    pub decimals: u32,
}

impl Position {
    /// Active iff the pool trades strictly inside the range and liquidity
    /// is live.
    pub fn is_active(&self) -> bool {
        self.liquidity > 0.0
            && self.tick_lower < self.pool.tick
            && self.pool.tick < self.tick_upper
    }
}

/// Active positions of one registered miner.
#[derive(Debug, Clone, Serialize)]
pub struct MinerPositions {
    pub miner: String,
    pub owner: String,
    pub positions: Vec<Position>,
}

struct CachedPositions {
    fetched_at: DateTime<Utc>,
    by_miner: Vec<MinerPositions>,
}

/// Batched subgraph reads with a 60-second cache. Only active positions in
/// currently-voted pools ever enter the cache.
pub struct PositionFetcher {
    store: Arc<Store>,
    source: Arc<dyn PositionSource>,
    cache: Mutex<Option<CachedPositions>>,
}

impl PositionFetcher {
    pub fn new(store: Arc<Store>, source: Arc<dyn PositionSource>) -> Self {
        Self {
            store,
            source,
            cache: Mutex::new(None),
        }
    }

    pub async fn active_positions(&self) -> Result<Vec<MinerPositions>, ServiceError> {
        {
            let guard = self.cache.lock();
            if let Some(cached) = guard.as_ref() {
                if (Utc::now() - cached.fetched_at).num_seconds() < POSITION_CACHE_TTL_SECS {
                    return Ok(cached.by_miner.clone());
                }
            }
        }

        let by_miner = self.refresh().await?;
        *self.cache.lock() = Some(CachedPositions {
            fetched_at: Utc::now(),
            by_miner: by_miner.clone(),
        });
        Ok(by_miner)
    }

    async fn refresh(&self) -> Result<Vec<MinerPositions>, ServiceError> {
        let targets = self.store.voted_pool_addresses()?;
        let bindings = self.store.all_bindings()?;
        if targets.is_empty() || bindings.is_empty() {
            return Ok(Vec::new());
        }

        let mut miner_by_owner: HashMap<String, String> = HashMap::new();
        for binding in &bindings {
            miner_by_owner.insert(binding.external.to_ascii_lowercase(), binding.voter.clone());
        }
        let owners: Vec<String> = miner_by_owner.keys().cloned().collect();

        let fetched = self
            .source
            .positions_for_owners(&owners, &targets)
            .await
            .map_err(|error| {
                warn!("subgraph fetch failed: {error:#}");
                ServiceError::Upstream
            })?;

        let mut grouped: HashMap<String, MinerPositions> = HashMap::new();
        for position in fetched {
            if !position.is_active() {
                continue;
            }
            let owner = position.owner.to_ascii_lowercase();
            let Some(miner) = miner_by_owner.get(&owner) else {
                continue;
            };
            grouped
                .entry(miner.clone())
                .or_insert_with(|| MinerPositions {
                    miner: miner.clone(),
                    owner: owner.clone(),
                    positions: Vec::new(),
                })
                .positions
                .push(position);
        }
        let mut by_miner: Vec<MinerPositions> = grouped.into_values().collect();
        by_miner.sort_by(|a, b| a.miner.cmp(&b.miner));
        Ok(by_miner)
    }
}
