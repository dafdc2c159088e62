use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::chain::post_json;
use crate::positions::{Position, PositionPool, TokenMeta};

const OWNER_BATCH_SIZE: usize = 100;
const PAGE_CAP: usize = 1000;

#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn positions_for_owners(
        &self,
        owners: &[String],
        pools: &[String],
    ) -> Result<Vec<Position>>;
}

/// Uniswap V3 subgraph client. Owners are queried in batches of 100 with a
/// 1000-row page cap and a `liquidity > 1` floor server-side.
pub struct SubgraphClient {
    url: String,
    api_key: String,
}

impl SubgraphClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

const POSITIONS_QUERY: &str = r#"
query ($owners: [String!], $pools: [String!]) {
  positions(
    first: 1000,
    where: { owner_in: $owners, pool_in: $pools, liquidity_gt: 1 }
  ) {
    id
    owner
    liquidity
    tickLower { tickIdx }
    tickUpper { tickIdx }
    pool { id feeTier tick }
    token0 { symbol decimals }
    token1 { symbol decimals }
  }
}
"#;

#[async_trait]
impl PositionSource for SubgraphClient {
    async fn positions_for_owners(
        &self,
        owners: &[String],
        pools: &[String],
    ) -> Result<Vec<Position>> {
        let mut out = Vec::new();
        for batch in owners.chunks(OWNER_BATCH_SIZE) {
            let body = json!({
                "query": POSITIONS_QUERY,
                "variables": { "owners": batch, "pools": pools },
            });
            let bearer = (!self.api_key.is_empty()).then_some(self.api_key.as_str());
            let response = post_json(&self.url, &body, bearer).await?;
            if let Some(errors) = response.get("errors") {
                return Err(anyhow!("subgraph errors: {errors}"));
            }
            let page: GqlData = serde_json::from_value(
                response
                    .get("data")
                    .cloned()
                    .ok_or_else(|| anyhow!("subgraph response missing data"))?,
            )?;
            if page.positions.len() >= PAGE_CAP {
                warn!(
                    "subgraph page cap hit for a batch of {} owners; positions beyond {} dropped",
                    batch.len(),
                    PAGE_CAP
                );
            }
            out.extend(page.positions.into_iter().filter_map(convert));
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct GqlData {
    #[serde(default)]
    positions: Vec<GqlPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPosition {
    id: String,
    owner: String,
    liquidity: String,
    tick_lower: GqlTick,
    tick_upper: GqlTick,
    pool: GqlPool,
    token0: GqlToken,
    token1: GqlToken,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlTick {
    tick_idx: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPool {
    id: String,
    fee_tier: String,
    tick: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GqlToken {
    symbol: String,
    decimals: String,
}

/// Subgraph numerics arrive as strings; drop entries that fail to parse
/// rather than poisoning the whole page.
fn convert(raw: GqlPosition) -> Option<Position> {
    let liquidity: f64 = raw.liquidity.parse().ok()?;
    let tick_lower: i32 = raw.tick_lower.tick_idx.parse().ok()?;
    let tick_upper: i32 = raw.tick_upper.tick_idx.parse().ok()?;
    let tick: i32 = raw.pool.tick.as_deref()?.parse().ok()?;
    let fee_tier: u32 = raw.pool.fee_tier.parse().ok()?;
    Some(Position {
        id: raw.id,
        owner: raw.owner.to_ascii_lowercase(),
        liquidity,
        tick_lower,
        tick_upper,
        pool: PositionPool {
            id: raw.pool.id.to_ascii_lowercase(),
            fee_tier,
            tick,
        },
        token0: TokenMeta {
            symbol: raw.token0.symbol,
            decimals: raw.token0.decimals.parse().unwrap_or(18),
        },
        token1: TokenMeta {
            symbol: raw.token1.symbol,
            decimals: raw.token1.decimals.parse().unwrap_or(18),
        },
    })
}
