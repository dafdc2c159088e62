use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::chain::{HolderSnapshot, PoolChain, RosterSnapshot, Shared};
use crate::claim::{AddressClaim, ClaimRequest};
use crate::config::Config;
use crate::crypto;
use crate::emission;
use crate::error::ServiceError;
use crate::positions::{math, MinerPositions, PositionFetcher, PriceOracle};
use crate::ratelimit::{RateLimiter, IP_LIMIT, PING_LIMIT};
use crate::store::Store;
use crate::version::{self, PingCompat, Version};
use crate::votes::cooldown;
use crate::votes::intake::{VoteIntake, VoteRequest};

const ALL_VOTES_CACHE_TTL_SECS: i64 = 30;
const HISTORY_LIMIT: usize = 100;

pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub chain: Arc<dyn PoolChain>,
    pub holders: Arc<Shared<HolderSnapshot>>,
    pub roster: Arc<Shared<RosterSnapshot>>,
    pub limiter: Arc<RateLimiter>,
    pub intake: VoteIntake,
    pub claim: AddressClaim,
    pub fetcher: PositionFetcher,
    pub oracle: Option<Arc<dyn PriceOracle>>,
    pub version: Version,
    all_votes_cache: Mutex<Option<(i64, Value)>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Arc<Store>,
        chain: Arc<dyn PoolChain>,
        holders: Arc<Shared<HolderSnapshot>>,
        roster: Arc<Shared<RosterSnapshot>>,
        limiter: Arc<RateLimiter>,
        intake: VoteIntake,
        claim: AddressClaim,
        fetcher: PositionFetcher,
        oracle: Option<Arc<dyn PriceOracle>>,
        version: Version,
    ) -> Self {
        Self {
            config,
            store,
            chain,
            holders,
            roster,
            limiter,
            intake,
            claim,
            fetcher,
            oracle,
            version,
            all_votes_cache: Mutex::new(None),
        }
    }
}

struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::InvalidInput
            | ServiceError::InvalidPool
            | ServiceError::InvalidBlock
            | ServiceError::StaleBlock
            | ServiceError::VersionIncompatible => StatusCode::BAD_REQUEST,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::NotAHolder | ServiceError::NotRegisteredMiner => StatusCode::FORBIDDEN,
            ServiceError::RateLimited | ServiceError::CooldownActive(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ServiceError::Database | ServiceError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Upstream => StatusCode::BAD_GATEWAY,
        };
        let body = Json(json!({ "success": false, "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

/// Success envelope: `{"success": true, ...payload}`.
fn ok(mut payload: Value) -> Json<Value> {
    if let Some(object) = payload.as_object_mut() {
        object.insert("success".to_string(), Value::Bool(true));
    }
    Json(payload)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/updateVotes", post(update_votes))
        .route("/claimAddress", post(claim_address))
        .route("/ping", post(ping))
        .route("/userVotes/:voter", get(user_votes))
        .route("/allVotes", get(all_votes))
        .route("/allHolders", get(all_holders))
        .route("/allAddresses", get(all_addresses))
        .route("/allMiners", get(all_miners))
        .route("/pools", get(pools))
        .route("/positions", get(positions))
        .route("/positions/:miner", get(positions_for_miner))
        .route("/weights", get(weights))
        .route("/voteCooldown/:voter", get(vote_cooldown))
        .route("/voteHistory/:voter", get(vote_history))
        .with_state(state)
        .layer(middleware::from_fn(cors_middleware))
}

pub async fn run_server(state: Arc<AppState>, bind: SocketAddr) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("API listening on http://{bind}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    ok(json!({ "status": "ok", "version": state.version.to_string() }))
}

async fn update_votes(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<VoteRequest>,
) -> ApiResult {
    let accepted = state
        .intake
        .submit(&request, &peer.ip().to_string())
        .await?;
    Ok(ok(json!({
        "voter": accepted.voter,
        "pools": accepted.pools,
        "block_number": accepted.block_number,
        "changed": accepted.changed,
    })))
}

async fn claim_address(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult {
    let accepted = state.claim.submit(&request, &peer.ip().to_string()).await?;
    Ok(ok(json!({
        "voter": accepted.voter,
        "external": accepted.external,
        "already_exists": accepted.already_existed,
    })))
}

#[derive(Debug, Deserialize)]
struct PingRequest {
    signature: String,
    message: String,
    address: String,
}

/// Ping message: `<block>|<major.minor.patch>`.
async fn ping(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<PingRequest>,
) -> ApiResult {
    let address = request.address.trim();
    if address.is_empty() {
        return Err(ServiceError::InvalidInput.into());
    }
    state.limiter.check(&peer.ip().to_string(), IP_LIMIT)?;
    state.limiter.check(&format!("ping_{address}"), PING_LIMIT)?;

    crypto::verify_substrate(&request.message, &request.signature, address)?;

    let (block_raw, version_raw) = request
        .message
        .split_once('|')
        .ok_or(ServiceError::InvalidInput)?;
    let block: u64 = block_raw.parse().map_err(|_| ServiceError::InvalidInput)?;
    let client_version: Version = version_raw
        .parse()
        .map_err(|_| ServiceError::InvalidInput)?;

    let current = state
        .chain
        .block_number()
        .await
        .map_err(|_| ServiceError::Upstream)?;
    if block > current {
        return Err(ServiceError::InvalidBlock.into());
    }
    if block + state.config.chain.block_window < current {
        return Err(ServiceError::StaleBlock.into());
    }

    let compat = version::check_compat(state.version, client_version)?;
    let message = match compat {
        PingCompat::Compatible => "ok",
        PingCompat::ClientAhead => "client is on a non-master branch",
    };
    Ok(ok(json!({
        "message": message,
        "server_version": state.version.to_string(),
    })))
}

async fn user_votes(
    State(state): State<Arc<AppState>>,
    Path(voter): Path<String>,
) -> ApiResult {
    let vote = state.store.current_vote(&voter)?;
    let holders = state.holders.get();
    let payload = vote.map(|vote| {
        json!({
            "voter": vote.voter,
            "pools": vote.pools,
            "block_number": vote.block_number,
            "updated_at": vote.updated_at.to_rfc3339(),
            "alpha": holders.alpha_of(&vote.voter),
        })
    });
    Ok(ok(json!({ "vote": payload })))
}

async fn all_votes(State(state): State<Arc<AppState>>) -> ApiResult {
    let now = Utc::now().timestamp();
    {
        let cache = state.all_votes_cache.lock();
        if let Some((built_at, payload)) = cache.as_ref() {
            if now - built_at < ALL_VOTES_CACHE_TTL_SECS {
                return Ok(ok(payload.clone()));
            }
        }
    }

    let votes = state.store.all_votes()?;
    let holders = state.holders.get();
    let multipliers = emission::voter_multipliers(&votes, &holders);
    let rows: Vec<Value> = votes
        .iter()
        .map(|vote| {
            json!({
                "voter": vote.voter,
                "pools": vote.pools,
                "block_number": vote.block_number,
                "updated_at": vote.updated_at.to_rfc3339(),
                "alpha": holders.alpha_of(&vote.voter),
                "multiplier": multipliers.get(&vote.voter).copied().unwrap_or(0.0),
            })
        })
        .collect();
    let payload = json!({ "votes": rows, "count": rows.len() });
    *state.all_votes_cache.lock() = Some((now, payload.clone()));
    Ok(ok(payload))
}

async fn all_holders(State(state): State<Arc<AppState>>) -> ApiResult {
    let snapshot = state.holders.get();
    let mut holders: Vec<Value> = snapshot
        .balances
        .iter()
        .map(|(address, balance)| {
            json!({
                "address": address,
                "alpha_raw": balance.alpha_raw.to_string(),
                "tao_raw": balance.tao_raw.to_string(),
                "alpha": balance.alpha(),
                "tao": balance.tao(),
            })
        })
        .collect();
    holders.sort_by(|a, b| a["address"].as_str().cmp(&b["address"].as_str()));
    Ok(ok(json!({
        "holders": holders,
        "count": holders.len(),
        "updated_at": snapshot.updated_at.to_rfc3339(),
    })))
}

async fn all_addresses(State(state): State<Arc<AppState>>) -> ApiResult {
    let roster = state.roster.get();
    let bindings: Vec<_> = state
        .store
        .all_bindings()?
        .into_iter()
        .filter(|binding| roster.contains(&binding.voter))
        .collect();
    Ok(ok(json!({ "addresses": bindings, "count": bindings.len() })))
}

async fn all_miners(State(state): State<Arc<AppState>>) -> ApiResult {
    let roster = state.roster.get();
    let bindings = state.store.all_bindings()?;
    let by_voter: HashMap<&str, &str> = bindings
        .iter()
        .map(|binding| (binding.voter.as_str(), binding.external.as_str()))
        .collect();
    let miners: Vec<Value> = roster
        .miners
        .iter()
        .map(|miner| {
            json!({
                "hotkey": miner,
                "external": by_voter.get(miner.as_str()),
            })
        })
        .collect();
    Ok(ok(json!({
        "miners": miners,
        "count": miners.len(),
        "updated_at": roster.updated_at.to_rfc3339(),
    })))
}

/// Aggregated voted pools with voter details and cached metadata.
async fn pools(State(state): State<Arc<AppState>>) -> ApiResult {
    let votes = state.store.all_votes()?;
    let holders = state.holders.get();
    let multipliers = emission::voter_multipliers(&votes, &holders);
    let emissions = emission::pool_emissions(&votes, &multipliers);

    let mut voters_by_pool: HashMap<String, Vec<Value>> = HashMap::new();
    let mut weight_by_pool: HashMap<String, u64> = HashMap::new();
    for vote in &votes {
        for entry in &vote.pools {
            voters_by_pool
                .entry(entry.pool.clone())
                .or_default()
                .push(json!({
                    "voter": vote.voter,
                    "weight": entry.weight,
                    "alpha": holders.alpha_of(&vote.voter),
                }));
            *weight_by_pool.entry(entry.pool.clone()).or_insert(0) += entry.weight;
        }
    }

    let mut rows: Vec<Value> = Vec::new();
    for (pool, voters) in voters_by_pool {
        let metadata = state.store.pool(&pool)?;
        rows.push(json!({
            "address": pool,
            "metadata": metadata,
            "total_weight": weight_by_pool.get(&pool).copied().unwrap_or(0),
            "emission": emissions.get(&pool).copied().unwrap_or(0.0),
            "voters": voters,
        }));
    }
    rows.sort_by(|a, b| {
        b["emission"]
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&a["emission"].as_f64().unwrap_or(0.0))
    });
    Ok(ok(json!({ "pools": rows, "count": rows.len() })))
}

#[derive(Debug, Default, Deserialize)]
struct PositionsQuery {
    hotkey: Option<String>,
    pool: Option<String>,
}

async fn positions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PositionsQuery>,
) -> ApiResult {
    let by_miner = state.fetcher.active_positions().await?;
    let filtered: Vec<MinerPositions> = by_miner
        .into_iter()
        .filter(|miner| {
            query
                .hotkey
                .as_deref()
                .map(|hotkey| miner.miner == hotkey)
                .unwrap_or(true)
        })
        .map(|mut miner| {
            if let Some(pool) = query.pool.as_deref() {
                miner
                    .positions
                    .retain(|position| position.pool.id.eq_ignore_ascii_case(pool));
            }
            miner
        })
        .filter(|miner| !miner.positions.is_empty())
        .collect();
    let payload = render_positions(&state, &filtered).await?;
    Ok(ok(payload))
}

async fn positions_for_miner(
    State(state): State<Arc<AppState>>,
    Path(miner): Path<String>,
) -> ApiResult {
    let by_miner = state.fetcher.active_positions().await?;
    let filtered: Vec<MinerPositions> = by_miner
        .into_iter()
        .filter(|entry| entry.miner == miner)
        .collect();
    let payload = render_positions(&state, &filtered).await?;
    Ok(ok(payload))
}

/// Token amounts, per-position emission shares, and optional USD values on
/// top of the cached active set.
async fn render_positions(
    state: &AppState,
    by_miner: &[MinerPositions],
) -> std::result::Result<Value, ApiError> {
    let votes = state.store.all_votes()?;
    let holders = state.holders.get();
    let multipliers = emission::voter_multipliers(&votes, &holders);
    let emissions = emission::pool_emissions(&votes, &multipliers);
    let scores = emission::normalized_scores(by_miner);

    let prices = match &state.oracle {
        Some(oracle) => {
            let mut symbols: Vec<String> = by_miner
                .iter()
                .flat_map(|miner| miner.positions.iter())
                .flat_map(|position| {
                    [
                        position.token0.symbol.clone(),
                        position.token1.symbol.clone(),
                    ]
                })
                .collect();
            symbols.sort();
            symbols.dedup();
            oracle.usd_prices(&symbols).await.unwrap_or_default()
        }
        None => HashMap::new(),
    };

    let rows: Vec<Value> = by_miner
        .iter()
        .map(|miner| {
            let positions: Vec<Value> = miner
                .positions
                .iter()
                .map(|position| {
                    let (raw0, raw1) = math::token_amounts(
                        position.liquidity,
                        position.tick_lower,
                        position.tick_upper,
                        position.pool.tick,
                    );
                    let amount0 = math::scale_amount(raw0, position.token0.decimals);
                    let amount1 = math::scale_amount(raw1, position.token1.decimals);
                    let usd_value = match (
                        prices.get(&position.token0.symbol),
                        prices.get(&position.token1.symbol),
                    ) {
                        (Some(p0), Some(p1)) => Some(amount0 * p0 + amount1 * p1),
                        _ => None,
                    };
                    let score = scores.get(&position.id).copied().unwrap_or(0.0);
                    let emission_share =
                        score * emissions.get(&position.pool.id).copied().unwrap_or(0.0);
                    json!({
                        "id": position.id,
                        "pool": position.pool.id,
                        "fee_tier": position.pool.fee_tier,
                        "tick_lower": position.tick_lower,
                        "tick_upper": position.tick_upper,
                        "current_tick": position.pool.tick,
                        "liquidity": position.liquidity,
                        "token0": position.token0,
                        "token1": position.token1,
                        "amount0": amount0,
                        "amount1": amount1,
                        "usd_value": usd_value,
                        "score": score,
                        "emission": emission_share,
                    })
                })
                .collect();
            json!({
                "miner": miner.miner,
                "owner": miner.owner,
                "positions": positions,
            })
        })
        .collect();
    Ok(json!({ "miners": rows, "count": rows.len() }))
}

async fn weights(State(state): State<Arc<AppState>>) -> ApiResult {
    let votes = state.store.all_votes()?;
    let holders = state.holders.get();
    let by_miner = state.fetcher.active_positions().await?;
    let mut weights = emission::miner_weights(&votes, &holders, &by_miner);
    // Roster miners without positions report an explicit zero.
    for miner in &state.roster.get().miners {
        weights.entry(miner.clone()).or_insert(0.0);
    }
    let total: f64 = weights.values().sum();
    Ok(ok(json!({ "weights": weights, "total": total })))
}

async fn vote_cooldown(
    State(state): State<Arc<AppState>>,
    Path(voter): Path<String>,
) -> ApiResult {
    let latest = state.store.latest_change(&voter)?;
    let now = Utc::now().timestamp();
    let status = cooldown::status_for(latest.as_ref(), now);
    let resumes_at = latest
        .as_ref()
        .filter(|record| record.cooldown_until > now)
        .and_then(|record| DateTime::from_timestamp(record.cooldown_until, 0))
        .map(|stamp| stamp.to_rfc3339());
    Ok(ok(json!({ "cooldown": status, "resumes_at": resumes_at })))
}

async fn vote_history(
    State(state): State<Arc<AppState>>,
    Path(voter): Path<String>,
) -> ApiResult {
    let history = state.store.vote_history(&voter, HISTORY_LIMIT)?;
    let current = state.store.current_vote(&voter)?;
    let rows: Vec<Value> = history
        .iter()
        .map(|record| {
            json!({
                "old_pools": record.old_pools,
                "new_pools": record.new_pools,
                "change_timestamp": timestamp_rfc3339(record.change_timestamp),
                "cooldown_until": timestamp_rfc3339(record.cooldown_until),
                "change_count": record.change_count,
            })
        })
        .collect();
    Ok(ok(json!({
        "voter": voter,
        "current_vote": current.map(|vote| json!({
            "pools": vote.pools,
            "block_number": vote.block_number,
            "updated_at": vote.updated_at.to_rfc3339(),
        })),
        "history": rows,
    })))
}

fn timestamp_rfc3339(epoch_secs: i64) -> Option<String> {
    DateTime::from_timestamp(epoch_secs, 0).map(|stamp| stamp.to_rfc3339())
}

async fn cors_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return add_cors_headers((StatusCode::NO_CONTENT, "").into_response());
    }
    let response = next.run(req).await;
    add_cors_headers(response)
}

fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("*"),
    );
    response
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ok;

    #[test]
    fn success_envelope_is_injected() {
        let response = ok(json!({ "value": 1 }));
        assert_eq!(response.0["success"], true);
        assert_eq!(response.0["value"], 1);
    }
}
