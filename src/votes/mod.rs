pub mod cooldown;
pub mod intake;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

pub const MAX_POOLS_PER_VOTE: usize = 10;
pub const WEIGHT_SCALE: u64 = 10_000;

/// One `(pool, weight)` entry of a normalized vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolWeight {
    pub pool: String,
    pub weight: u64,
}

/// A voter's current vote as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVote {
    pub voter: String,
    pub pools: Vec<PoolWeight>,
    pub signature: String,
    pub message: String,
    pub block_number: u64,
    pub total_weight: u64,
    pub updated_at: DateTime<Utc>,
}

/// One append-only row of the vote-change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteChangeRecord {
    pub voter: String,
    pub old_pools: Vec<PoolWeight>,
    pub new_pools: Vec<PoolWeight>,
    pub change_timestamp: i64,
    pub cooldown_until: i64,
    pub change_count: u32,
}

/// Parse a vote message `"<pools>|<block>"` where pools is
/// `addr,weight(;addr,weight)*`. Addresses are lowercased; weights are the
/// raw submitted values, not yet normalized.
pub fn parse_vote_message(message: &str) -> Result<(Vec<(String, u64)>, u64), ServiceError> {
    let (pools_part, block_part) = message
        .rsplit_once('|')
        .ok_or(ServiceError::InvalidInput)?;
    let block = block_part
        .trim()
        .parse::<u64>()
        .map_err(|_| ServiceError::InvalidInput)?;

    let mut entries = Vec::new();
    for piece in pools_part.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (addr, weight) = piece.split_once(',').ok_or(ServiceError::InvalidInput)?;
        let addr = addr.trim().to_ascii_lowercase();
        if !is_pool_address(&addr) {
            return Err(ServiceError::InvalidInput);
        }
        let weight = weight
            .trim()
            .parse::<u64>()
            .map_err(|_| ServiceError::InvalidInput)?;
        if weight == 0 {
            return Err(ServiceError::InvalidInput);
        }
        if entries.iter().any(|(existing, _)| existing == &addr) {
            return Err(ServiceError::InvalidInput);
        }
        entries.push((addr, weight));
    }
    if entries.is_empty() || entries.len() > MAX_POOLS_PER_VOTE {
        return Err(ServiceError::InvalidInput);
    }
    Ok((entries, block))
}

/// Scale weights so they sum to exactly `WEIGHT_SCALE`, pushing any
/// rounding residue into the last entry.
pub fn normalize_weights(entries: &[(String, u64)]) -> Result<Vec<PoolWeight>, ServiceError> {
    let total: u64 = entries.iter().map(|(_, w)| *w).sum();
    if total == 0 {
        return Err(ServiceError::InvalidInput);
    }
    let mut normalized: Vec<PoolWeight> = entries
        .iter()
        .map(|(pool, weight)| PoolWeight {
            pool: pool.clone(),
            weight: ((*weight as f64) * (WEIGHT_SCALE as f64) / (total as f64)).round() as u64,
        })
        .collect();
    let sum: u64 = normalized.iter().map(|p| p.weight).sum();
    if sum != WEIGHT_SCALE {
        let last = normalized.last_mut().expect("entries is non-empty");
        last.weight = (last.weight as i64 + (WEIGHT_SCALE as i64 - sum as i64)) as u64;
    }
    Ok(normalized)
}

pub fn is_pool_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn pools_json(pools: &[PoolWeight]) -> String {
    serde_json::to_string(pools).unwrap_or_else(|_| "[]".to_string())
}
