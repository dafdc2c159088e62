use std::collections::{BTreeMap, HashMap};

use crate::chain::HolderSnapshot;
use crate::positions::{MinerPositions, Position};
use crate::votes::{StoredVote, WEIGHT_SCALE};

pub const GAUSSIAN_AMPLITUDE: f64 = 10.0;
pub const LIQUIDITY_SCORE_SCALE: f64 = 1e9;
/// Weights below this are treated as zero before renormalization.
pub const WEIGHT_FLOOR: f64 = 1e-9;

/// Tick standard deviation per fee tier; narrow-fee pools concentrate the
/// reward band around the trading price.
pub fn sigma_for_fee_tier(fee_tier: u32) -> f64 {
    match fee_tier {
        100 => 10.0,
        500 => 50.0,
        3000 => 200.0,
        10_000 => 500.0,
        _ => 200.0,
    }
}

fn gaussian(distance: f64, sigma: f64) -> f64 {
    GAUSSIAN_AMPLITUDE * (-distance * distance / (2.0 * sigma * sigma)).exp()
}

/// Raw score of a position: Simpson's rule over the Gaussian sampled at the
/// range bounds and midpoint, scaled by liquidity. Zero for inactive
/// positions and non-finite inputs.
pub fn position_score(position: &Position) -> f64 {
    if !position.is_active() {
        return 0.0;
    }
    if !position.liquidity.is_finite() {
        return 0.0;
    }
    let sigma = sigma_for_fee_tier(position.pool.fee_tier);
    let tick = position.pool.tick as f64;
    let lower = position.tick_lower as f64;
    let upper = position.tick_upper as f64;
    let mid = (lower + upper) / 2.0;

    let mu = (gaussian((tick - lower).abs(), sigma)
        + 4.0 * gaussian((tick - mid).abs(), sigma)
        + gaussian((tick - upper).abs(), sigma))
        / 6.0;
    let score = mu * position.liquidity / LIQUIDITY_SCORE_SCALE;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Token-weighted multiplier per voter. Voters without alpha are dropped; a
/// single surviving voter gets multiplier 1.
pub fn voter_multipliers(
    votes: &[StoredVote],
    holders: &HolderSnapshot,
) -> HashMap<String, f64> {
    let surviving: Vec<(String, f64)> = votes
        .iter()
        .filter_map(|vote| {
            let alpha = holders.alpha_of(&vote.voter);
            (alpha > 0.0).then(|| (vote.voter.clone(), alpha))
        })
        .collect();
    if surviving.len() == 1 {
        return surviving.into_iter().map(|(voter, _)| (voter, 1.0)).collect();
    }
    let total: f64 = surviving.iter().map(|(_, alpha)| alpha).sum();
    if total <= 0.0 {
        return HashMap::new();
    }
    surviving
        .into_iter()
        .map(|(voter, alpha)| (voter, alpha / total))
        .collect()
}

/// Per-pool emission share: `E[p] = Σ w · μᵥ / 10000` over all votes.
pub fn pool_emissions(
    votes: &[StoredVote],
    multipliers: &HashMap<String, f64>,
) -> HashMap<String, f64> {
    let mut emissions: HashMap<String, f64> = HashMap::new();
    for vote in votes {
        let Some(multiplier) = multipliers.get(&vote.voter) else {
            continue;
        };
        for entry in &vote.pools {
            *emissions.entry(entry.pool.clone()).or_insert(0.0) +=
                entry.weight as f64 * multiplier / WEIGHT_SCALE as f64;
        }
    }
    emissions
}

/// Normalize raw position scores within each pool; positions in a pool with
/// zero total score get 0.
pub fn normalized_scores(by_miner: &[MinerPositions]) -> HashMap<String, f64> {
    let mut pool_totals: HashMap<String, f64> = HashMap::new();
    let mut raw: Vec<(String, String, f64)> = Vec::new();
    for miner in by_miner {
        for position in &miner.positions {
            let score = position_score(position);
            *pool_totals.entry(position.pool.id.clone()).or_insert(0.0) += score;
            raw.push((position.id.clone(), position.pool.id.clone(), score));
        }
    }
    raw.into_iter()
        .map(|(id, pool, score)| {
            let total = pool_totals.get(&pool).copied().unwrap_or(0.0);
            let normalized = if total > 0.0 { score / total } else { 0.0 };
            (id, normalized)
        })
        .collect()
}

/// The final per-miner weight vector: Σ over a miner's active positions of
/// (normalized score × pool emission), floored at 1e-9 and renormalized to
/// sum to 1 when anything survives.
pub fn miner_weights(
    votes: &[StoredVote],
    holders: &HolderSnapshot,
    by_miner: &[MinerPositions],
) -> BTreeMap<String, f64> {
    let multipliers = voter_multipliers(votes, holders);
    let emissions = pool_emissions(votes, &multipliers);
    let scores = normalized_scores(by_miner);

    let mut weights: BTreeMap<String, f64> = BTreeMap::new();
    for miner in by_miner {
        let weight: f64 = miner
            .positions
            .iter()
            .map(|position| {
                scores.get(&position.id).copied().unwrap_or(0.0)
                    * emissions.get(&position.pool.id).copied().unwrap_or(0.0)
            })
            .sum();
        weights.insert(miner.miner.clone(), weight);
    }

    for weight in weights.values_mut() {
        if *weight < WEIGHT_FLOOR {
            *weight = 0.0;
        }
    }
    let total: f64 = weights.values().sum();
    if total > 0.0 {
        for weight in weights.values_mut() {
            *weight /= total;
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;
    use crate::chain::holders::{HolderBalance, HolderSnapshot};
    use crate::positions::{MinerPositions, Position, PositionPool, TokenMeta};
    use crate::votes::{PoolWeight, StoredVote};

    const POOL_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const POOL_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn vote(voter: &str, pools: &[(&str, u64)]) -> StoredVote {
        StoredVote {
            voter: voter.to_string(),
            pools: pools
                .iter()
                .map(|(pool, weight)| PoolWeight {
                    pool: pool.to_string(),
                    weight: *weight,
                })
                .collect(),
            signature: "sig".into(),
            message: "msg".into(),
            block_number: 1,
            total_weight: 10_000,
            updated_at: Utc::now(),
        }
    }

    fn holders(entries: &[(&str, u64)]) -> HolderSnapshot {
        let balances: HashMap<String, HolderBalance> = entries
            .iter()
            .map(|(voter, alpha)| {
                (
                    voter.to_string(),
                    HolderBalance {
                        alpha_raw: *alpha as u128 * 1_000_000_000,
                        tao_raw: 0,
                    },
                )
            })
            .collect();
        HolderSnapshot::new(balances)
    }

    fn pos(id: &str, pool: &str, fee: u32, lower: i32, upper: i32, tick: i32, l: f64) -> Position {
        Position {
            id: id.to_string(),
            owner: "0x1111111111111111111111111111111111111111".into(),
            liquidity: l,
            tick_lower: lower,
            tick_upper: upper,
            pool: PositionPool {
                id: pool.to_string(),
                fee_tier: fee,
                tick,
            },
            token0: TokenMeta {
                symbol: "T0".into(),
                decimals: 18,
            },
            token1: TokenMeta {
                symbol: "T1".into(),
                decimals: 18,
            },
        }
    }

    fn miner(name: &str, positions: Vec<Position>) -> MinerPositions {
        MinerPositions {
            miner: name.to_string(),
            owner: "0x1111111111111111111111111111111111111111".into(),
            positions,
        }
    }

    #[test]
    fn sigma_mapping_and_default() {
        assert_eq!(sigma_for_fee_tier(100), 10.0);
        assert_eq!(sigma_for_fee_tier(500), 50.0);
        assert_eq!(sigma_for_fee_tier(3000), 200.0);
        assert_eq!(sigma_for_fee_tier(10_000), 500.0);
        assert_eq!(sigma_for_fee_tier(1234), 200.0);
    }

    #[test]
    fn score_peaks_when_price_sits_at_the_midpoint() {
        let centered = pos("c", POOL_A, 3000, -100, 100, 0, 1e9);
        let offset = pos("o", POOL_A, 3000, -100, 100, 80, 1e9);
        let centered_score = position_score(&centered);
        let offset_score = position_score(&offset);
        assert!(centered_score > offset_score);
        // Midpoint sample dominates: mu = (2·g(100) + 4·a) / 6 with the
        // amplitude a = 10 and liquidity scale cancelling.
        let g100 = 10.0 * (-(100.0f64 * 100.0) / (2.0 * 200.0 * 200.0)).exp();
        let expected = (2.0 * g100 + 4.0 * 10.0) / 6.0;
        assert!((centered_score - expected).abs() < 1e-9);
    }

    #[test]
    fn score_is_zero_outside_the_range_and_for_bad_inputs() {
        assert_eq!(position_score(&pos("p", POOL_A, 3000, 10, 20, 25, 1e9)), 0.0);
        assert_eq!(position_score(&pos("p", POOL_A, 3000, 10, 20, 10, 1e9)), 0.0);
        assert_eq!(
            position_score(&pos("p", POOL_A, 3000, 10, 20, 15, f64::NAN)),
            0.0
        );
        assert_eq!(
            position_score(&pos("p", POOL_A, 3000, 10, 20, 15, f64::INFINITY)),
            0.0
        );
    }

    #[test]
    fn score_scales_linearly_with_liquidity() {
        let small = position_score(&pos("s", POOL_A, 3000, -50, 50, 0, 1e9));
        let big = position_score(&pos("b", POOL_A, 3000, -50, 50, 0, 2e9));
        assert!((big / small - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_alpha_voters_are_dropped_and_single_survivor_gets_one() {
        let votes = vec![
            vote("rich", &[(POOL_A, 10_000)]),
            vote("broke", &[(POOL_B, 10_000)]),
        ];
        let snapshot = holders(&[("rich", 100), ("broke", 0)]);
        let multipliers = voter_multipliers(&votes, &snapshot);
        assert_eq!(multipliers.len(), 1);
        assert_eq!(multipliers["rich"], 1.0);
    }

    #[test]
    fn emissions_are_alpha_weighted() {
        let votes = vec![
            vote("v1", &[(POOL_A, 10_000)]),
            vote("v2", &[(POOL_B, 10_000)]),
        ];
        let snapshot = holders(&[("v1", 30), ("v2", 70)]);
        let multipliers = voter_multipliers(&votes, &snapshot);
        let emissions = pool_emissions(&votes, &multipliers);
        assert!((emissions[POOL_A] - 0.3).abs() < 1e-12);
        assert!((emissions[POOL_B] - 0.7).abs() < 1e-12);
        let total: f64 = emissions.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn split_votes_split_emission() {
        let votes = vec![vote("v1", &[(POOL_A, 4_000), (POOL_B, 6_000)])];
        let snapshot = holders(&[("v1", 50)]);
        let multipliers = voter_multipliers(&votes, &snapshot);
        let emissions = pool_emissions(&votes, &multipliers);
        assert!((emissions[POOL_A] - 0.4).abs() < 1e-12);
        assert!((emissions[POOL_B] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn scores_normalize_within_each_pool() {
        let by_miner = vec![
            miner("m1", vec![pos("p1", POOL_A, 3000, -100, 100, 0, 1e9)]),
            miner("m2", vec![pos("p2", POOL_A, 3000, -100, 100, 0, 3e9)]),
        ];
        let scores = normalized_scores(&by_miner);
        assert!((scores["p1"] - 0.25).abs() < 1e-9);
        assert!((scores["p2"] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn weight_vector_matches_the_two_holder_scenario() {
        // V1(alpha=30) votes A, V2(alpha=70) votes B; M has the only
        // position, in A. E[A]=0.3, and after renormalization over the
        // single non-zero miner, W[M]=1.
        let votes = vec![
            vote("v1", &[(POOL_A, 10_000)]),
            vote("v2", &[(POOL_B, 10_000)]),
        ];
        let snapshot = holders(&[("v1", 30), ("v2", 70)]);
        let by_miner = vec![miner("m", vec![pos("p", POOL_A, 3000, -100, 100, 0, 1e9)])];
        let weights = miner_weights(&votes, &snapshot, &by_miner);
        assert_eq!(weights.len(), 1);
        assert!((weights["m"] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn weight_vector_sums_to_one_or_zero() {
        let votes = vec![vote("v1", &[(POOL_A, 5_000), (POOL_B, 5_000)])];
        let snapshot = holders(&[("v1", 10)]);
        let by_miner = vec![
            miner("m1", vec![pos("p1", POOL_A, 3000, -100, 100, 0, 1e9)]),
            miner("m2", vec![pos("p2", POOL_B, 500, -50, 50, 0, 2e9)]),
        ];
        let weights = miner_weights(&votes, &snapshot, &by_miner);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(weights.values().all(|w| *w >= 0.0));

        // No active positions anywhere: the vector is all zeros.
        let empty = miner_weights(&votes, &snapshot, &[]);
        assert_eq!(empty.values().sum::<f64>(), 0.0);
    }

    #[test]
    fn relative_weights_follow_pool_emissions() {
        let votes = vec![
            vote("v1", &[(POOL_A, 10_000)]),
            vote("v2", &[(POOL_B, 10_000)]),
        ];
        let snapshot = holders(&[("v1", 25), ("v2", 75)]);
        let by_miner = vec![
            miner("ma", vec![pos("pa", POOL_A, 3000, -100, 100, 0, 1e9)]),
            miner("mb", vec![pos("pb", POOL_B, 3000, -100, 100, 0, 1e9)]),
        ];
        let weights = miner_weights(&votes, &snapshot, &by_miner);
        assert!((weights["ma"] - 0.25).abs() < 1e-9);
        assert!((weights["mb"] - 0.75).abs() < 1e-9);
    }
}
