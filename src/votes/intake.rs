use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::chain::{HolderSnapshot, PoolChain, Shared};
use crate::crypto;
use crate::error::ServiceError;
use crate::ratelimit::{RateLimiter, IP_LIMIT, VOTE_LIMIT};
use crate::store::{Store, UpsertVote};
use crate::votes::cooldown;
use crate::votes::{
    normalize_weights, parse_vote_message, PoolWeight, VoteChangeRecord, WEIGHT_SCALE,
};

pub const MAX_MESSAGE_LEN: usize = 1024;
pub const MAX_SIGNATURE_LEN: usize = 260;
pub const MAX_ADDRESS_LEN: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct VoteRequest {
    pub signature: String,
    pub message: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteAccepted {
    pub voter: String,
    pub pools: Vec<PoolWeight>,
    pub block_number: u64,
    /// Whether this submission recorded a vote change (and started a
    /// cooldown).
    pub changed: bool,
}

/// Orchestrates one vote submission end to end. Per-voter writes are
/// serialized through a keyed async mutex so the read-check-upsert-record
/// section never interleaves for the same voter.
pub struct VoteIntake {
    store: Arc<Store>,
    chain: Arc<dyn PoolChain>,
    holders: Arc<Shared<HolderSnapshot>>,
    limiter: Arc<RateLimiter>,
    block_window: u64,
    voter_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VoteIntake {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn PoolChain>,
        holders: Arc<Shared<HolderSnapshot>>,
        limiter: Arc<RateLimiter>,
        block_window: u64,
    ) -> Self {
        Self {
            store,
            chain,
            holders,
            limiter,
            block_window,
            voter_locks: DashMap::new(),
        }
    }

    pub async fn submit(
        &self,
        request: &VoteRequest,
        client_ip: &str,
    ) -> Result<VoteAccepted, ServiceError> {
        if request.message.len() > MAX_MESSAGE_LEN
            || request.signature.len() > MAX_SIGNATURE_LEN
            || request.address.len() > MAX_ADDRESS_LEN
            || request.address.trim().is_empty()
        {
            return Err(ServiceError::InvalidInput);
        }
        let voter = request.address.trim();

        self.limiter.check(client_ip, IP_LIMIT)?;
        self.limiter.check(&format!("vote_{voter}"), VOTE_LIMIT)?;

        crypto::verify_substrate(&request.message, &request.signature, voter)?;

        let (entries, block_number) = parse_vote_message(&request.message)?;
        let pools = normalize_weights(&entries)?;

        self.validate_pools(&pools).await?;
        self.cache_missing_metadata(&pools).await?;
        self.check_block_window(block_number).await?;

        if !self.holders.get().holds_alpha(voter) {
            return Err(ServiceError::NotAHolder);
        }

        let lock = self.voter_lock(voter);
        let _guard = lock.lock().await;

        let current = self.store.current_vote(voter)?;
        let has_change = current
            .as_ref()
            .map(|vote| vote.pools != pools)
            .unwrap_or(true);

        // Cooldown reads recover to "no history" so a transient read
        // failure cannot block an otherwise valid vote.
        let latest = match self.store.latest_change(voter) {
            Ok(latest) => latest,
            Err(error) => {
                warn!("cooldown lookup failed for {voter}: {}", error.kind());
                None
            }
        };
        let now = Utc::now().timestamp();
        let decision = cooldown::evaluate(latest.as_ref(), current.is_some(), !has_change, now);
        if !decision.allowed {
            let mut message = decision.message.unwrap_or_else(|| "Vote change cooldown active".to_string());
            if let Some(resume_at) = decision.resume_at {
                if let Some(stamp) = DateTime::from_timestamp(resume_at, 0) {
                    message = format!("{message} (voting resumes at {})", stamp.to_rfc3339());
                }
            }
            return Err(ServiceError::CooldownActive(message));
        }

        let old_pools = current.as_ref().map(|vote| vote.pools.clone());
        let outcome = self.store.upsert_vote(
            voter,
            &pools,
            &request.signature,
            &request.message,
            block_number,
            WEIGHT_SCALE,
        )?;

        let mut changed = false;
        if has_change && matches!(outcome, UpsertVote::Updated { .. }) {
            let record = VoteChangeRecord {
                voter: voter.to_string(),
                old_pools: old_pools.unwrap_or_default(),
                new_pools: pools.clone(),
                change_timestamp: now,
                cooldown_until: now + decision.next_duration_secs,
                change_count: decision.next_change_count,
            };
            match self.store.record_vote_change(&record) {
                Ok(()) => changed = true,
                Err(error) => {
                    // Tolerated: the next change simply computes a smaller
                    // effective count.
                    warn!(
                        "failed recording vote change for {voter}: {}",
                        error.kind()
                    );
                }
            }
        }

        Ok(VoteAccepted {
            voter: voter.to_string(),
            pools,
            block_number,
            changed,
        })
    }

    async fn validate_pools(&self, pools: &[PoolWeight]) -> Result<(), ServiceError> {
        for entry in pools {
            let canonical = self
                .chain
                .is_canonical_pool(&entry.pool)
                .await
                .map_err(|error| {
                    warn!("pool validation RPC failed for {}: {error:#}", entry.pool);
                    ServiceError::Upstream
                })?;
            if !canonical {
                return Err(ServiceError::InvalidPool);
            }
        }
        Ok(())
    }

    async fn cache_missing_metadata(&self, pools: &[PoolWeight]) -> Result<(), ServiceError> {
        for entry in pools {
            if self.store.pool(&entry.pool)?.is_some() {
                continue;
            }
            let metadata = self.chain.pool_metadata(&entry.pool).await.map_err(|error| {
                warn!("pool metadata fetch failed for {}: {error:#}", entry.pool);
                ServiceError::Upstream
            })?;
            self.store.upsert_pool(&metadata)?;
        }
        Ok(())
    }

    async fn check_block_window(&self, block_number: u64) -> Result<(), ServiceError> {
        let current = self.chain.block_number().await.map_err(|error| {
            warn!("block number fetch failed: {error:#}");
            ServiceError::Upstream
        })?;
        if block_number > current {
            return Err(ServiceError::InvalidBlock);
        }
        if block_number + self.block_window < current {
            return Err(ServiceError::StaleBlock);
        }
        Ok(())
    }

    fn voter_lock(&self, voter: &str) -> Arc<Mutex<()>> {
        self.voter_locks
            .entry(voter.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use sp_core::crypto::{Ss58AddressFormat, Ss58Codec};
    use sp_core::{sr25519, Pair};

    use super::*;
    use crate::chain::holders::HolderBalance;
    use crate::chain::{PoolChain, PoolMetadata, Shared};
    use crate::error::ServiceError;
    use crate::store::Store;

    const POOL_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const POOL_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const POOL_C: &str = "0xcccccccccccccccccccccccccccccccccccccccc";
    const BAD_POOL: &str = "0xdddddddddddddddddddddddddddddddddddddddd";
    const CURRENT_BLOCK: u64 = 100;

    struct StubChain;

    #[async_trait]
    impl PoolChain for StubChain {
        async fn block_number(&self) -> Result<u64> {
            Ok(CURRENT_BLOCK)
        }

        async fn is_canonical_pool(&self, pool: &str) -> Result<bool> {
            Ok(pool != BAD_POOL)
        }

        async fn pool_metadata(&self, pool: &str) -> Result<PoolMetadata> {
            Ok(PoolMetadata {
                address: pool.to_string(),
                token0: "0x0000000000000000000000000000000000000001".into(),
                token1: "0x0000000000000000000000000000000000000002".into(),
                fee: 3000,
                liquidity: 1_000,
                symbol0: Some("T0".into()),
                symbol1: Some("T1".into()),
            })
        }
    }

    struct Harness {
        intake: VoteIntake,
        store: Arc<Store>,
        pair: sr25519::Pair,
        address: String,
    }

    fn harness(alpha_raw: u128) -> Harness {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let (pair, _) = sr25519::Pair::generate();
        let address = pair
            .public()
            .to_ss58check_with_version(Ss58AddressFormat::custom(42));
        let mut balances = std::collections::HashMap::new();
        balances.insert(
            address.clone(),
            HolderBalance {
                alpha_raw,
                tao_raw: 0,
            },
        );
        let holders = Arc::new(Shared::new(crate::chain::HolderSnapshot::new(balances)));
        let intake = VoteIntake::new(
            store.clone(),
            Arc::new(StubChain),
            holders,
            Arc::new(RateLimiter::new()),
            10,
        );
        Harness {
            intake,
            store,
            pair,
            address,
        }
    }

    impl Harness {
        fn request(&self, pools: &str, block: u64) -> VoteRequest {
            let message = format!("{pools}|{block}");
            let sig = self.pair.sign(message.as_bytes());
            VoteRequest {
                signature: format!("0x{}", hex::encode(sig.0)),
                message,
                address: self.address.clone(),
            }
        }
    }

    #[tokio::test]
    async fn first_vote_normalizes_and_leaves_no_history() {
        let h = harness(100_000_000_000);
        let request = h.request(&format!("{POOL_A},1;{POOL_B},1"), CURRENT_BLOCK);
        let accepted = h.intake.submit(&request, "1.2.3.4").await.expect("accept");
        assert!(!accepted.changed);
        assert_eq!(accepted.pools[0].weight, 5_000);
        assert_eq!(accepted.pools[1].weight, 5_000);

        let stored = h
            .store
            .current_vote(&h.address)
            .expect("read")
            .expect("some");
        let total: u64 = stored.pools.iter().map(|p| p.weight).sum();
        assert_eq!(total, 10_000);
        assert!(h.store.latest_change(&h.address).expect("read").is_none());
        // Metadata was cached lazily.
        assert!(h.store.pool(POOL_A).expect("read").is_some());
    }

    #[tokio::test]
    async fn change_starts_cooldown_and_blocks_the_next_change() {
        let h = harness(100_000_000_000);
        h.intake
            .submit(&h.request(&format!("{POOL_A},10000"), CURRENT_BLOCK - 2), "ip")
            .await
            .expect("first");

        let accepted = h
            .intake
            .submit(&h.request(&format!("{POOL_B},10000"), CURRENT_BLOCK - 1), "ip")
            .await
            .expect("change");
        assert!(accepted.changed);
        let latest = h
            .store
            .latest_change(&h.address)
            .expect("read")
            .expect("recorded");
        assert_eq!(latest.change_count, 1);
        assert_eq!(
            latest.cooldown_until - latest.change_timestamp,
            cooldown::BASE_COOLDOWN_SECS
        );

        let err = h
            .intake
            .submit(&h.request(&format!("{POOL_C},10000"), CURRENT_BLOCK), "ip")
            .await
            .unwrap_err();
        match err {
            ServiceError::CooldownActive(message) => {
                assert!(message.contains("71 more minutes"), "{message}");
                assert!(message.contains("voting resumes at"), "{message}");
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identical_resubmission_updates_block_only() {
        let h = harness(100_000_000_000);
        h.intake
            .submit(&h.request(&format!("{POOL_A},10000"), CURRENT_BLOCK - 2), "ip")
            .await
            .expect("first");
        let accepted = h
            .intake
            .submit(&h.request(&format!("{POOL_A},10000"), CURRENT_BLOCK - 1), "ip")
            .await
            .expect("resubmit");
        assert!(!accepted.changed);
        let stored = h
            .store
            .current_vote(&h.address)
            .expect("read")
            .expect("some");
        assert_eq!(stored.block_number, CURRENT_BLOCK - 1);
        assert!(h.store.latest_change(&h.address).expect("read").is_none());
    }

    #[tokio::test]
    async fn non_holder_is_rejected_without_writes() {
        let h = harness(0);
        let err = h
            .intake
            .submit(&h.request(&format!("{POOL_A},10000"), CURRENT_BLOCK), "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotAHolder));
        assert!(h.store.current_vote(&h.address).expect("read").is_none());
    }

    #[tokio::test]
    async fn bad_pool_is_rejected_without_writes() {
        let h = harness(100_000_000_000);
        let err = h
            .intake
            .submit(&h.request(&format!("{BAD_POOL},10000"), CURRENT_BLOCK), "ip")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid Uniswap V3 pools");
        assert!(h.store.current_vote(&h.address).expect("read").is_none());
    }

    #[tokio::test]
    async fn block_window_boundaries() {
        let h = harness(100_000_000_000);
        let pools = format!("{POOL_A},10000");

        let err = h
            .intake
            .submit(&h.request(&pools, CURRENT_BLOCK + 1), "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidBlock));

        let err = h
            .intake
            .submit(&h.request(&pools, CURRENT_BLOCK - 11), "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::StaleBlock));

        // Oldest admissible block.
        h.intake
            .submit(&h.request(&pools, CURRENT_BLOCK - 10), "ip")
            .await
            .expect("edge of window");
    }

    #[tokio::test]
    async fn wrong_signature_is_rejected() {
        let h = harness(100_000_000_000);
        let mut request = h.request(&format!("{POOL_A},10000"), CURRENT_BLOCK);
        request.message = format!("{POOL_B},10000|{CURRENT_BLOCK}");
        let err = h.intake.submit(&request, "ip").await.unwrap_err();
        assert!(matches!(err, ServiceError::Auth));
    }

    #[tokio::test]
    async fn vote_rate_limit_applies_per_voter() {
        let h = harness(100_000_000_000);
        let pools = format!("{POOL_A},10000");
        // First submission plus four identical retries exhaust the budget.
        for i in 0..5 {
            let _ = h
                .intake
                .submit(&h.request(&pools, CURRENT_BLOCK - 5 + i), "ip")
                .await
                .expect("within limit");
        }
        let err = h
            .intake
            .submit(&h.request(&pools, CURRENT_BLOCK), "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited));
    }
}
