use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chain::{PoolChain, RosterSnapshot, Shared};
use crate::crypto;
use crate::error::ServiceError;
use crate::ratelimit::{RateLimiter, CLAIM_LIMIT, IP_LIMIT};
use crate::store::{BindingOutcome, Store};

pub const MAX_CLAIM_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    pub signature: String,
    pub message: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimAccepted {
    pub voter: String,
    pub external: String,
    pub already_existed: bool,
}

/// Binds an EVM account to a registered miner hotkey via dual-signature
/// proof of control.
pub struct AddressClaim {
    store: Arc<Store>,
    chain: Arc<dyn PoolChain>,
    roster: Arc<Shared<RosterSnapshot>>,
    limiter: Arc<RateLimiter>,
    block_window: u64,
}

impl AddressClaim {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn PoolChain>,
        roster: Arc<Shared<RosterSnapshot>>,
        limiter: Arc<RateLimiter>,
        block_window: u64,
    ) -> Self {
        Self {
            store,
            chain,
            roster,
            limiter,
            block_window,
        }
    }

    /// Message layout: `ethSig|ethAddr|voter|block|ethSigner`. The substrate
    /// signature covers the whole message; the EVM signature covers the
    /// inner `ethAddr|voter|block`.
    pub async fn submit(
        &self,
        request: &ClaimRequest,
        client_ip: &str,
    ) -> Result<ClaimAccepted, ServiceError> {
        if request.message.len() > MAX_CLAIM_MESSAGE_LEN || request.address.trim().is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        let voter = request.address.trim();

        self.limiter.check(client_ip, IP_LIMIT)?;
        self.limiter.check(&format!("claim_{voter}"), CLAIM_LIMIT)?;

        crypto::verify_substrate(&request.message, &request.signature, voter)?;

        let fields: Vec<&str> = request.message.split('|').collect();
        let [eth_sig, eth_addr, claimed_voter, block_raw, eth_signer] = fields.as_slice() else {
            return Err(ServiceError::InvalidInput);
        };

        if !eth_addr.eq_ignore_ascii_case(eth_signer) {
            return Err(ServiceError::Auth);
        }
        if *claimed_voter != voter {
            return Err(ServiceError::Auth);
        }
        if !crypto::is_evm_address(&eth_signer.to_ascii_lowercase()) {
            return Err(ServiceError::InvalidInput);
        }

        let block_number: u64 = block_raw.parse().map_err(|_| ServiceError::InvalidInput)?;
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

        if !self.roster.get().contains(voter) {
            return Err(ServiceError::NotRegisteredMiner);
        }

        let inner = format!("{eth_addr}|{claimed_voter}|{block_raw}");
        crypto::verify_evm(&inner, eth_sig, eth_addr)?;

        let external = eth_addr.to_ascii_lowercase();
        let outcome = self.store.upsert_binding(voter, &external)?;
        Ok(ClaimAccepted {
            voter: voter.to_string(),
            external,
            already_existed: outcome == BindingOutcome::AlreadyExists,
        })
    }
}
