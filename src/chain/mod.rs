pub mod holders;
pub mod roster;
pub mod rpc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;

pub use holders::{HolderBalance, HolderSnapshot, HolderSource, HttpHolderSource};
pub use roster::{HttpRosterSource, RosterSnapshot, RosterSource};
pub use rpc::{EvmRpc, PoolChain, PoolMetadata};

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 12;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 6;

pub(crate) static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent("emission-oracle/0.3")
        .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
        .build()
        .expect("failed to build HTTP client")
});

pub async fn fetch_json(url: &str) -> Result<Value> {
    let response = HTTP_CLIENT
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed GET request: {url}"))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("failed reading response body: {url}"))?;
    if !status.is_success() {
        let preview: String = body.chars().take(180).collect();
        return Err(anyhow!("GET {url} returned {status}: {preview}"));
    }
    serde_json::from_str(&body).with_context(|| format!("invalid JSON response: {url}"))
}

pub async fn post_json(url: &str, body: &Value, bearer: Option<&str>) -> Result<Value> {
    let mut request = HTTP_CLIENT.post(url).json(body);
    if let Some(token) = bearer {
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("failed POST request: {url}"))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed reading response body: {url}"))?;
    if !status.is_success() {
        let preview: String = text.chars().take(180).collect();
        return Err(anyhow!("POST {url} returned {status}: {preview}"));
    }
    serde_json::from_str(&text).with_context(|| format!("invalid JSON response: {url}"))
}

/// An atomically replaced snapshot. Writers build a whole new value and
/// swap it in; readers clone the `Arc` and never block each other.
pub struct Shared<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn get(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    pub fn replace(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }
}

#[cfg(test)]
mod tests {
    use super::Shared;

    #[test]
    fn shared_swaps_whole_values() {
        let shared = Shared::new(vec![1, 2, 3]);
        let before = shared.get();
        shared.replace(vec![4]);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*shared.get(), vec![4]);
    }
}
