use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::chain::fetch_json;

pub const HOLDERS_TTL_SECS: i64 = 60;

const RAO_PER_TOKEN: f64 = 1e9;

/// Alpha/TAO balances of one voter, in raw chain units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HolderBalance {
    pub alpha_raw: u128,
    pub tao_raw: u128,
}

impl HolderBalance {
    pub fn alpha(&self) -> f64 {
        self.alpha_raw as f64 / RAO_PER_TOKEN
    }

    pub fn tao(&self) -> f64 {
        self.tao_raw as f64 / RAO_PER_TOKEN
    }
}

/// In-memory holders snapshot, rebuilt whole on refresh.
#[derive(Debug, Clone)]
pub struct HolderSnapshot {
    pub balances: HashMap<String, HolderBalance>,
    pub updated_at: DateTime<Utc>,
}

impl HolderSnapshot {
    pub fn empty() -> Self {
        Self {
            balances: HashMap::new(),
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn new(balances: HashMap<String, HolderBalance>) -> Self {
        Self {
            balances,
            updated_at: Utc::now(),
        }
    }

    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.updated_at).num_seconds()
    }

    pub fn alpha_of(&self, voter: &str) -> f64 {
        self.balances.get(voter).map(|b| b.alpha()).unwrap_or(0.0)
    }

    pub fn holds_alpha(&self, voter: &str) -> bool {
        self.balances
            .get(voter)
            .is_some_and(|balance| balance.alpha_raw > 0)
    }
}

#[async_trait]
pub trait HolderSource: Send + Sync {
    async fn fetch_holders(&self, netuid: u16) -> Result<HashMap<String, HolderBalance>>;
}

/// Reads the crawler's holders dump over HTTP.
pub struct HttpHolderSource {
    url: String,
}

impl HttpHolderSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl HolderSource for HttpHolderSource {
    async fn fetch_holders(&self, netuid: u16) -> Result<HashMap<String, HolderBalance>> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("holders source URL is not configured"));
        }
        let joiner = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}netuid={}", self.url, joiner, netuid);
        let payload = fetch_json(&url).await?;
        let holders = parse_holders(&payload);
        if holders.is_empty() {
            return Err(anyhow!("holders source returned no entries"));
        }
        Ok(holders)
    }
}

/// Crawler dumps differ slightly between deployments; accept the entries
/// wherever the array lives and whichever balance key is present.
pub fn parse_holders(payload: &Value) -> HashMap<String, HolderBalance> {
    let mut out = HashMap::new();
    for entry in candidate_array(payload, &["holders", "data", "result"]) {
        let Some(object) = entry.as_object() else {
            continue;
        };
        let Some(address) = ["coldkey", "address", "hotkey"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
        else {
            continue;
        };
        let alpha_raw = raw_balance(object, "alpha");
        let tao_raw = raw_balance(object, "tao");
        out.insert(
            address.to_string(),
            HolderBalance { alpha_raw, tao_raw },
        );
    }
    out
}

fn raw_balance(object: &serde_json::Map<String, Value>, name: &str) -> u128 {
    if let Some(value) = object.get(&format!("{name}_raw")) {
        if let Some(parsed) = value_as_u128(value) {
            return parsed;
        }
    }
    if let Some(value) = object.get(name) {
        if let Some(float) = value_as_f64(value) {
            return (float * RAO_PER_TOKEN).max(0.0) as u128;
        }
    }
    0
}

fn value_as_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn candidate_array<'a>(payload: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    if let Some(array) = payload.as_array() {
        return array.iter().collect();
    }
    if let Some(object) = payload.as_object() {
        for key in keys {
            if let Some(array) = object.get(*key).and_then(Value::as_array) {
                return array.iter().collect();
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_holders, HolderSnapshot};

    #[test]
    fn parses_raw_and_float_balances() {
        let payload = json!({
            "holders": [
                { "coldkey": "5Voter1", "alpha_raw": 2_000_000_000u64, "tao_raw": 0 },
                { "address": "5Voter2", "alpha": 1.5, "tao": 3.0 },
                { "coldkey": "5Voter3" }
            ]
        });
        let holders = parse_holders(&payload);
        assert_eq!(holders.len(), 3);
        assert_eq!(holders["5Voter1"].alpha_raw, 2_000_000_000);
        assert_eq!(holders["5Voter2"].alpha_raw, 1_500_000_000);
        assert_eq!(holders["5Voter2"].tao_raw, 3_000_000_000);
        assert_eq!(holders["5Voter3"].alpha_raw, 0);
    }

    #[test]
    fn parses_bare_array() {
        let payload = json!([{ "coldkey": "5Voter1", "alpha_raw": "42" }]);
        let holders = parse_holders(&payload);
        assert_eq!(holders["5Voter1"].alpha_raw, 42);
    }

    #[test]
    fn snapshot_gates_on_alpha() {
        let payload = json!([
            { "coldkey": "5Rich", "alpha_raw": 1u64 },
            { "coldkey": "5Poor", "alpha_raw": 0u64 }
        ]);
        let snapshot = HolderSnapshot::new(parse_holders(&payload));
        assert!(snapshot.holds_alpha("5Rich"));
        assert!(!snapshot.holds_alpha("5Poor"));
        assert!(!snapshot.holds_alpha("5Unknown"));
    }
}
