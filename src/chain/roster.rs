use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::chain::fetch_json;
use crate::chain::holders::candidate_array;

pub const ROSTER_TTL_SECS: i64 = 300;

/// Registered miner hotkeys, rebuilt whole on refresh.
#[derive(Debug, Clone)]
pub struct RosterSnapshot {
    pub miners: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl RosterSnapshot {
    pub fn empty() -> Self {
        Self {
            miners: Vec::new(),
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn new(miners: Vec<String>) -> Self {
        Self {
            miners,
            updated_at: Utc::now(),
        }
    }

    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.updated_at).num_seconds()
    }

    pub fn contains(&self, hotkey: &str) -> bool {
        self.miners.iter().any(|m| m == hotkey)
    }
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn fetch_roster(&self, netuid: u16) -> Result<Vec<String>>;
}

/// Reads the registered-neuron list over HTTP.
pub struct HttpRosterSource {
    url: String,
}

impl HttpRosterSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RosterSource for HttpRosterSource {
    async fn fetch_roster(&self, netuid: u16) -> Result<Vec<String>> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("roster source URL is not configured"));
        }
        let joiner = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}netuid={}", self.url, joiner, netuid);
        let payload = fetch_json(&url).await?;
        let miners = parse_roster(&payload);
        if miners.is_empty() {
            return Err(anyhow!("roster source returned no miners"));
        }
        Ok(miners)
    }
}

pub fn parse_roster(payload: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for entry in candidate_array(payload, &["miners", "neurons", "data", "result"]) {
        match entry {
            Value::String(hotkey) => out.push(hotkey.clone()),
            Value::Object(object) => {
                if let Some(hotkey) = ["hotkey", "miner", "address"]
                    .iter()
                    .find_map(|key| object.get(*key).and_then(Value::as_str))
                {
                    out.push(hotkey.to_string());
                }
            }
            _ => {}
        }
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_roster, RosterSnapshot};

    #[test]
    fn parses_strings_and_objects() {
        let plain = json!(["5MinerB", "5MinerA", "5MinerA"]);
        assert_eq!(parse_roster(&plain), vec!["5MinerA", "5MinerB"]);

        let nested = json!({ "neurons": [ { "uid": 0, "hotkey": "5MinerC" } ] });
        assert_eq!(parse_roster(&nested), vec!["5MinerC"]);
    }

    #[test]
    fn membership_check() {
        let roster = RosterSnapshot::new(vec!["5MinerA".to_string()]);
        assert!(roster.contains("5MinerA"));
        assert!(!roster.contains("5MinerB"));
    }
}
