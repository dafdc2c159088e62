use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::chain::fetch_json;

/// Optional USD enrichment. Never load-bearing for weights; callers treat a
/// failed lookup as "no prices".
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn usd_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>>;
}

pub struct HttpPriceOracle {
    url: String,
}

impl HttpPriceOracle {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn usd_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let joiner = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}symbols={}", self.url, joiner, symbols.join(","));
        let payload = fetch_json(&url).await?;
        Ok(parse_prices(&payload))
    }
}

pub fn parse_prices(payload: &Value) -> HashMap<String, f64> {
    let object = payload
        .get("prices")
        .and_then(Value::as_object)
        .or_else(|| payload.as_object());
    let mut out = HashMap::new();
    if let Some(object) = object {
        for (symbol, value) in object {
            let price = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                Value::Object(inner) => inner.get("usd").and_then(Value::as_f64),
                _ => None,
            };
            if let Some(price) = price {
                out.insert(symbol.clone(), price);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_prices;

    #[test]
    fn parses_flat_and_nested_shapes() {
        let flat = json!({ "WTAO": 412.5, "USDC": "1.0" });
        let prices = parse_prices(&flat);
        assert_eq!(prices["WTAO"], 412.5);
        assert_eq!(prices["USDC"], 1.0);

        let nested = json!({ "prices": { "WTAO": { "usd": 400.0 } } });
        assert_eq!(parse_prices(&nested)["WTAO"], 400.0);
    }
}
