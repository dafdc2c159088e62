use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sp_io::hashing::keccak_256;

use crate::chain::post_json;

/// Cached metadata of one Uniswap V3 pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetadata {
    pub address: String,
    pub token0: String,
    pub token1: String,
    pub fee: u32,
    pub liquidity: u128,
    pub symbol0: Option<String>,
    pub symbol1: Option<String>,
}

/// Chain reads needed by vote intake: block height, pool canonicality, pool
/// metadata.
#[async_trait]
pub trait PoolChain: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn is_canonical_pool(&self, pool: &str) -> Result<bool>;
    async fn pool_metadata(&self, pool: &str) -> Result<PoolMetadata>;
}

/// JSON-RPC client against an EVM endpoint.
pub struct EvmRpc {
    url: String,
    factory: String,
}

impl EvmRpc {
    pub fn new(url: impl Into<String>, factory: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            factory: factory.into().to_ascii_lowercase(),
        }
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = post_json(&self.url, &body, None).await?;
        if let Some(error) = response.get("error") {
            return Err(anyhow!("RPC {method} error: {error}"));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("RPC {method} returned no result"))
    }

    async fn eth_call(&self, to: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let result = self
            .rpc_call(
                "eth_call",
                json!([{ "to": to, "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_call returned non-string result"))?;
        hex::decode(raw.trim_start_matches("0x")).map_err(|e| anyhow!("bad eth_call hex: {e}"))
    }
}

#[async_trait]
impl PoolChain for EvmRpc {
    async fn block_number(&self) -> Result<u64> {
        let result = self.rpc_call("eth_blockNumber", json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_blockNumber returned non-string result"))?;
        u64::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|e| anyhow!("bad block number {raw}: {e}"))
    }

    /// A pool is canonical when the factory's `getPool(token0, token1, fee)`
    /// resolves back to the submitted address. Any failure along the
    /// validation sequence reads as non-canonical.
    async fn is_canonical_pool(&self, pool: &str) -> Result<bool> {
        let token0 = match self.call_address(pool, "token0()").await {
            Ok(addr) => addr,
            Err(_) => return Ok(false),
        };
        let token1 = match self.call_address(pool, "token1()").await {
            Ok(addr) => addr,
            Err(_) => return Ok(false),
        };
        let fee = match self.call_u32(pool, "fee()").await {
            Ok(fee) => fee,
            Err(_) => return Ok(false),
        };

        let mut data = selector("getPool(address,address,uint24)").to_vec();
        data.extend_from_slice(&encode_address(&token0)?);
        data.extend_from_slice(&encode_address(&token1)?);
        data.extend_from_slice(&encode_u32(fee));
        let out = match self.eth_call(&self.factory, data).await {
            Ok(out) => out,
            Err(_) => return Ok(false),
        };
        Ok(decode_address(&out)
            .map(|address| address == pool.to_ascii_lowercase())
            .unwrap_or(false))
    }

    async fn pool_metadata(&self, pool: &str) -> Result<PoolMetadata> {
        let token0 = self.call_address(pool, "token0()").await?;
        let token1 = self.call_address(pool, "token1()").await?;
        let fee = self.call_u32(pool, "fee()").await?;
        let liquidity = self.call_u128(pool, "liquidity()").await?;
        let symbol0 = self.call_symbol(&token0).await.ok();
        let symbol1 = self.call_symbol(&token1).await.ok();
        Ok(PoolMetadata {
            address: pool.to_ascii_lowercase(),
            token0,
            token1,
            fee,
            liquidity,
            symbol0,
            symbol1,
        })
    }
}

impl EvmRpc {
    async fn call_address(&self, to: &str, signature: &str) -> Result<String> {
        let out = self.eth_call(to, selector(signature).to_vec()).await?;
        decode_address(&out)
    }

    async fn call_u32(&self, to: &str, signature: &str) -> Result<u32> {
        let out = self.eth_call(to, selector(signature).to_vec()).await?;
        let word = word(&out, 0)?;
        Ok(u32::from_be_bytes(word[28..32].try_into().expect("4 bytes")))
    }

    async fn call_u128(&self, to: &str, signature: &str) -> Result<u128> {
        let out = self.eth_call(to, selector(signature).to_vec()).await?;
        let word = word(&out, 0)?;
        Ok(u128::from_be_bytes(
            word[16..32].try_into().expect("16 bytes"),
        ))
    }

    async fn call_symbol(&self, token: &str) -> Result<String> {
        let out = self.eth_call(token, selector("symbol()").to_vec()).await?;
        decode_string(&out)
    }
}

/// First four bytes of the keccak of the method signature.
fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak_256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn encode_address(address: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(address.trim_start_matches("0x"))
        .map_err(|e| anyhow!("bad address {address}: {e}"))?;
    if bytes.len() != 20 {
        return Err(anyhow!("bad address length: {address}"));
    }
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(&bytes);
    Ok(out)
}

fn encode_u32(value: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[28..].copy_from_slice(&value.to_be_bytes());
    out
}

fn word(data: &[u8], index: usize) -> Result<&[u8]> {
    data.get(index * 32..(index + 1) * 32)
        .ok_or_else(|| anyhow!("eth_call output too short"))
}

fn decode_address(data: &[u8]) -> Result<String> {
    let word = word(data, 0)?;
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

/// ABI string return: offset word, length word, payload. Some legacy tokens
/// return a bytes32 literal instead; fall back to trimming NULs.
fn decode_string(data: &[u8]) -> Result<String> {
    if data.len() >= 64 {
        let length = u64::from_be_bytes(word(data, 1)?[24..32].try_into().expect("8 bytes"));
        let start = 64usize;
        let end = start + length as usize;
        if end <= data.len() {
            return Ok(String::from_utf8_lossy(&data[start..end]).to_string());
        }
    }
    let trimmed: Vec<u8> = data.iter().copied().take_while(|b| *b != 0).collect();
    if trimmed.is_empty() {
        return Err(anyhow!("empty symbol"));
    }
    Ok(String::from_utf8_lossy(&trimmed).to_string())
}

#[cfg(test)]
mod tests {
    use super::{decode_address, decode_string, encode_address, encode_u32, selector};

    #[test]
    fn known_selectors() {
        assert_eq!(selector("token0()"), [0x0d, 0xfe, 0x16, 0x81]);
        assert_eq!(selector("token1()"), [0xd2, 0x12, 0x20, 0xa7]);
        assert_eq!(selector("fee()"), [0xdd, 0xca, 0x3f, 0x43]);
        assert_eq!(selector("symbol()"), [0x95, 0xd8, 0x9b, 0x41]);
        assert_eq!(
            selector("getPool(address,address,uint24)"),
            [0x16, 0x98, 0xee, 0x82]
        );
    }

    #[test]
    fn address_roundtrip() {
        let addr = "0x1f98431c8ad98523631ae4a59f267346ea31f984";
        let encoded = encode_address(addr).expect("encode");
        assert_eq!(decode_address(&encoded).expect("decode"), addr);
    }

    #[test]
    fn fee_encoding_is_right_aligned() {
        let encoded = encode_u32(3000);
        assert_eq!(&encoded[..28], &[0u8; 28]);
        assert_eq!(u32::from_be_bytes(encoded[28..].try_into().unwrap()), 3000);
    }

    #[test]
    fn decodes_dynamic_string() {
        let mut data = vec![0u8; 64];
        data[31] = 0x20;
        data[63] = 4;
        data.extend_from_slice(b"USDC");
        data.extend_from_slice(&[0u8; 28]);
        assert_eq!(decode_string(&data).expect("decode"), "USDC");
    }

    #[test]
    fn decodes_bytes32_symbol() {
        let mut data = b"MKR".to_vec();
        data.extend_from_slice(&[0u8; 29]);
        assert_eq!(decode_string(&data).expect("decode"), "MKR");
    }
}
