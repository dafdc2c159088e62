use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub subgraph: SubgraphConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_factory")]
    pub factory_address: String,
    #[serde(default = "default_netuid")]
    pub netuid: u16,
    #[serde(default = "default_block_window")]
    pub block_window: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphConfig {
    #[serde(default = "default_subgraph_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub holders_url: String,
    #[serde(default)]
    pub roster_url: String,
    #[serde(default)]
    pub price_oracle_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub csv_snapshots: bool,
    #[serde(default = "default_csv_dir")]
    pub csv_dir: String,
}

impl Config {
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config/emission-oracle/config.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(Self::default_path);
        let mut config = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed reading config: {}", path.display()))?;
            toml::from_str(&data)
                .with_context(|| format!("failed parsing TOML config: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("RPC_URL") {
            self.chain.rpc_url = value;
        }
        if let Ok(value) = std::env::var("FACTORY_ADDRESS") {
            self.chain.factory_address = value;
        }
        if let Ok(value) = std::env::var("NETUID") {
            if let Ok(parsed) = value.parse() {
                self.chain.netuid = parsed;
            }
        }
        if let Ok(value) = std::env::var("SUBGRAPH_URL") {
            self.subgraph.url = value;
        }
        if let Ok(value) = std::env::var("SUBGRAPH_API_KEY") {
            self.subgraph.api_key = value;
        }
        if let Ok(value) = std::env::var("HOLDERS_URL") {
            self.sources.holders_url = value;
        }
        if let Ok(value) = std::env::var("ROSTER_URL") {
            self.sources.roster_url = value;
        }
        if let Ok(value) = std::env::var("PRICE_ORACLE_URL") {
            if !value.trim().is_empty() {
                self.sources.price_oracle_url = Some(value);
            }
        }
        if let Ok(value) = std::env::var("PORT") {
            if let Ok(parsed) = value.parse() {
                self.server.port = parsed;
            }
        }
        if let Ok(value) = std::env::var("DB_PATH") {
            self.storage.db_path = value;
        }
        if let Ok(value) = std::env::var("LOG_CSV") {
            self.logging.csv_snapshots = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            factory_address: default_factory(),
            netuid: default_netuid(),
            block_window: default_block_window(),
        }
    }
}

impl Default for SubgraphConfig {
    fn default() -> Self {
        Self {
            url: default_subgraph_url(),
            api_key: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            csv_snapshots: false,
            csv_dir: default_csv_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_rpc_url() -> String {
    "https://lite.chain.opentensor.ai".to_string()
}

fn default_factory() -> String {
    "0x1f98431c8ad98523631ae4a59f267346ea31f984".to_string()
}

fn default_netuid() -> u16 {
    10
}

fn default_block_window() -> u64 {
    10
}

fn default_subgraph_url() -> String {
    "https://api.thegraph.com/subgraphs/name/uniswap/uniswap-v3".to_string()
}

fn default_db_path() -> String {
    "~/.local/share/emission-oracle/oracle.db".to_string()
}

fn default_csv_dir() -> String {
    "logs".to_string()
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_cover_service_environment() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.chain.block_window, 10);
        assert!(!config.logging.csv_snapshots);
        assert!(config.sources.price_oracle_url.is_none());
    }
}
