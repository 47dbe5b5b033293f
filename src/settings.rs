use crate::fetcher::FetcherConfig;
use crate::persistence::PersistenceConfig;
use crate::resource_id_cache::PairFactory;
use crate::staleness::StalenessPolicy;
use crate::types::conversions::string_to_address;
use crate::types::{Entity, EntityDescriptor, InvalidEntityError, Scope};
use crate::user_store::EntityRegistry;
use config::{Config, ConfigError, File};
use ethers::types::{Address, H256};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    #[serde(default = "default_http_url")]
    pub http_url: String,
    /// Enables `newHeads` subscriptions instead of polling.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_qps_limit")]
    pub qps_limit: u32,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Multicall3 address; batching is disabled when unset.
    #[serde(default)]
    pub multicall_address: Option<String>,
    #[serde(default = "default_multicall_batch_size")]
    pub multicall_batch_size: usize,
    /// Extra attempts per multicall chunk before falling back to single calls.
    #[serde(default = "default_multicall_retries")]
    pub multicall_retries: u32,
    #[serde(default = "default_block_poll_interval_ms")]
    pub block_poll_interval_ms: u64,
}

fn default_http_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_fetch_timeout_ms() -> u64 {
    5000
}
fn default_qps_limit() -> u32 {
    25
}
fn default_max_concurrent_fetches() -> usize {
    8
}
fn default_multicall_batch_size() -> usize {
    100
}
fn default_multicall_retries() -> u32 {
    1
}
fn default_block_poll_interval_ms() -> u64 {
    4000
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: None,
            fetch_timeout_ms: default_fetch_timeout_ms(),
            qps_limit: default_qps_limit(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            multicall_address: None,
            multicall_batch_size: default_multicall_batch_size(),
            multicall_retries: default_multicall_retries(),
            block_poll_interval_ms: default_block_poll_interval_ms(),
        }
    }
}

/// Refresh windows as wall-clock durations, converted to blocks with `block_time_seconds`.
#[derive(Debug, Deserialize, Clone)]
pub struct Staleness {
    #[serde(default = "default_block_time_seconds")]
    pub block_time_seconds: u64,
    #[serde(default = "default_short_seconds")]
    pub short_seconds: u64,
    /// Applies to values known to be zero.
    #[serde(default = "default_long_seconds")]
    pub long_seconds: u64,
    #[serde(default = "default_pair_seconds")]
    pub pair_seconds: u64,
}

fn default_block_time_seconds() -> u64 {
    15
}
fn default_short_seconds() -> u64 {
    120
}
fn default_long_seconds() -> u64 {
    900
}
fn default_pair_seconds() -> u64 {
    300
}

impl Default for Staleness {
    fn default() -> Self {
        Self {
            block_time_seconds: default_block_time_seconds(),
            short_seconds: default_short_seconds(),
            long_seconds: default_long_seconds(),
            pair_seconds: default_pair_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Persistence {
    #[serde(default = "default_persistence_directory")]
    pub directory: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_balances_key")]
    pub balances_key: String,
    #[serde(default = "default_user_key")]
    pub user_key: String,
}

fn default_persistence_directory() -> String {
    "./data".to_string()
}
fn default_debounce_ms() -> u64 {
    1000
}
fn default_balances_key() -> String {
    "balances".to_string()
}
fn default_user_key() -> String {
    "user".to_string()
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            directory: default_persistence_directory(),
            debounce_ms: default_debounce_ms(),
            balances_key: default_balances_key(),
            user_key: default_user_key(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    #[serde(default = "default_scope")]
    pub scope: Scope,
    /// Uniswap V2 style factory used for pair address derivation.
    #[serde(default)]
    pub factory_address: Option<String>,
    #[serde(default)]
    pub init_code_hash: Option<String>,
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
}

fn default_scope() -> Scope {
    1
}
fn default_native_symbol() -> String {
    "ETH".to_string()
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            factory_address: None,
            init_code_hash: None,
            native_symbol: default_native_symbol(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub address: String,
    pub decimals: u8,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Tokens {
    /// Base tokens every known token is paired against.
    #[serde(default)]
    pub bases: Vec<String>,
    #[serde(default)]
    pub defaults: Vec<TokenConfig>,
    #[serde(default)]
    pub pinned_pairs: Vec<[String; 2]>,
    /// Wrapped native token, priced against `stablecoins`.
    #[serde(default)]
    pub wrapped_native: Option<String>,
    #[serde(default)]
    pub stablecoins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub staleness: Staleness,
    #[serde(default)]
    pub persistence: Persistence,
    #[serde(default)]
    pub chain: Chain,
    #[serde(default)]
    pub tokens: Tokens,
}

impl Settings {
    /// Load `Config.toml` from the working directory (optional) plus `SDK_*` overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_string("SDK_RPC_HTTP_URL") {
            self.rpc.http_url = url;
        }
        if let Some(url) = env_string("SDK_RPC_WS_URL") {
            self.rpc.ws_url = Some(url);
        }
        if let Some(address) = env_string("SDK_RPC_MULTICALL_ADDRESS") {
            self.rpc.multicall_address = Some(address);
        }
        if let Some(raw) = env_string("SDK_CHAIN_SCOPE") {
            self.chain.scope = raw
                .parse()
                .map_err(|_| ConfigError::Message(format!("SDK_CHAIN_SCOPE is not a chain id: {}", raw)))?;
        }
        if let Some(directory) = env_string("SDK_PERSISTENCE_DIRECTORY") {
            self.persistence.directory = directory;
        }
        if let Some(raw) = env_string("SDK_TOKENS_BASES") {
            self.tokens.bases = parse_string_list(&raw);
        }
        Ok(())
    }

    pub fn staleness_policy(&self) -> StalenessPolicy {
        StalenessPolicy::from_durations(
            Duration::from_secs(self.staleness.block_time_seconds),
            Duration::from_secs(self.staleness.short_seconds),
            Duration::from_secs(self.staleness.long_seconds),
            Duration::from_secs(self.staleness.pair_seconds),
        )
    }

    pub fn fetcher_config(&self) -> anyhow::Result<FetcherConfig> {
        let multicall_address = self
            .rpc
            .multicall_address
            .as_deref()
            .map(string_to_address)
            .transpose()?;
        Ok(FetcherConfig {
            qps_limit: self.rpc.qps_limit,
            max_concurrent: self.rpc.max_concurrent_fetches,
            timeout: Duration::from_millis(self.rpc.fetch_timeout_ms),
            multicall_address,
            multicall_batch_size: self.rpc.multicall_batch_size,
            multicall_retries: self.rpc.multicall_retries,
        })
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            debounce: Duration::from_millis(self.persistence.debounce_ms),
            balances_key: self.persistence.balances_key.clone(),
            user_key: self.persistence.user_key.clone(),
        }
    }

    /// `None` when no factory is configured; pair tracking is then disabled.
    pub fn pair_factory(&self) -> anyhow::Result<Option<PairFactory>> {
        match (&self.chain.factory_address, &self.chain.init_code_hash) {
            (Some(factory), Some(hash)) => Ok(Some(PairFactory {
                factory: string_to_address(factory)?,
                init_code_hash: H256::from_str(hash.trim())
                    .map_err(|e| anyhow::anyhow!("Invalid init_code_hash {}: {}", hash, e))?,
            })),
            (None, None) => Ok(None),
            _ => Err(anyhow::anyhow!(
                "chain.factory_address and chain.init_code_hash must be set together"
            )),
        }
    }

    /// Default tokens, bases and pinned pairs of the configured scope.
    pub fn entity_registry(&self) -> Result<EntityRegistry, InvalidEntityError> {
        let scope = self.chain.scope;
        let parse = |raw: &String| {
            string_to_address(raw.trim()).map_err(|_| InvalidEntityError::InvalidAddress(raw.clone()))
        };

        let defaults = self
            .tokens
            .defaults
            .iter()
            .map(|token| {
                Entity::try_from(EntityDescriptor {
                    scope,
                    address: token.address.clone(),
                    decimals: token.decimals,
                    symbol: token.symbol.clone(),
                    name: token.name.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let bases = self.tokens.bases.iter().map(parse).collect::<Result<Vec<Address>, _>>()?;
        let pinned = self
            .tokens
            .pinned_pairs
            .iter()
            .map(|[a, b]| Ok((parse(a)?, parse(b)?)))
            .collect::<Result<Vec<_>, InvalidEntityError>>()?;
        let stablecoins = self.tokens.stablecoins.iter().map(parse).collect::<Result<Vec<Address>, _>>()?;

        let mut registry = EntityRegistry::default();
        registry.defaults.insert(scope, defaults);
        registry.bases.insert(scope, bases);
        registry.pinned_pairs.insert(scope, pinned);
        registry.stablecoins.insert(scope, stablecoins);
        if let Some(wrapped) = &self.tokens.wrapped_native {
            registry.wrapped_native.insert(scope, parse(wrapped)?);
        }
        Ok(registry)
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts a JSON array (`["a","b"]`) or a comma separated list.
fn parse_string_list(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    if trimmed.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
            return list;
        }
    }
    trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_config_file() {
        let settings = Settings::from_file("does-not-exist.toml").unwrap();
        assert_eq!(settings.chain.scope, 1);
        assert_eq!(settings.persistence.debounce_ms, 1000);
        let policy = settings.staleness_policy();
        assert_eq!((policy.short_blocks, policy.long_blocks, policy.pair_blocks), (8, 60, 20));
        assert!(settings.pair_factory().unwrap().is_none());
        assert_eq!(settings.fetcher_config().unwrap().multicall_retries, 1);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[rpc]
multicall_retries = 3

[staleness]
block_time_seconds = 2

[chain]
scope = 42161
factory_address = "0xf1D7CC64Fb4452F05c498126312eBE29f30Fbcf9"
init_code_hash = "0x96e8ac4277198ff8b6f785478aa9a39f403cb768dd02cbee326c3e7da348845f"

[tokens]
bases = ["0x82aF49447D8a07e3bd95BD0d56f35241523fBab1"]
pinned_pairs = [["0x82aF49447D8a07e3bd95BD0d56f35241523fBab1", "0xaf88d065e77c8cC2239327C5EDb3A432268e5831"]]
wrapped_native = "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1"
stablecoins = ["0xaf88d065e77c8cC2239327C5EDb3A432268e5831"]

[[tokens.defaults]]
address = "0xaf88d065e77c8cC2239327C5EDb3A432268e5831"
decimals = 6
symbol = "USDC"
"#
        )
        .unwrap();

        let settings = Settings::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.staleness_policy().short_blocks, 60);
        assert!(settings.pair_factory().unwrap().is_some());

        let registry = settings.entity_registry().unwrap();
        assert_eq!(registry.defaults[&42161].len(), 1);
        assert_eq!(registry.bases[&42161].len(), 1);
        assert_eq!(registry.pinned_pairs[&42161].len(), 1);
        assert_eq!(registry.stablecoins[&42161].len(), 1);
        assert_eq!(
            registry.wrapped_native.get(&42161),
            Some(&string_to_address("0x82aF49447D8a07e3bd95BD0d56f35241523fBab1").unwrap())
        );
        assert_eq!(settings.fetcher_config().unwrap().multicall_retries, 3);
    }

    #[test]
    fn test_parse_string_list() {
        assert_eq!(parse_string_list(r#"["0xa","0xb"]"#), vec!["0xa", "0xb"]);
        assert_eq!(parse_string_list("0xa, 0xb"), vec!["0xa", "0xb"]);
        assert!(parse_string_list("  ").is_empty());
    }
}
