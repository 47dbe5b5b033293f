//! Value fetching against an RPC node.
//!
//! A fetch never fails from the caller's point of view: RPC errors, reverts and
//! timeouts all come back as `None`, which the synchronizer merges as "no new data".

use crate::contracts::erc20::{BalanceOfCall, Erc20};
use crate::contracts::i_multicall3::GetEthBalanceCall;
use crate::metrics;
use crate::multicall::{decode_uint, Call, Multicall};
use crate::types::{ResourceId, Scope, SlotKey};
use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::prelude::*;
use futures::future::join_all;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, warn};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[async_trait]
pub trait ValueFetcher: Send + Sync {
    /// Value of `key` as of `block_number`, or `None` on any failure.
    async fn fetch_value(&self, key: SlotKey, block_number: u64) -> Option<U256>;

    /// Batch form; results are in input order.
    async fn fetch_values(&self, keys: &[SlotKey], block_number: u64) -> Vec<Option<U256>> {
        fetch_each(self, keys, block_number).await
    }
}

/// Fetch every key concurrently through `fetch_value`.
pub async fn fetch_each<F>(fetcher: &F, keys: &[SlotKey], block_number: u64) -> Vec<Option<U256>>
where
    F: ValueFetcher + ?Sized,
{
    join_all(keys.iter().map(|key| fetcher.fetch_value(*key, block_number))).await
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub qps_limit: u32,
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub multicall_address: Option<Address>,
    pub multicall_batch_size: usize,
    pub multicall_retries: u32,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            qps_limit: 25,
            max_concurrent: 8,
            timeout: Duration::from_secs(5),
            multicall_address: None,
            multicall_batch_size: 100,
            multicall_retries: 1,
        }
    }
}

/// [`ValueFetcher`] backed by an ethers [`Middleware`] for one scope.
///
/// Native balances use `eth_getBalance`, token balances ERC-20 `balanceOf`. When a
/// Multicall3 address is configured, batches go through `aggregate3` (native
/// balances via `getEthBalance`) and fall back to individual calls if the
/// aggregate itself fails.
pub struct ProviderFetcher<M: Middleware> {
    provider: Arc<M>,
    scope: Scope,
    limiter: Arc<DefaultDirectRateLimiter>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    multicall: Option<Multicall<M>>,
}

impl<M: Middleware + 'static> ProviderFetcher<M> {
    pub fn new(provider: Arc<M>, scope: Scope, config: FetcherConfig) -> anyhow::Result<Self> {
        let quota = Quota::per_second(
            NonZeroU32::new(config.qps_limit).ok_or_else(|| anyhow::anyhow!("QPS must be non-zero"))?,
        );
        let multicall = config.multicall_address.map(|address| {
            Multicall::new(provider.clone(), address, config.multicall_batch_size)
                .with_timeout(config.timeout)
                .with_retries(config.multicall_retries)
        });
        Ok(Self {
            provider,
            scope,
            limiter: Arc::new(RateLimiter::direct(quota)),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            timeout: config.timeout,
            multicall,
        })
    }

    async fn request(&self, key: SlotKey, block: BlockId) -> anyhow::Result<U256> {
        match key.resource {
            ResourceId::Native => Ok(self.provider.get_balance(key.owner, Some(block)).await?),
            ResourceId::Token(token) => {
                let contract = Erc20::new(token, self.provider.clone());
                Ok(contract.balance_of(key.owner).block(block).call().await?)
            }
        }
    }

    fn multicall_call(multicall: &Multicall<M>, key: &SlotKey) -> Call {
        match key.resource {
            ResourceId::Native => Call {
                target: multicall.address(),
                call_data: GetEthBalanceCall { addr: key.owner }.encode().into(),
            },
            ResourceId::Token(token) => Call {
                target: token,
                call_data: BalanceOfCall { owner: key.owner }.encode().into(),
            },
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ValueFetcher for ProviderFetcher<M> {
    async fn fetch_value(&self, key: SlotKey, block_number: u64) -> Option<U256> {
        if key.scope != self.scope {
            warn!("ProviderFetcher for scope {} asked for {}", self.scope, key);
            return None;
        }
        let _permit = self.semaphore.acquire().await.ok()?;
        self.limiter.until_ready().await;

        let block = BlockId::Number(BlockNumber::Number(block_number.into()));
        match tokio::time::timeout(self.timeout, self.request(key, block)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                debug!("ProviderFetcher: {} at block {} failed: {}", key, block_number, e);
                None
            }
            Err(_) => {
                debug!("ProviderFetcher: {} at block {} timed out", key, block_number);
                None
            }
        }
    }

    async fn fetch_values(&self, keys: &[SlotKey], block_number: u64) -> Vec<Option<U256>> {
        let Some(multicall) = &self.multicall else {
            return fetch_each(self, keys, block_number).await;
        };
        if keys.iter().any(|key| key.scope != self.scope) {
            return fetch_each(self, keys, block_number).await;
        }

        let calls = keys.iter().map(|key| Self::multicall_call(multicall, key)).collect();
        let block = BlockId::Number(BlockNumber::Number(block_number.into()));
        let result = {
            let Ok(_permit) = self.semaphore.acquire().await else {
                return vec![None; keys.len()];
            };
            self.limiter.until_ready().await;
            multicall.run(calls, Some(block)).await
        };

        match result {
            Ok(results) => results.iter().map(|data| data.as_ref().and_then(decode_uint)).collect(),
            Err(e) => {
                warn!(
                    "ProviderFetcher: multicall of {} value(s) at block {} failed ({}), fetching individually",
                    keys.len(),
                    block_number,
                    e
                );
                metrics::increment_multicall_fallback();
                fetch_each(self, keys, block_number).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(provider: Provider<MockProvider>) -> ProviderFetcher<Provider<MockProvider>> {
        ProviderFetcher::new(
            Arc::new(provider),
            1,
            FetcherConfig { timeout: Duration::from_millis(500), ..FetcherConfig::default() },
        )
        .unwrap()
    }

    fn native(owner: u64) -> SlotKey {
        SlotKey::new(1, Address::from_low_u64_be(owner), ResourceId::Native)
    }

    #[tokio::test]
    async fn test_native_balance() {
        let (provider, mock) = Provider::mocked();
        mock.push(U256::from(42u64)).unwrap();
        assert_eq!(fetcher(provider).fetch_value(native(1), 100).await, Some(U256::from(42u64)));
    }

    #[tokio::test]
    async fn test_rpc_error_is_none() {
        let (provider, _mock) = Provider::mocked();
        // No queued response: the mock errors
        assert_eq!(fetcher(provider).fetch_value(native(1), 100).await, None);
    }

    #[tokio::test]
    async fn test_wrong_scope_is_none() {
        let (provider, mock) = Provider::mocked();
        mock.push(U256::from(1u64)).unwrap();
        let key = SlotKey::new(5, Address::from_low_u64_be(1), ResourceId::Native);
        assert_eq!(fetcher(provider).fetch_value(key, 100).await, None);
    }

    /// One `aggregate3` answer holding a single successful `uint256`.
    fn aggregate_response(value: u64) -> Bytes {
        ethers::abi::encode(&[ethers::abi::Token::Array(vec![ethers::abi::Token::Tuple(vec![
            ethers::abi::Token::Bool(true),
            ethers::abi::Token::Bytes(U256::from(value).encode()),
        ])])])
        .into()
    }

    fn busy() -> MockResponse {
        MockResponse::Error(JsonRpcError { code: -32005, message: "busy".to_string(), data: None })
    }

    #[tokio::test]
    async fn test_multicall_is_retried_before_fallback() {
        let (provider, mock) = Provider::mocked();
        mock.push_response(busy());
        mock.push::<Bytes, _>(aggregate_response(7)).unwrap();
        let config = FetcherConfig {
            timeout: Duration::from_millis(500),
            multicall_address: Some(Address::from_low_u64_be(0xca11)),
            multicall_retries: 1,
            ..FetcherConfig::default()
        };
        let fetcher = ProviderFetcher::new(Arc::new(provider), 1, config).unwrap();
        assert_eq!(fetcher.fetch_values(&[native(1)], 100).await, vec![Some(U256::from(7u64))]);
    }

    #[tokio::test]
    async fn test_multicall_without_retries_falls_back() {
        let (provider, mock) = Provider::mocked();
        mock.push_response(busy());
        // The single-call fallback gets the aggregate payload, which is not a balance
        mock.push::<Bytes, _>(aggregate_response(7)).unwrap();
        let config = FetcherConfig {
            timeout: Duration::from_millis(500),
            multicall_address: Some(Address::from_low_u64_be(0xca11)),
            multicall_retries: 0,
            ..FetcherConfig::default()
        };
        let fetcher = ProviderFetcher::new(Arc::new(provider), 1, config).unwrap();
        assert_eq!(fetcher.fetch_values(&[native(1)], 100).await, vec![None]);
    }

    #[test]
    fn test_zero_qps_is_rejected() {
        let (provider, _mock) = Provider::mocked();
        let config = FetcherConfig { qps_limit: 0, ..FetcherConfig::default() };
        assert!(ProviderFetcher::new(Arc::new(provider), 1, config).is_err());
    }
}
