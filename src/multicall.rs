use crate::metrics;
pub use anyhow::Result;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

const MAX_BATCH_SIZE: usize = 200;

/// A single view call to be batched in a multicall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    pub target: Address,
    pub call_data: Bytes,
}

/// Multicall3 `aggregate3` executor.
///
/// Every call is sent with `allowFailure = true`, so one reverting call (a token
/// without `balanceOf`, a self-destructed contract) only turns its own result into
/// `None` instead of failing the whole batch. Identical calls are coalesced before
/// sending and fanned back out in the original order.
///
/// ```rust,ignore
/// let multicall = Multicall::new(provider, multicall_address, 100);
/// let results = multicall.run(calls, Some(block.into())).await?;
/// ```
#[derive(Clone)]
pub struct Multicall<M: Middleware> {
    pub provider: Arc<M>,
    multicall_address: Address,
    batch_size: usize,
    timeout: Duration,
    max_retries: u32,
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address, batch_size: usize) -> Self {
        if batch_size > MAX_BATCH_SIZE {
            warn!(
                "Multicall batch size {} exceeds recommended maximum ({}), capping",
                batch_size, MAX_BATCH_SIZE
            );
        }
        Self {
            provider,
            multicall_address,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            timeout: Duration::from_secs(3),
            max_retries: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn address(&self) -> Address {
        self.multicall_address
    }

    /// Runs a batch of calls, optionally at a specific block.
    ///
    /// `Ok` carries one entry per input call: `Some(return_data)` if that call
    /// succeeded, `None` if it reverted. `Err` means the aggregate itself failed.
    pub async fn run(&self, calls: Vec<Call>, block: Option<BlockId>) -> Result<Vec<Option<Bytes>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let mut unique_calls = indexmap::IndexSet::new();
        let original_indices: Vec<usize> = calls
            .iter()
            .map(|call| unique_calls.insert_full(call.clone()).0)
            .collect();
        let unique_calls: Vec<Call> = unique_calls.into_iter().collect();
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_calls.len()
        );

        let mut unique_results: Vec<Option<Bytes>> = Vec::with_capacity(unique_calls.len());
        for chunk in unique_calls.chunks(self.batch_size) {
            metrics::record_multicall_batch_size(chunk.len() as f64);
            let results = self.execute_with_retries(chunk, block).await?;
            if results.len() != chunk.len() {
                return Err(anyhow::anyhow!(
                    "Multicall returned {} results for {} calls",
                    results.len(),
                    chunk.len()
                ));
            }
            unique_results.extend(results);
        }

        Ok(original_indices
            .into_iter()
            .map(|index| unique_results[index].clone())
            .collect())
    }

    async fn execute_with_retries(&self, calls: &[Call], block: Option<BlockId>) -> Result<Vec<Option<Bytes>>> {
        let mut attempt = 0;
        loop {
            match self.execute_multicall3(calls, block).await {
                Ok(results) => return Ok(results),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!("Multicall attempt {} failed: {}, retrying", attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(deprecated)]
    fn aggregate3() -> Function {
        Function {
            name: "aggregate3".to_string(),
            inputs: vec![Param {
                name: "calls".to_string(),
                kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                    ParamType::Address,
                    ParamType::Bool,
                    ParamType::Bytes,
                ]))),
                internal_type: None,
            }],
            outputs: vec![Param {
                name: "returnData".to_string(),
                kind: Self::result_type(),
                internal_type: None,
            }],
            constant: None,
            state_mutability: StateMutability::Payable,
        }
    }

    fn result_type() -> ParamType {
        ParamType::Array(Box::new(ParamType::Tuple(vec![ParamType::Bool, ParamType::Bytes])))
    }

    async fn execute_multicall3(&self, calls: &[Call], block: Option<BlockId>) -> Result<Vec<Option<Bytes>>> {
        // Call3: (address target, bool allowFailure, bytes callData)
        let call_tokens = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();
        let calldata = Self::aggregate3().encode_input(&[Token::Array(call_tokens)])?;

        let tx: ethers::types::transaction::eip2718::TypedTransaction = TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata)
            .into();
        let response = tokio::time::timeout(self.timeout, self.provider.call(&tx, block))
            .await
            .map_err(|_| anyhow::anyhow!("Multicall timed out after {:?}", self.timeout))?
            .map_err(|e| anyhow::anyhow!("Multicall aggregate3 failed: {}", e))?;

        let decoded = ethers::abi::decode(&[Self::result_type()], &response)?;
        let results = decoded
            .into_iter()
            .next()
            .and_then(|t| t.into_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid multicall response format"))?;

        // Result: (bool success, bytes returnData)
        Ok(results
            .into_iter()
            .map(|token| match token {
                Token::Tuple(fields) => match fields.as_slice() {
                    [Token::Bool(true), Token::Bytes(data)] => Some(Bytes::from(data.clone())),
                    _ => None,
                },
                _ => None,
            })
            .collect())
    }
}

/// Decode a single `uint256` return value.
pub fn decode_uint(data: &Bytes) -> Option<U256> {
    ethers::abi::decode(&[ParamType::Uint(256)], data)
        .ok()?
        .into_iter()
        .next()?
        .into_uint()
}
