// BlockStream - shared stream of new-block events
// Many consumers (synchronizers, UI bridges) react to the same block without each
// polling the node.

use crate::metrics;
use crate::types::Scope;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::prelude::*;
use ethers::providers::{Provider, Ws};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A new head on one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBlock {
    pub scope: Scope,
    pub block_number: u64,
}

/// In-process fan-out of [`NewBlock`] events.
#[derive(Clone)]
pub struct BlockStream {
    sender: broadcast::Sender<NewBlock>,
    latest: Arc<DashMap<Scope, u64>>,
}

impl BlockStream {
    /// `capacity`: events buffered per subscriber before the slowest one starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            latest: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewBlock> {
        self.sender.subscribe()
    }

    pub fn latest(&self, scope: Scope) -> Option<u64> {
        self.latest.get(&scope).map(|b| *b)
    }

    /// Publish a block. Numbers not above the last published one for the scope are ignored.
    ///
    /// Returns the number of subscribers reached, or `None` if the block was ignored.
    pub fn publish(&self, scope: Scope, block_number: u64) -> Option<usize> {
        match self.latest.entry(scope) {
            Entry::Occupied(entry) if *entry.get() >= block_number => {
                debug!(
                    "[BlockStream] Ignoring block {} on scope {} (latest {})",
                    block_number,
                    scope,
                    entry.get()
                );
                return None;
            }
            Entry::Occupied(mut entry) => {
                entry.insert(block_number);
            }
            Entry::Vacant(entry) => {
                entry.insert(block_number);
            }
        }

        metrics::increment_blockstream_blocks_published();
        let count = self
            .sender
            .send(NewBlock { scope, block_number })
            .unwrap_or(0);
        metrics::set_blockstream_active_subscribers(count as f64);
        if count == 0 {
            debug!("[BlockStream] Published block {} on scope {} with no subscribers", block_number, scope);
        } else {
            debug!(
                "[BlockStream] Published block {} on scope {} to {} subscriber(s)",
                block_number, scope, count
            );
        }
        Some(count)
    }

    pub fn subscriber_count(&self) -> usize {
        let count = self.sender.receiver_count();
        metrics::set_blockstream_active_subscribers(count as f64);
        count
    }

    /// Run `callback` for every block published from now on, until the subscription is dropped.
    pub fn on_new_block<F>(&self, mut callback: F) -> BlockSubscription
    where
        F: FnMut(NewBlock) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(block) => callback(block),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Only the newest block matters; skipped ones are superseded
                        warn!("[BlockStream] Subscriber lagged, skipped {} block(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        BlockSubscription { task: Some(task) }
    }

    /// Poll `eth_blockNumber` every `interval` and publish new heads.
    pub fn spawn_poller<M>(&self, provider: Arc<M>, scope: Scope, interval: Duration) -> JoinHandle<()>
    where
        M: Middleware + 'static,
    {
        let stream = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("[BlockStream] Polling scope {} every {:?}", scope, interval);
            loop {
                ticker.tick().await;
                match provider.get_block_number().await {
                    Ok(number) => {
                        stream.publish(scope, number.as_u64());
                    }
                    Err(e) => warn!("[BlockStream] eth_blockNumber failed on scope {}: {}", scope, e),
                }
            }
        })
    }

    /// Subscribe to `newHeads` over WebSocket, reconnecting with exponential backoff.
    pub fn spawn_ws_listener(&self, ws_url: String, scope: Scope) -> JoinHandle<()> {
        let stream = self.clone();
        tokio::spawn(async move {
            let mut reconnect_delay = Duration::from_secs(1);
            let max_reconnect_delay = Duration::from_secs(60);
            loop {
                match stream.listen_ws(&ws_url, scope).await {
                    Ok(()) => {
                        warn!("[BlockStream] newHeads stream for scope {} ended, reconnecting", scope);
                        reconnect_delay = Duration::from_secs(1);
                    }
                    Err(e) => {
                        error!(
                            "[BlockStream] WebSocket error on scope {}: {}. Reconnecting in {:?}",
                            scope, e, reconnect_delay
                        );
                    }
                }
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
            }
        })
    }

    async fn listen_ws(&self, ws_url: &str, scope: Scope) -> Result<(), BlockStreamError> {
        let provider = Provider::<Ws>::connect(ws_url)
            .await
            .map_err(|e| BlockStreamError::Connect(e.to_string()))?;
        let mut heads = provider
            .subscribe_blocks()
            .await
            .map_err(|e| BlockStreamError::Connect(e.to_string()))?;
        info!("[BlockStream] Subscribed to newHeads on scope {}", scope);

        while let Some(block) = heads.next().await {
            match block.number {
                Some(number) => {
                    self.publish(scope, number.as_u64());
                }
                None => warn!("[BlockStream] {}", BlockStreamError::InvalidBlock("head without number")),
            }
        }
        Ok(())
    }
}

/// Stops delivery to its callback when dropped.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct BlockSubscription {
    task: Option<JoinHandle<()>>,
}

impl BlockSubscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlockStreamError {
    #[error("Block is invalid: {0}")]
    InvalidBlock(&'static str),
    #[error("Connection failed: {0}")]
    Connect(String),
}
