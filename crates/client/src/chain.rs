//! Views of the blockchain the client depends on.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::*;
use tumbler_primitives::Height;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain backend: {0}")]
    Backend(String),
}

impl ChainError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// A block by height and hash.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: Height,
    pub hash: BlockHash,
}

/// Source of new blocks for the executor.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait ChainOracle: Send + Sync + 'static {
    async fn current_height(&self) -> Result<Height, ChainError>;

    /// Resolves with the best block once its hash differs from `last_seen`.
    ///
    /// Must be cancellation safe.
    async fn wait_for_block_after(&self, last_seen: Option<BlockHash>)
        -> Result<BlockRef, ChainError>;
}

/// Reports the current best block.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait ChainTipSource: Send + Sync + 'static {
    async fn best_block(&self) -> Result<BlockRef, ChainError>;
}

/// Confirmation lookup for arbitrary transactions.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait BlockExplorer: Send + Sync + 'static {
    /// `None` if the transaction is unknown, `Some(0)` if it is unconfirmed.
    async fn confirmations(&self, txid: Txid) -> Result<Option<u32>, ChainError>;
}

/// [`ChainOracle`] that polls a [`ChainTipSource`] at a fixed interval.
#[derive(Debug)]
pub struct PollingChainOracle<S> {
    source: Arc<S>,
    poll_interval: Duration,
}

impl<S: ChainTipSource> PollingChainOracle<S> {
    pub fn new(source: Arc<S>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
        }
    }
}

#[async_trait]
impl<S: ChainTipSource> ChainOracle for PollingChainOracle<S> {
    async fn current_height(&self) -> Result<Height, ChainError> {
        Ok(self.source.best_block().await?.height)
    }

    async fn wait_for_block_after(
        &self,
        last_seen: Option<BlockHash>,
    ) -> Result<BlockRef, ChainError> {
        loop {
            match self.source.best_block().await {
                Ok(tip) if Some(tip.hash) != last_seen => {
                    trace!(height = tip.height, hash = %tip.hash, "new chain tip");
                    return Ok(tip);
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "failed to poll chain tip"),
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bitcoin::hashes::Hash;

    use super::*;

    fn block(height: Height) -> BlockRef {
        BlockRef {
            height,
            hash: BlockHash::from_byte_array([height as u8; 32]),
        }
    }

    #[tokio::test]
    async fn test_polls_until_tip_moves() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut source = MockChainTipSource::new();
        source.expect_best_block().returning(move || {
            // the tip advances on the third poll, after one failed poll
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(block(5)),
                1 => Err(ChainError::backend("timeout")),
                _ => Ok(block(6)),
            }
        });

        let oracle = PollingChainOracle::new(Arc::new(source), Duration::from_millis(1));
        let tip = oracle
            .wait_for_block_after(Some(block(5).hash))
            .await
            .unwrap();
        assert_eq!(tip, block(6));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_wait_returns_current_tip() {
        let mut source = MockChainTipSource::new();
        source.expect_best_block().returning(|| Ok(block(9)));

        let oracle = PollingChainOracle::new(Arc::new(source), Duration::from_secs(60));
        assert_eq!(oracle.wait_for_block_after(None).await.unwrap(), block(9));
        assert_eq!(oracle.current_height().await.unwrap(), 9);
    }
}
