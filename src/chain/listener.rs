//! Polling listener for swaps addressed to the deputy

use super::{ChainExecutor, ChainKind, Swap};
use crate::error::DeputyResult;
use crate::store::TxStore;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Discovers open swaps to the deputy on one chain and routes each to the
/// engine whose destination deputy the swap names as `sender_other_chain`
pub struct SwapListener {
    executor: Arc<dyn ChainExecutor>,
    store: Arc<dyn TxStore>,
    /// (destination deputy address, engine inbox)
    routes: Vec<(String, mpsc::Sender<Swap>)>,
    poll_interval: Duration,
    /// Next height to scan
    next_height: RwLock<u64>,
    shutdown: Arc<RwLock<bool>>,
}

impl SwapListener {
    /// Resume from the saved checkpoint minus `rescan_blocks`, never below `start_height`.
    ///
    /// Rescanning picks up swaps that were mid-relay when the previous run
    /// stopped; engines dedupe through the tx ledger.
    pub async fn new(
        executor: Arc<dyn ChainExecutor>,
        store: Arc<dyn TxStore>,
        poll_interval: Duration,
        start_height: u64,
        rescan_blocks: u64,
        shutdown: Arc<RwLock<bool>>,
    ) -> DeputyResult<Self> {
        let chain = executor.chain();
        let next_height = match store.get_checkpoint(chain).await? {
            Some(checkpoint) => checkpoint.saturating_sub(rescan_blocks).max(start_height),
            None => start_height,
        };
        info!("Listener for {} starts at height {}", chain, next_height);

        Ok(Self {
            executor,
            store,
            routes: Vec::new(),
            poll_interval,
            next_height: RwLock::new(next_height),
            shutdown,
        })
    }

    pub fn chain(&self) -> ChainKind {
        self.executor.chain()
    }

    /// Send swaps naming `dest_deputy` as their other-chain sender to `inbox`
    pub fn route(&mut self, dest_deputy: impl Into<String>, inbox: mpsc::Sender<Swap>) {
        self.routes.push((dest_deputy.into(), inbox));
    }

    pub async fn next_height(&self) -> u64 {
        *self.next_height.read().await
    }

    /// Scan once; returns the number of swaps routed to an engine
    pub async fn poll_once(&self) -> DeputyResult<usize> {
        let chain = self.chain();
        let from_height = *self.next_height.read().await;
        let batch = self.executor.open_swaps_to_deputy(from_height).await?;

        let mut routed = 0;
        for swap in batch.swaps {
            let inbox = self
                .routes
                .iter()
                .find(|(deputy, _)| deputy.eq_ignore_ascii_case(&swap.sender_other_chain));
            match inbox {
                Some((_, inbox)) => {
                    debug!(
                        "Chain {}: swap from {} at height {} routed",
                        chain, swap.sender, swap.height
                    );
                    if inbox.send(swap).await.is_err() {
                        warn!("Chain {}: engine inbox closed", chain);
                    } else {
                        routed += 1;
                    }
                }
                None => debug!(
                    "Chain {}: no route for swap from {} via {}",
                    chain, swap.sender, swap.sender_other_chain
                ),
            }
        }
        crate::metrics::record_swaps_observed(chain, routed);

        if batch.next_height != from_height {
            *self.next_height.write().await = batch.next_height;
            self.store.save_checkpoint(chain, batch.next_height).await?;
            crate::metrics::record_scan_height(chain, batch.next_height);
        }
        Ok(routed)
    }

    /// Main listening loop
    pub async fn listen(&self) -> DeputyResult<()> {
        info!("Listening for swaps on {}", self.chain());
        loop {
            if *self.shutdown.read().await {
                break;
            }
            if let Err(e) = self.poll_once().await {
                // checkpoint not advanced; the range is scanned again
                warn!("Chain {}: swap scan failed: {}", self.chain(), e);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        info!("Listener for {} stopped", self.chain());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Expiry, MockChainExecutor, SwapBatch};
    use crate::store::MemoryTxStore;

    fn swap_via(sender_other_chain: &str, height: u64) -> Swap {
        Swap {
            chain: ChainKind::Bnb,
            random_number_hash: [height as u8; 32],
            timestamp: 1,
            sender: "bnb1user".to_string(),
            sender_other_chain: sender_other_chain.to_string(),
            recipient: "bnb1deputy".to_string(),
            recipient_other_chain: "kava1user".to_string(),
            amount: 10,
            expiry: Expiry::Height(1_000),
            height,
        }
    }

    #[tokio::test]
    async fn routes_by_destination_deputy_and_checkpoints() {
        let mut executor = MockChainExecutor::new();
        executor.expect_chain().return_const(ChainKind::Bnb);
        executor
            .expect_open_swaps_to_deputy()
            .withf(|from| *from == 5)
            .times(1)
            .returning(|_| {
                Ok(SwapBatch {
                    swaps: vec![swap_via("kava1deputy", 6), swap_via("kava1stranger", 7)],
                    next_height: 8,
                })
            });

        let store = Arc::new(MemoryTxStore::new());
        store.save_checkpoint(ChainKind::Bnb, 20).await.unwrap();
        let mut listener = SwapListener::new(
            Arc::new(executor),
            store.clone(),
            Duration::from_secs(1),
            5,
            100,
            Arc::new(RwLock::new(false)),
        )
        .await
        .unwrap();
        // checkpoint 20 minus 100 clamps to the start height
        assert_eq!(listener.next_height().await, 5);

        let (tx, mut rx) = mpsc::channel(8);
        listener.route("KAVA1DEPUTY", tx);

        assert_eq!(listener.poll_once().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().height, 6);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get_checkpoint(ChainKind::Bnb).await.unwrap(), Some(8));
    }
}
