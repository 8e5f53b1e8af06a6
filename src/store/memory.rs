//! In-memory transaction store for tests and dry runs

use super::{check_transition, TxIntent, TxRecord, TxStats, TxStore};
use crate::chain::{ChainKind, Swap, SwapId, TxSentStatus};
use crate::error::{DeputyError, DeputyResult};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as submission order
    records: Vec<TxRecord>,
    checkpoints: HashMap<ChainKind, u64>,
    relays: Vec<TrackedRelay>,
}

struct TrackedRelay {
    origin_swap_id: SwapId,
    swap: Swap,
    finished: bool,
}

/// Non-durable `TxStore` with the same key discipline as the SQLite one
#[derive(Default)]
pub struct MemoryTxStore {
    inner: RwLock<Inner>,
}

impl MemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TxStore for MemoryTxStore {
    async fn record(&self, record: &TxRecord) -> DeputyResult<()> {
        let mut inner = self.inner.write().await;
        if inner.records.iter().any(|r| r.tx_hash == record.tx_hash) {
            return Err(DeputyError::Internal(format!(
                "tx {} already recorded",
                record.tx_hash
            )));
        }
        if let Some(swap_id) = record.related_swap_id {
            let active = inner.records.iter().any(|r| {
                r.intent == record.intent && r.related_swap_id == Some(swap_id) && r.is_active()
            });
            if active && record.is_active() {
                return Err(DeputyError::DuplicateSubmission {
                    intent: record.intent,
                    swap_id,
                });
            }
        }
        inner.records.push(record.clone());
        Ok(())
    }

    async fn update_status(&self, tx_hash: &str, status: TxSentStatus) -> DeputyResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.tx_hash == tx_hash)
            .ok_or_else(|| DeputyError::TransactionNotFound {
                tx_hash: tx_hash.to_string(),
            })?;
        check_transition(record.status, status)?;
        record.status = status;
        Ok(())
    }

    async fn lookup(&self, intent: TxIntent, swap_id: &SwapId) -> DeputyResult<Option<TxRecord>> {
        let inner = self.inner.read().await;
        let mut matching = inner
            .records
            .iter()
            .rev()
            .filter(|r| r.intent == intent && r.related_swap_id.as_ref() == Some(swap_id));
        let latest_failed = matching.clone().find(|r| !r.is_active()).cloned();
        Ok(matching.find(|r| r.is_active()).cloned().or(latest_failed))
    }

    async fn get(&self, tx_hash: &str) -> DeputyResult<Option<TxRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.records.iter().find(|r| r.tx_hash == tx_hash).cloned())
    }

    async fn pending(&self) -> DeputyResult<Vec<TxRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.status == TxSentStatus::Pending)
            .cloned()
            .collect())
    }

    async fn records_for_swap(&self, swap_id: &SwapId) -> DeputyResult<Vec<TxRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.related_swap_id.as_ref() == Some(swap_id))
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, chain: ChainKind) -> DeputyResult<Option<u64>> {
        Ok(self.inner.read().await.checkpoints.get(&chain).copied())
    }

    async fn save_checkpoint(&self, chain: ChainKind, next_height: u64) -> DeputyResult<()> {
        self.inner.write().await.checkpoints.insert(chain, next_height);
        Ok(())
    }

    async fn track_relay(&self, origin_swap_id: &SwapId, swap: &Swap) -> DeputyResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.relays.iter().any(|r| &r.origin_swap_id == origin_swap_id) {
            inner.relays.push(TrackedRelay {
                origin_swap_id: *origin_swap_id,
                swap: swap.clone(),
                finished: false,
            });
        }
        Ok(())
    }

    async fn finish_relay(&self, origin_swap_id: &SwapId) -> DeputyResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(relay) = inner
            .relays
            .iter_mut()
            .find(|r| &r.origin_swap_id == origin_swap_id)
        {
            relay.finished = true;
        }
        Ok(())
    }

    async fn open_relays(&self) -> DeputyResult<Vec<Swap>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relays
            .iter()
            .filter(|r| !r.finished)
            .map(|r| r.swap.clone())
            .collect())
    }

    async fn stats(&self) -> DeputyResult<TxStats> {
        let inner = self.inner.read().await;
        let mut stats = TxStats::default();
        for record in &inner.records {
            match record.status {
                TxSentStatus::Pending => stats.pending += 1,
                TxSentStatus::Success => stats.success += 1,
                TxSentStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> DeputyResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_prefers_active_record_over_failed() {
        let store = MemoryTxStore::new();
        let swap = SwapId([9; 32]);
        store
            .record(&TxRecord::pending("T1", ChainKind::Bnb, TxIntent::Claim, Some(swap)))
            .await
            .unwrap();
        store.update_status("T1", TxSentStatus::Failed).await.unwrap();
        store
            .record(&TxRecord::pending("T2", ChainKind::Bnb, TxIntent::Claim, Some(swap)))
            .await
            .unwrap();

        let found = store.lookup(TxIntent::Claim, &swap).await.unwrap().unwrap();
        assert_eq!(found.tx_hash, "T2");
        assert!(store.lookup(TxIntent::Htlt, &swap).await.unwrap().is_none());

        let err = store
            .record(&TxRecord::pending("T3", ChainKind::Bnb, TxIntent::Claim, Some(swap)))
            .await
            .unwrap_err();
        assert!(matches!(err, DeputyError::DuplicateSubmission { .. }));
    }

    #[tokio::test]
    async fn finished_relays_leave_the_open_set() {
        let store = MemoryTxStore::new();
        let swap = |seed: u8| Swap {
            chain: ChainKind::Kava,
            random_number_hash: [seed; 32],
            timestamp: 1_600_000_000,
            sender: "kava1sender".to_string(),
            sender_other_chain: "bnb1deputy".to_string(),
            recipient: "kava1deputy".to_string(),
            recipient_other_chain: "bnb1receiver".to_string(),
            amount: 1_000,
            expiry: crate::chain::Expiry::Height(250),
            height: 1,
        };
        store.track_relay(&SwapId([1; 32]), &swap(1)).await.unwrap();
        store.track_relay(&SwapId([2; 32]), &swap(2)).await.unwrap();
        store.track_relay(&SwapId([1; 32]), &swap(1)).await.unwrap();
        store.finish_relay(&SwapId([1; 32])).await.unwrap();

        assert_eq!(store.open_relays().await.unwrap(), vec![swap(2)]);
    }

    #[tokio::test]
    async fn plain_sends_are_not_keyed() {
        let store = MemoryTxStore::new();
        for hash in ["S1", "S2"] {
            store
                .record(&TxRecord::pending(hash, ChainKind::Kava, TxIntent::PlainSend, None))
                .await
                .unwrap();
        }
        assert_eq!(store.pending().await.unwrap().len(), 2);
        assert_eq!(store.stats().await.unwrap().pending, 2);
    }
}
