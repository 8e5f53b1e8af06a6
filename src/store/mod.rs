//! Submitted-transaction ledger
//!
//! Every transaction the deputy broadcasts gets a `TxRecord`. The store
//! guarantees at most one Pending or Success record per `(intent, swap)`
//! key, which is what makes relays safe to re-run after a crash. It also
//! keeps the origin swap of every relay with a mirror in flight, so a
//! restarted deputy resumes relays the listeners no longer rescan.

mod memory;
mod sql;

pub use memory::MemoryTxStore;
pub use sql::SqliteTxStore;

use crate::chain::{ChainKind, Swap, SwapId, TxSentStatus};
use crate::error::{DeputyError, DeputyResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What a submitted transaction was meant to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxIntent {
    Htlt,
    Claim,
    Refund,
    PlainSend,
}

impl TxIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxIntent::Htlt => "htlt",
            TxIntent::Claim => "claim",
            TxIntent::Refund => "refund",
            TxIntent::PlainSend => "plain_send",
        }
    }
}

impl fmt::Display for TxIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxIntent {
    type Err = DeputyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "htlt" => Ok(TxIntent::Htlt),
            "claim" => Ok(TxIntent::Claim),
            "refund" => Ok(TxIntent::Refund),
            "plain_send" => Ok(TxIntent::PlainSend),
            other => Err(DeputyError::Internal(format!("unknown tx intent {}", other))),
        }
    }
}

/// One transaction the deputy itself broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_hash: String,
    pub chain: ChainKind,
    pub intent: TxIntent,
    /// `None` for plain sends
    pub related_swap_id: Option<SwapId>,
    pub submitted_at: DateTime<Utc>,
    pub status: TxSentStatus,
}

impl TxRecord {
    /// Fresh Pending record for a just-broadcast transaction
    pub fn pending(
        tx_hash: impl Into<String>,
        chain: ChainKind,
        intent: TxIntent,
        related_swap_id: Option<SwapId>,
    ) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            chain,
            intent,
            related_swap_id,
            submitted_at: Utc::now(),
            status: TxSentStatus::Pending,
        }
    }

    /// Pending or Success: the record blocks another submission for its key
    pub fn is_active(&self) -> bool {
        self.status != TxSentStatus::Failed
    }
}

/// Record counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxStats {
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
}

/// Forward-only status transitions: Pending -> Success | Failed
pub(crate) fn check_transition(from: TxSentStatus, to: TxSentStatus) -> DeputyResult<()> {
    if from == to || from == TxSentStatus::Pending {
        Ok(())
    } else {
        Err(DeputyError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Durable ledger of submitted transactions
#[async_trait]
pub trait TxStore: Send + Sync {
    /// Insert a record. Rejects with `DuplicateSubmission` while an active
    /// record exists for the same `(intent, related_swap_id)`.
    async fn record(&self, record: &TxRecord) -> DeputyResult<()>;

    /// Move a record forward. Setting the current status again is a no-op.
    async fn update_status(&self, tx_hash: &str, status: TxSentStatus) -> DeputyResult<()>;

    /// Active record for the key if there is one, else the latest failed one
    async fn lookup(&self, intent: TxIntent, swap_id: &SwapId) -> DeputyResult<Option<TxRecord>>;

    async fn get(&self, tx_hash: &str) -> DeputyResult<Option<TxRecord>>;

    /// Every Pending record, oldest first
    async fn pending(&self) -> DeputyResult<Vec<TxRecord>>;

    async fn records_for_swap(&self, swap_id: &SwapId) -> DeputyResult<Vec<TxRecord>>;

    /// First height the listener for `chain` has not scanned yet
    async fn get_checkpoint(&self, chain: ChainKind) -> DeputyResult<Option<u64>>;

    async fn save_checkpoint(&self, chain: ChainKind, next_height: u64) -> DeputyResult<()>;

    /// Remember an origin swap whose mirror the deputy creates or adopts.
    /// Tracking the same origin swap again is a no-op.
    async fn track_relay(&self, origin_swap_id: &SwapId, swap: &Swap) -> DeputyResult<()>;

    /// Mark a tracked relay closed on both legs
    async fn finish_relay(&self, origin_swap_id: &SwapId) -> DeputyResult<()>;

    /// Origin swaps of every unfinished relay, oldest first
    async fn open_relays(&self) -> DeputyResult<Vec<Swap>>;

    async fn stats(&self) -> DeputyResult<TxStats>;

    async fn health_check(&self) -> DeputyResult<()>;
}

type LockKey = (TxIntent, SwapId);

/// Store plus per-key locks so that the lookup-then-submit sequence for one
/// `(intent, swap)` runs one caller at a time within the process
pub struct TxLedger {
    store: Arc<dyn TxStore>,
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl TxLedger {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TxStore> {
        &self.store
    }

    /// Serialize submissions for one key
    pub async fn lock(&self, intent: TxIntent, swap_id: SwapId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry((intent, swap_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entries of a finished swap
    pub fn release(&self, swap_id: &SwapId) {
        self.locks
            .retain(|(_, id), lock| id != swap_id || Arc::strong_count(lock) > 1);
    }
}

impl std::ops::Deref for TxLedger {
    type Target = dyn TxStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn intent_round_trips_through_str() {
        for intent in [
            TxIntent::Htlt,
            TxIntent::Claim,
            TxIntent::Refund,
            TxIntent::PlainSend,
        ] {
            assert_eq!(intent.as_str().parse::<TxIntent>().unwrap(), intent);
        }
        assert!("mint".parse::<TxIntent>().is_err());
    }

    #[test]
    fn transitions_only_move_forward() {
        use TxSentStatus::*;
        assert!(check_transition(Pending, Success).is_ok());
        assert!(check_transition(Pending, Failed).is_ok());
        assert!(check_transition(Success, Success).is_ok());
        assert!(check_transition(Failed, Pending).is_err());
        assert!(check_transition(Success, Failed).is_err());
    }

    #[tokio::test]
    async fn ledger_lock_serializes_same_key() {
        let ledger = Arc::new(TxLedger::new(Arc::new(MemoryTxStore::new())));
        let swap = SwapId([7; 32]);
        let guard = ledger.lock(TxIntent::Htlt, swap).await;

        let other = ledger.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock(TxIntent::Htlt, swap).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // a different key is not blocked
        let _claim = ledger.lock(TxIntent::Claim, swap).await;

        drop(guard);
        waiter.await.unwrap();
    }
}
