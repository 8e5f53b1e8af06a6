//! Boundary to the node/signing collaborator of a chain
//!
//! A `NodeClient` owns the key of one account and the connection to one
//! chain. It signs, sequences and broadcasts messages built by an executor,
//! and answers the handful of reads executors need.

use super::{ChainKind, Expiry, Swap, SwapBatch, SwapId, TxSentStatus};
use crate::error::DeputyResult;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Chain message in its amino-JSON shape: a type tag and a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxMsg {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

impl TxMsg {
    pub fn new<T: Serialize>(kind: &str, value: &T) -> DeputyResult<Self> {
        Ok(Self {
            kind: kind.to_string(),
            value: serde_json::to_value(value)?,
        })
    }
}

/// Result of an included transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum TxOutcome {
    Success,
    Failed { log: String },
}

/// Chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    /// Unix seconds
    pub time: i64,
}

/// Stored status of a swap. "Expired" is derived: open past its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapStatus {
    Open,
    Claimed,
    Refunded,
}

/// Swap record as stored by the chain's HTLC module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainSwap {
    pub id: SwapId,
    pub sender: String,
    pub recipient: String,
    pub sender_other_chain: String,
    pub recipient_other_chain: String,
    #[serde(with = "hex_bytes32")]
    pub random_number_hash: [u8; 32],
    pub timestamp: i64,
    pub amount: u128,
    pub denom: String,
    pub expiry: Expiry,
    pub created_height: u64,
    pub status: SwapStatus,
    /// Random number revealed by the claim
    #[serde(default, with = "hex_bytes32_opt")]
    pub random_number: Option<[u8; 32]>,
}

impl OnChainSwap {
    pub fn claimable(&self, tip: &BlockInfo) -> bool {
        self.status == SwapStatus::Open && !self.expiry.reached(tip)
    }

    pub fn refundable(&self, tip: &BlockInfo) -> bool {
        self.status == SwapStatus::Open && self.expiry.reached(tip)
    }

    pub fn observed_on(&self, chain: ChainKind) -> Swap {
        Swap {
            chain,
            random_number_hash: self.random_number_hash,
            timestamp: self.timestamp,
            sender: self.sender.clone(),
            sender_other_chain: self.sender_other_chain.clone(),
            recipient: self.recipient.clone(),
            recipient_other_chain: self.recipient_other_chain.clone(),
            amount: self.amount,
            expiry: self.expiry,
            height: self.created_height,
        }
    }
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Account that signs everything this client broadcasts
    fn signer(&self) -> &str;

    /// Sign, sequence and broadcast. Errors mean nothing reached the network.
    async fn broadcast(&self, msg: TxMsg) -> DeputyResult<String>;

    /// Outcome of a broadcast transaction, `None` while not yet included
    async fn tx_outcome(&self, tx_hash: &str) -> DeputyResult<Option<TxOutcome>>;

    async fn swap(&self, swap_id: &SwapId) -> DeputyResult<Option<OnChainSwap>>;

    /// Swaps to `recipient` created in `[from_height, to_height]`
    async fn swaps_to(
        &self,
        recipient: &str,
        from_height: u64,
        to_height: u64,
    ) -> DeputyResult<Vec<OnChainSwap>>;

    async fn latest_block(&self) -> DeputyResult<BlockInfo>;

    async fn balance(&self, address: &str, denom: &str) -> DeputyResult<u128>;
}

impl dyn NodeClient {
    /// Swap record together with the tip it was read against
    pub async fn swap_at_tip(
        &self,
        swap_id: &SwapId,
    ) -> DeputyResult<Option<(OnChainSwap, BlockInfo)>> {
        let tip = self.latest_block().await?;
        Ok(self.swap(swap_id).await?.map(|swap| (swap, tip)))
    }

    pub async fn sent_tx_status(&self, tx_hash: &str) -> DeputyResult<TxSentStatus> {
        Ok(match self.tx_outcome(tx_hash).await? {
            None => TxSentStatus::Pending,
            Some(TxOutcome::Success) => TxSentStatus::Success,
            Some(TxOutcome::Failed { .. }) => TxSentStatus::Failed,
        })
    }

    /// Open swaps (claimable or expired) to `recipient` created from `from_height` up to the tip
    pub async fn open_swaps_to(
        &self,
        chain: ChainKind,
        recipient: &str,
        from_height: u64,
    ) -> DeputyResult<SwapBatch> {
        let tip = self.latest_block().await?;
        if from_height > tip.height {
            return Ok(SwapBatch {
                swaps: Vec::new(),
                next_height: from_height,
            });
        }
        let swaps = self
            .swaps_to(recipient, from_height, tip.height)
            .await?
            .into_iter()
            .filter(|s| s.status == SwapStatus::Open)
            .map(|s| s.observed_on(chain))
            .collect();
        Ok(SwapBatch {
            swaps,
            next_height: tip.height + 1,
        })
    }
}

mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::chain::parse_bytes32(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes32_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<[u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; 32]>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| crate::chain::parse_bytes32(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
