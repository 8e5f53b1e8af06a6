//! Chain module - per-chain HTLC executors and the types they share
//!
//! This module provides:
//! - The `ChainExecutor` capability set every chain integration implements
//! - Swap identity types and derivation helpers
//! - Executor registry with liveness probing
//! - Polling listener that discovers swaps addressed to the deputy

pub mod bnb;
pub mod gateway;
pub mod kava;
pub mod listener;
pub mod memory;
pub mod node;

pub use bnb::BnbExecutor;
pub use gateway::GatewayNode;
pub use kava::KavaExecutor;
pub use listener::SwapListener;
pub use node::{BlockInfo, NodeClient, OnChainSwap, SwapStatus, TxMsg, TxOutcome};

use crate::error::{DeputyError, DeputyResult};

use async_trait::async_trait;
use bech32::FromBase32;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Chains the deputy knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Bnb,
    Kava,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Bnb => "bnb",
            ChainKind::Kava => "kava",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKind {
    type Err = DeputyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bnb" => Ok(ChainKind::Bnb),
            "kava" => Ok(ChainKind::Kava),
            other => Err(DeputyError::Config(format!("unknown chain kind: {}", other))),
        }
    }
}

/// On-chain identifier of a swap, derived from its commitment and parties
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapId(pub [u8; 32]);

impl SwapId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapId({})", self.to_hex())
    }
}

impl FromStr for SwapId {
    type Err = DeputyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_bytes32(s).map(SwapId)
    }
}

impl Serialize for SwapId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SwapId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a 32-byte value from hex, with or without `0x`
pub fn parse_bytes32(s: &str) -> DeputyResult<[u8; 32]> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed)
        .map_err(|e| DeputyError::Internal(format!("invalid hex {}: {}", s, e)))?;
    bytes
        .try_into()
        .map_err(|_| DeputyError::Internal(format!("expected 32 bytes: {}", s)))
}

/// Send status of a transaction the deputy broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxSentStatus {
    Pending,
    Success,
    Failed,
}

impl TxSentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxSentStatus::Pending => "pending",
            TxSentStatus::Success => "success",
            TxSentStatus::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, TxSentStatus::Pending)
    }
}

impl fmt::Display for TxSentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxSentStatus {
    type Err = DeputyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TxSentStatus::Pending),
            "success" => Ok(TxSentStatus::Success),
            "failed" => Ok(TxSentStatus::Failed),
            other => Err(DeputyError::Internal(format!("unknown tx status: {}", other))),
        }
    }
}

/// Expiry window of a new swap, in the units of the chain it is created on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryWindow {
    Blocks(u64),
    Seconds(u64),
}

/// Absolute expiry of an existing swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expiry {
    Height(u64),
    Time(i64),
}

impl Expiry {
    /// Whether the chain tip has reached this expiry
    pub fn reached(&self, tip: &BlockInfo) -> bool {
        match *self {
            Expiry::Height(height) => tip.height >= height,
            Expiry::Time(time) => tip.time >= time,
        }
    }
}

/// A swap observed on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub chain: ChainKind,
    pub random_number_hash: [u8; 32],
    pub timestamp: i64,
    pub sender: String,
    pub sender_other_chain: String,
    pub recipient: String,
    pub recipient_other_chain: String,
    pub amount: u128,
    pub expiry: Expiry,
    /// Height of the block that created the swap
    pub height: u64,
}

/// Parameters of a new swap created from the deputy's custody address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtltRequest {
    pub random_number_hash: [u8; 32],
    pub timestamp: i64,
    pub expiry: ExpiryWindow,
    pub recipient: String,
    pub sender_other_chain: String,
    pub recipient_other_chain: String,
    pub amount: u128,
}

/// Account and asset an executor acts for
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutorSettings {
    pub deputy_address: String,
    /// Bech32 human-readable prefix of addresses on this chain
    pub address_prefix: String,
    /// Denomination of the swapped asset
    pub denom: String,
}

impl ExecutorSettings {
    /// The node must sign as the deputy, and the deputy address must belong to this chain
    pub(crate) fn validate(&self, node: &dyn NodeClient) -> DeputyResult<()> {
        decode_address(&self.deputy_address, &self.address_prefix)?;
        if node.signer() != self.deputy_address {
            return Err(DeputyError::Config(format!(
                "node signs as {} but deputy address is {}",
                node.signer(),
                self.deputy_address
            )));
        }
        Ok(())
    }
}

/// Open swaps to the deputy found by a scan, and where the next scan starts
#[derive(Debug, Clone, Default)]
pub struct SwapBatch {
    pub swaps: Vec<Swap>,
    pub next_height: u64,
}

/// Primitive on-chain actions against one chain's HTLC implementation.
///
/// Writes only hand a transaction to the network; callers observe the
/// outcome through `get_sent_tx_status`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainExecutor: Send + Sync {
    /// Chain this executor drives
    fn chain(&self) -> ChainKind;

    /// Deputy custody address on this chain
    fn deputy_address(&self) -> String;

    /// Submit a new swap from the deputy's custody address
    async fn htlt(&self, request: HtltRequest) -> DeputyResult<String>;

    /// Submit a claim revealing `secret`
    async fn claim(&self, swap_id: SwapId, secret: [u8; 32]) -> DeputyResult<String>;

    /// Submit a refund of an expired swap
    async fn refund(&self, swap_id: SwapId) -> DeputyResult<String>;

    /// Non-blocking status poll of a previously broadcast transaction
    async fn get_sent_tx_status(&self, tx_hash: &str) -> DeputyResult<TxSentStatus>;

    /// Swap id exactly as this chain derives it
    fn calc_swap_id(
        &self,
        random_number_hash: &[u8; 32],
        sender: &str,
        sender_other_chain: &str,
    ) -> DeputyResult<SwapId>;

    async fn has_swap(&self, swap_id: SwapId) -> DeputyResult<bool>;

    async fn claimable(&self, swap_id: SwapId) -> DeputyResult<bool>;

    async fn refundable(&self, swap_id: SwapId) -> DeputyResult<bool>;

    /// Secret revealed by the claim of `swap_id`, if it has been claimed
    async fn revealed_secret(&self, swap_id: SwapId) -> DeputyResult<Option<[u8; 32]>>;

    /// Open swaps addressed to the deputy created at or after `from_height`,
    /// including expired ones not yet refunded
    async fn open_swaps_to_deputy(&self, from_height: u64) -> DeputyResult<SwapBatch>;

    async fn get_balance(&self, address: &str) -> DeputyResult<u128>;

    /// Plain transfer from the deputy's custody address
    async fn send_amount(&self, address: &str, amount: u128) -> DeputyResult<String>;
}

/// Commitment to a random number: `SHA-256(random_number ‖ timestamp_be)`
pub fn random_number_hash(random_number: &[u8; 32], timestamp: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(random_number);
    hasher.update(timestamp.to_be_bytes());
    hasher.finalize().into()
}

/// `SHA-256(random_number_hash ‖ sender ‖ sender_other_chain)`
pub(crate) fn hash_swap_id(
    random_number_hash: &[u8; 32],
    sender: &[u8],
    sender_other_chain: &str,
) -> SwapId {
    let mut hasher = Sha256::new();
    hasher.update(random_number_hash);
    hasher.update(sender);
    hasher.update(sender_other_chain.as_bytes());
    SwapId(hasher.finalize().into())
}

/// Decode a bech32 account address, checking its human-readable prefix
pub fn decode_address(address: &str, prefix: &str) -> DeputyResult<Vec<u8>> {
    let (hrp, data, _variant) = bech32::decode(address).map_err(|e| DeputyError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    if hrp != prefix {
        return Err(DeputyError::InvalidAddress {
            address: address.to_string(),
            reason: format!("expected prefix {}, got {}", prefix, hrp),
        });
    }
    Vec::<u8>::from_base32(&data).map_err(|e| DeputyError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// Registry of executors for every connected chain
pub struct ChainManager {
    executors: DashMap<ChainKind, Arc<dyn ChainExecutor>>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    /// Register the executor for its chain, replacing any previous one
    pub fn register(&self, executor: Arc<dyn ChainExecutor>) {
        let chain = executor.chain();
        if self.executors.insert(chain, executor).is_some() {
            warn!("Replaced executor for chain {}", chain);
        } else {
            info!("Registered executor for chain {}", chain);
        }
    }

    /// Get executor for a specific chain
    pub fn get(&self, chain: ChainKind) -> DeputyResult<Arc<dyn ChainExecutor>> {
        self.executors
            .get(&chain)
            .map(|e| e.clone())
            .ok_or(DeputyError::ChainNotFound { chain })
    }

    /// Get all connected chains
    pub fn connected_chains(&self) -> Vec<ChainKind> {
        let mut chains: Vec<_> = self.executors.iter().map(|e| *e.key()).collect();
        chains.sort();
        chains
    }

    /// Health check for all chains: a custody balance read must succeed
    pub async fn health_check(&self) -> Vec<(ChainKind, bool)> {
        let executors: Vec<_> = self
            .executors
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let checks = executors.into_iter().map(|(chain, executor)| async move {
            let healthy = match executor.get_balance(&executor.deputy_address()).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Health check failed for chain {}: {}", chain, e);
                    false
                }
            };
            crate::metrics::record_chain_health(chain, healthy);
            (chain, healthy)
        });

        let mut results = futures::future::join_all(checks).await;
        results.sort_by_key(|(chain, _)| *chain);
        results
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_id_round_trips_through_hex() {
        let id = SwapId([0xab; 32]);
        let parsed: SwapId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        let prefixed: SwapId = format!("0x{}", id).parse().unwrap();
        assert_eq!(prefixed, id);
        assert!("abcd".parse::<SwapId>().is_err());
    }

    #[test]
    fn random_number_hash_binds_timestamp() {
        let secret = [7u8; 32];
        let a = random_number_hash(&secret, 1_600_000_000);
        let b = random_number_hash(&secret, 1_600_000_001);
        assert_ne!(a, b);
        assert_eq!(a, random_number_hash(&secret, 1_600_000_000));
    }

    #[test]
    fn decode_address_checks_prefix() {
        let addr = memory::derive_address("kava", "alice").unwrap();
        assert_eq!(decode_address(&addr, "kava").unwrap().len(), 20);
        assert!(matches!(
            decode_address(&addr, "bnb"),
            Err(DeputyError::InvalidAddress { .. })
        ));
        assert!(decode_address("not-an-address", "kava").is_err());
    }

    #[test]
    fn expiry_compares_against_tip() {
        let tip = BlockInfo {
            height: 100,
            time: 5_000,
        };
        assert!(Expiry::Height(100).reached(&tip));
        assert!(!Expiry::Height(101).reached(&tip));
        assert!(Expiry::Time(4_999).reached(&tip));
        assert!(!Expiry::Time(5_001).reached(&tip));
    }

    #[test]
    fn expiry_window_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            expiry: ExpiryWindow,
        }
        let w: Wrapper = toml::from_str("expiry = { blocks = 250 }").unwrap();
        assert_eq!(w.expiry, ExpiryWindow::Blocks(250));
        let w: Wrapper = toml::from_str("expiry = { seconds = 3600 }").unwrap();
        assert_eq!(w.expiry, ExpiryWindow::Seconds(3600));
    }
}
