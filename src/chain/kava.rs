//! Kava executor (bep3 module atomic swaps)

use super::node::{NodeClient, TxMsg};
use super::{
    decode_address, hash_swap_id, ChainExecutor, ChainKind, ExecutorSettings, ExpiryWindow,
    HtltRequest, SwapBatch, SwapId, TxSentStatus,
};
use crate::error::DeputyResult;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const CREATE_SWAP_MSG_TYPE: &str = "bep3/MsgCreateAtomicSwap";
pub const CLAIM_SWAP_MSG_TYPE: &str = "bep3/MsgClaimAtomicSwap";
pub const REFUND_SWAP_MSG_TYPE: &str = "bep3/MsgRefundAtomicSwap";
pub const SEND_MSG_TYPE: &str = "cosmos-sdk/MsgSend";

/// sdk.Coin; amino JSON carries integers as strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCreateAtomicSwap {
    pub from: String,
    pub to: String,
    pub recipient_other_chain: String,
    pub sender_other_chain: String,
    pub random_number_hash: String,
    pub timestamp: String,
    pub amount: Vec<Coin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_span: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_span: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgClaimAtomicSwap {
    pub from: String,
    pub swap_id: String,
    pub random_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRefundAtomicSwap {
    pub from: String,
    pub swap_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSend {
    pub from_address: String,
    pub to_address: String,
    pub amount: Vec<Coin>,
}

/// Swap id as derived by the kava bep3 module, which lowercases the other-chain sender
pub fn calc_swap_id(
    random_number_hash: &[u8; 32],
    sender: &str,
    sender_other_chain: &str,
    address_prefix: &str,
) -> DeputyResult<SwapId> {
    let sender = decode_address(sender, address_prefix)?;
    Ok(hash_swap_id(
        random_number_hash,
        &sender,
        &sender_other_chain.to_lowercase(),
    ))
}

/// Executor for the deputy's account on Kava
pub struct KavaExecutor {
    node: Arc<dyn NodeClient>,
    settings: ExecutorSettings,
}

impl KavaExecutor {
    pub fn new(node: Arc<dyn NodeClient>, settings: ExecutorSettings) -> DeputyResult<Self> {
        settings.validate(node.as_ref())?;
        info!("Kava executor ready for deputy {}", settings.deputy_address);
        Ok(Self { node, settings })
    }

    fn coins(&self, amount: u128) -> Vec<Coin> {
        vec![Coin {
            denom: self.settings.denom.clone(),
            amount: amount.to_string(),
        }]
    }

    fn build_create(&self, request: &HtltRequest) -> DeputyResult<MsgCreateAtomicSwap> {
        decode_address(&request.recipient, &self.settings.address_prefix)?;
        let (height_span, time_span) = match request.expiry {
            ExpiryWindow::Blocks(span) => (Some(span.to_string()), None),
            ExpiryWindow::Seconds(span) => (None, Some(span.to_string())),
        };
        Ok(MsgCreateAtomicSwap {
            from: self.settings.deputy_address.clone(),
            to: request.recipient.clone(),
            recipient_other_chain: request.recipient_other_chain.clone(),
            sender_other_chain: request.sender_other_chain.clone(),
            random_number_hash: hex::encode_upper(request.random_number_hash),
            timestamp: request.timestamp.to_string(),
            amount: self.coins(request.amount),
            height_span,
            time_span,
        })
    }
}

#[async_trait]
impl ChainExecutor for KavaExecutor {
    fn chain(&self) -> ChainKind {
        ChainKind::Kava
    }

    fn deputy_address(&self) -> String {
        self.settings.deputy_address.clone()
    }

    async fn htlt(&self, request: HtltRequest) -> DeputyResult<String> {
        let msg = self.build_create(&request)?;
        let tx_hash = self
            .node
            .broadcast(TxMsg::new(CREATE_SWAP_MSG_TYPE, &msg)?)
            .await?;
        debug!("Atomic swap {} sent to {}", tx_hash, request.recipient);
        Ok(tx_hash)
    }

    async fn claim(&self, swap_id: SwapId, secret: [u8; 32]) -> DeputyResult<String> {
        let msg = MsgClaimAtomicSwap {
            from: self.settings.deputy_address.clone(),
            swap_id: hex::encode_upper(swap_id.as_bytes()),
            random_number: hex::encode_upper(secret),
        };
        self.node
            .broadcast(TxMsg::new(CLAIM_SWAP_MSG_TYPE, &msg)?)
            .await
    }

    async fn refund(&self, swap_id: SwapId) -> DeputyResult<String> {
        let msg = MsgRefundAtomicSwap {
            from: self.settings.deputy_address.clone(),
            swap_id: hex::encode_upper(swap_id.as_bytes()),
        };
        self.node
            .broadcast(TxMsg::new(REFUND_SWAP_MSG_TYPE, &msg)?)
            .await
    }

    async fn get_sent_tx_status(&self, tx_hash: &str) -> DeputyResult<TxSentStatus> {
        self.node.sent_tx_status(tx_hash).await
    }

    fn calc_swap_id(
        &self,
        random_number_hash: &[u8; 32],
        sender: &str,
        sender_other_chain: &str,
    ) -> DeputyResult<SwapId> {
        calc_swap_id(
            random_number_hash,
            sender,
            sender_other_chain,
            &self.settings.address_prefix,
        )
    }

    async fn has_swap(&self, swap_id: SwapId) -> DeputyResult<bool> {
        Ok(self.node.swap(&swap_id).await?.is_some())
    }

    async fn claimable(&self, swap_id: SwapId) -> DeputyResult<bool> {
        Ok(self
            .node
            .swap_at_tip(&swap_id)
            .await?
            .map_or(false, |(swap, tip)| swap.claimable(&tip)))
    }

    async fn refundable(&self, swap_id: SwapId) -> DeputyResult<bool> {
        Ok(self
            .node
            .swap_at_tip(&swap_id)
            .await?
            .map_or(false, |(swap, tip)| swap.refundable(&tip)))
    }

    async fn revealed_secret(&self, swap_id: SwapId) -> DeputyResult<Option<[u8; 32]>> {
        Ok(self.node.swap(&swap_id).await?.and_then(|s| s.random_number))
    }

    async fn open_swaps_to_deputy(&self, from_height: u64) -> DeputyResult<SwapBatch> {
        self.node
            .open_swaps_to(ChainKind::Kava, &self.settings.deputy_address, from_height)
            .await
    }

    async fn get_balance(&self, address: &str) -> DeputyResult<u128> {
        self.node.balance(address, &self.settings.denom).await
    }

    async fn send_amount(&self, address: &str, amount: u128) -> DeputyResult<String> {
        decode_address(address, &self.settings.address_prefix)?;
        let msg = MsgSend {
            from_address: self.settings.deputy_address.clone(),
            to_address: address.to_string(),
            amount: self.coins(amount),
        };
        self.node.broadcast(TxMsg::new(SEND_MSG_TYPE, &msg)?).await
    }
}
