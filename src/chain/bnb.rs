//! Binance Chain executor (BEP3 hash timer locked transfers)

use super::node::{NodeClient, TxMsg};
use super::{
    decode_address, hash_swap_id, ChainExecutor, ChainKind, ExecutorSettings, ExpiryWindow,
    HtltRequest, SwapBatch, SwapId, TxSentStatus,
};
use crate::error::{DeputyError, DeputyResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const HTLT_MSG_TYPE: &str = "tokens/HTLTMsg";
pub const CLAIM_HTLT_MSG_TYPE: &str = "tokens/ClaimHTLTMsg";
pub const REFUND_HTLT_MSG_TYPE: &str = "tokens/RefundHTLTMsg";
pub const SEND_MSG_TYPE: &str = "cosmos-sdk/Send";

/// Height span bounds enforced by BEP3
pub const MIN_HEIGHT_SPAN: u64 = 360;
pub const MAX_HEIGHT_SPAN: u64 = 518_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtltMsg {
    pub from: String,
    pub to: String,
    pub recipient_other_chain: String,
    pub sender_other_chain: String,
    pub random_number_hash: String,
    pub timestamp: i64,
    pub amount: Vec<Coin>,
    pub expected_income: String,
    pub height_span: i64,
    pub cross_chain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimHtltMsg {
    pub from: String,
    pub swap_id: String,
    pub random_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundHtltMsg {
    pub from: String,
    pub swap_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEntry {
    pub address: String,
    pub coins: Vec<Coin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMsg {
    pub inputs: Vec<SendEntry>,
    pub outputs: Vec<SendEntry>,
}

/// Swap id as derived by the BEP3 module: the other-chain sender is hashed verbatim
pub fn calc_swap_id(
    random_number_hash: &[u8; 32],
    sender: &str,
    sender_other_chain: &str,
    address_prefix: &str,
) -> DeputyResult<SwapId> {
    let sender = decode_address(sender, address_prefix)?;
    Ok(hash_swap_id(random_number_hash, &sender, sender_other_chain))
}

/// Executor for the deputy's account on Binance Chain
pub struct BnbExecutor {
    node: Arc<dyn NodeClient>,
    settings: ExecutorSettings,
}

impl BnbExecutor {
    pub fn new(node: Arc<dyn NodeClient>, settings: ExecutorSettings) -> DeputyResult<Self> {
        settings.validate(node.as_ref())?;
        info!(
            "Binance Chain executor ready for deputy {}",
            settings.deputy_address
        );
        Ok(Self { node, settings })
    }

    fn coins(&self, amount: u128) -> DeputyResult<Vec<Coin>> {
        let amount = i64::try_from(amount).map_err(|_| DeputyError::Submission {
            chain: ChainKind::Bnb,
            message: format!("amount {} exceeds int64", amount),
        })?;
        Ok(vec![Coin {
            denom: self.settings.denom.clone(),
            amount,
        }])
    }

    fn height_span(&self, window: ExpiryWindow) -> DeputyResult<i64> {
        match window {
            ExpiryWindow::Blocks(span) if (MIN_HEIGHT_SPAN..=MAX_HEIGHT_SPAN).contains(&span) => {
                Ok(span as i64)
            }
            ExpiryWindow::Blocks(span) => Err(DeputyError::Submission {
                chain: ChainKind::Bnb,
                message: format!(
                    "height span {} outside [{}, {}]",
                    span, MIN_HEIGHT_SPAN, MAX_HEIGHT_SPAN
                ),
            }),
            ExpiryWindow::Seconds(_) => Err(DeputyError::Submission {
                chain: ChainKind::Bnb,
                message: "swaps on binance chain expire by height".to_string(),
            }),
        }
    }

    fn build_htlt(&self, request: &HtltRequest) -> DeputyResult<HtltMsg> {
        decode_address(&request.recipient, &self.settings.address_prefix)?;
        Ok(HtltMsg {
            from: self.settings.deputy_address.clone(),
            to: request.recipient.clone(),
            recipient_other_chain: request.recipient_other_chain.clone(),
            sender_other_chain: request.sender_other_chain.clone(),
            random_number_hash: hex::encode(request.random_number_hash),
            timestamp: request.timestamp,
            amount: self.coins(request.amount)?,
            expected_income: format!("{}:{}", request.amount, self.settings.denom),
            height_span: self.height_span(request.expiry)?,
            cross_chain: true,
        })
    }
}

#[async_trait]
impl ChainExecutor for BnbExecutor {
    fn chain(&self) -> ChainKind {
        ChainKind::Bnb
    }

    fn deputy_address(&self) -> String {
        self.settings.deputy_address.clone()
    }

    async fn htlt(&self, request: HtltRequest) -> DeputyResult<String> {
        let msg = self.build_htlt(&request)?;
        let tx_hash = self.node.broadcast(TxMsg::new(HTLT_MSG_TYPE, &msg)?).await?;
        debug!("HTLT {} sent to {}", tx_hash, request.recipient);
        Ok(tx_hash)
    }

    async fn claim(&self, swap_id: SwapId, secret: [u8; 32]) -> DeputyResult<String> {
        let msg = ClaimHtltMsg {
            from: self.settings.deputy_address.clone(),
            swap_id: swap_id.to_hex(),
            random_number: hex::encode(secret),
        };
        self.node
            .broadcast(TxMsg::new(CLAIM_HTLT_MSG_TYPE, &msg)?)
            .await
    }

    async fn refund(&self, swap_id: SwapId) -> DeputyResult<String> {
        let msg = RefundHtltMsg {
            from: self.settings.deputy_address.clone(),
            swap_id: swap_id.to_hex(),
        };
        self.node
            .broadcast(TxMsg::new(REFUND_HTLT_MSG_TYPE, &msg)?)
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
            .open_swaps_to(ChainKind::Bnb, &self.settings.deputy_address, from_height)
            .await
    }

    async fn get_balance(&self, address: &str) -> DeputyResult<u128> {
        self.node.balance(address, &self.settings.denom).await
    }

    async fn send_amount(&self, address: &str, amount: u128) -> DeputyResult<String> {
        decode_address(address, &self.settings.address_prefix)?;
        let coins = self.coins(amount)?;
        let msg = SendMsg {
            inputs: vec![SendEntry {
                address: self.settings.deputy_address.clone(),
                coins: coins.clone(),
            }],
            outputs: vec![SendEntry {
                address: address.to_string(),
                coins,
            }],
        };
        self.node.broadcast(TxMsg::new(SEND_MSG_TYPE, &msg)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{derive_address, LedgerFees, MemoryLedger};
    use crate::chain::random_number_hash;

    fn setup() -> (Arc<MemoryLedger>, BnbExecutor, String) {
        let ledger = MemoryLedger::new(ChainKind::Bnb, "BNB", LedgerFees::default());
        let deputy = derive_address("bnb", "deputy").unwrap();
        ledger.credit(&deputy, 1_000_000_000);
        let exe = BnbExecutor::new(
            ledger.node(&deputy),
            ExecutorSettings {
                deputy_address: deputy.clone(),
                address_prefix: "bnb".to_string(),
                denom: "BNB".to_string(),
            },
        )
        .unwrap();
        (ledger, exe, deputy)
    }

    #[test]
    fn swap_id_is_deterministic_and_case_sensitive() {
        let sender = derive_address("bnb", "user").unwrap();
        let rnh = random_number_hash(&[1; 32], 1_600_000_000);
        let a = calc_swap_id(&rnh, &sender, "kava1ABC", "bnb").unwrap();
        let b = calc_swap_id(&rnh, &sender, "kava1ABC", "bnb").unwrap();
        let c = calc_swap_id(&rnh, &sender, "kava1abc", "bnb").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn htlt_message_carries_expected_income() {
        let (_, exe, deputy) = setup();
        let msg = exe
            .build_htlt(&HtltRequest {
                random_number_hash: [3; 32],
                timestamp: 42,
                expiry: ExpiryWindow::Blocks(20_000),
                recipient: derive_address("bnb", "user").unwrap(),
                sender_other_chain: "kava1sender".to_string(),
                recipient_other_chain: "kava1deputy".to_string(),
                amount: 99_000_000,
            })
            .unwrap();
        assert_eq!(msg.from, deputy);
        assert_eq!(msg.expected_income, "99000000:BNB");
        assert_eq!(msg.height_span, 20_000);
        assert!(msg.cross_chain);
    }

    #[test]
    fn rejects_time_based_and_out_of_range_windows() {
        let (_, exe, _) = setup();
        assert!(exe.height_span(ExpiryWindow::Seconds(3600)).is_err());
        assert!(exe.height_span(ExpiryWindow::Blocks(10)).is_err());
        assert!(exe.height_span(ExpiryWindow::Blocks(MAX_HEIGHT_SPAN + 1)).is_err());
        assert_eq!(exe.height_span(ExpiryWindow::Blocks(360)).unwrap(), 360);
    }

    #[tokio::test]
    async fn htlt_creates_swap_under_derived_id() {
        let (ledger, exe, deputy) = setup();
        let user = derive_address("bnb", "user").unwrap();
        let rnh = random_number_hash(&[9; 32], 1_700_000_000);
        let tx_hash = exe
            .htlt(HtltRequest {
                random_number_hash: rnh,
                timestamp: 1_700_000_000,
                expiry: ExpiryWindow::Blocks(400),
                recipient: user.clone(),
                sender_other_chain: "kava1user".to_string(),
                recipient_other_chain: "kava1deputy".to_string(),
                amount: 100_000_000,
            })
            .await
            .unwrap();

        assert_eq!(
            exe.get_sent_tx_status(&tx_hash).await.unwrap(),
            TxSentStatus::Success
        );
        let swap_id = exe.calc_swap_id(&rnh, &deputy, "kava1user").unwrap();
        assert!(exe.has_swap(swap_id).await.unwrap());
        assert!(exe.claimable(swap_id).await.unwrap());
        assert!(!exe.refundable(swap_id).await.unwrap());

        ledger.advance_blocks(400);
        assert!(!exe.claimable(swap_id).await.unwrap());
        assert!(exe.refundable(swap_id).await.unwrap());
    }

    #[tokio::test]
    async fn send_amount_moves_coins() {
        let (_, exe, _) = setup();
        let cold = derive_address("bnb", "cold").unwrap();
        let before = exe.get_balance(&cold).await.unwrap();
        let tx_hash = exe.send_amount(&cold, 100_000_000).await.unwrap();
        assert_eq!(
            exe.get_sent_tx_status(&tx_hash).await.unwrap(),
            TxSentStatus::Success
        );
        assert_eq!(exe.get_balance(&cold).await.unwrap(), before + 100_000_000);
    }

    #[tokio::test]
    async fn send_amount_rejects_foreign_address() {
        let (_, exe, _) = setup();
        let err = exe
            .send_amount(&derive_address("kava", "cold").unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DeputyError::InvalidAddress { .. }));
    }
}
