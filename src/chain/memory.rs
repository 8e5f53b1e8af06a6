//! In-process ledger simulating one chain's HTLC module.
//!
//! Executes the message dialect of its chain (Binance Chain or Kava) with
//! per-message fees, one block per transaction, height/time expiry and claim
//! verification against the random number hash. Used for testing and
//! ephemeral dry runs; nothing is persisted.

use super::node::{BlockInfo, NodeClient, OnChainSwap, SwapStatus, TxMsg, TxOutcome};
use super::{bnb, kava, parse_bytes32, random_number_hash, ChainKind, Expiry, ExpiryWindow, SwapId};
use crate::error::{DeputyError, DeputyResult};

use async_trait::async_trait;
use bech32::{ToBase32, Variant};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Seconds between simulated blocks
pub const BLOCK_TIME_SECS: i64 = 5;

const GENESIS_TIME: i64 = 1_600_000_000;

/// Deterministic bech32 address for a label, e.g. `derive_address("bnb", "alice")`
pub fn derive_address(prefix: &str, label: &str) -> DeputyResult<String> {
    let digest = Sha256::digest(label.as_bytes());
    bech32::encode(prefix, digest[..20].to_vec().to_base32(), Variant::Bech32).map_err(|e| {
        DeputyError::InvalidAddress {
            address: format!("{}:{}", prefix, label),
            reason: e.to_string(),
        }
    })
}

/// Fee charged to the signer of each message kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerFees {
    pub htlt: u128,
    pub claim: u128,
    pub refund: u128,
    pub send: u128,
}

/// Chain-independent view of a decoded message
enum Action {
    Create {
        from: String,
        to: String,
        sender_other_chain: String,
        recipient_other_chain: String,
        random_number_hash: [u8; 32],
        timestamp: i64,
        amount: u128,
        denom: String,
        window: ExpiryWindow,
    },
    Claim {
        from: String,
        swap_id: SwapId,
        random_number: [u8; 32],
    },
    Refund {
        from: String,
        swap_id: SwapId,
    },
    Send {
        from: String,
        to: String,
        amount: u128,
        denom: String,
    },
}

impl Action {
    fn from(&self) -> &str {
        match self {
            Action::Create { from, .. }
            | Action::Claim { from, .. }
            | Action::Refund { from, .. }
            | Action::Send { from, .. } => from,
        }
    }
}

struct SimTx {
    outcome: TxOutcome,
    polls_left: u32,
}

struct LedgerState {
    tip: BlockInfo,
    balances: HashMap<String, u128>,
    swaps: HashMap<SwapId, OnChainSwap>,
    txs: HashMap<String, SimTx>,
    /// (signer, message type) of every accepted broadcast
    broadcasts: Vec<(String, String)>,
    confirmation_polls: u32,
    offline: bool,
}

/// Simulated chain shared by every `MemoryNode` signing against it
pub struct MemoryLedger {
    chain: ChainKind,
    prefix: String,
    denom: String,
    fees: LedgerFees,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new(chain: ChainKind, denom: &str, fees: LedgerFees) -> Arc<Self> {
        Arc::new(Self {
            chain,
            prefix: chain.as_str().to_string(),
            denom: denom.to_string(),
            fees,
            state: Mutex::new(LedgerState {
                tip: BlockInfo {
                    height: 1,
                    time: GENESIS_TIME,
                },
                balances: HashMap::new(),
                swaps: HashMap::new(),
                txs: HashMap::new(),
                broadcasts: Vec::new(),
                confirmation_polls: 0,
                offline: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Client signing as `signer`
    pub fn node(self: &Arc<Self>, signer: &str) -> Arc<MemoryNode> {
        Arc::new(MemoryNode {
            ledger: self.clone(),
            signer: signer.to_string(),
        })
    }

    pub fn chain(&self) -> ChainKind {
        self.chain
    }

    /// Number of status polls a new transaction stays pending for
    pub fn set_confirmation_polls(&self, polls: u32) {
        self.state().confirmation_polls = polls;
    }

    /// Let every transaction broadcast so far report its outcome on the next poll
    pub fn settle_pending(&self) {
        for tx in self.state().txs.values_mut() {
            tx.polls_left = 0;
        }
    }

    /// While offline every read and broadcast fails with a connection error
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn credit(&self, address: &str, amount: u128) {
        *self.state().balances.entry(address.to_string()).or_default() += amount;
    }

    pub fn balance_of(&self, address: &str) -> u128 {
        self.state().balances.get(address).copied().unwrap_or(0)
    }

    pub fn tip(&self) -> BlockInfo {
        self.state().tip
    }

    pub fn advance_blocks(&self, blocks: u64) {
        let mut state = self.state();
        state.tip.height += blocks;
        state.tip.time += blocks as i64 * BLOCK_TIME_SECS;
    }

    pub fn advance_time(&self, secs: i64) {
        let mut state = self.state();
        state.tip.time += secs;
        state.tip.height += (secs / BLOCK_TIME_SECS).max(1) as u64;
    }

    pub fn swap(&self, swap_id: &SwapId) -> Option<OnChainSwap> {
        self.state().swaps.get(swap_id).cloned()
    }

    /// Accepted broadcasts by `signer` of message type `kind`
    pub fn broadcast_count(&self, signer: &str, kind: &str) -> usize {
        self.state()
            .broadcasts
            .iter()
            .filter(|(s, k)| s == signer && k == kind)
            .count()
    }

    fn connection_error(&self) -> DeputyError {
        DeputyError::ChainConnection {
            chain: self.chain,
            message: "node unavailable".to_string(),
        }
    }

    fn rejected(&self, message: impl Into<String>) -> DeputyError {
        DeputyError::Submission {
            chain: self.chain,
            message: message.into(),
        }
    }

    fn calc_swap_id(
        &self,
        random_number_hash: &[u8; 32],
        sender: &str,
        sender_other_chain: &str,
    ) -> DeputyResult<SwapId> {
        match self.chain {
            ChainKind::Bnb => {
                bnb::calc_swap_id(random_number_hash, sender, sender_other_chain, &self.prefix)
            }
            ChainKind::Kava => {
                kava::calc_swap_id(random_number_hash, sender, sender_other_chain, &self.prefix)
            }
        }
    }

    fn parse_int<T: std::str::FromStr>(&self, value: &str, field: &str) -> DeputyResult<T> {
        value
            .parse()
            .map_err(|_| self.rejected(format!("invalid {}: {}", field, value)))
    }

    fn parse_hex(&self, value: &str) -> DeputyResult<[u8; 32]> {
        parse_bytes32(value).map_err(|e| self.rejected(e.to_string()))
    }

    fn single_coin<'a>(&self, coins: &'a [(String, u128)]) -> DeputyResult<&'a (String, u128)> {
        match coins {
            [coin] => Ok(coin),
            _ => Err(self.rejected("expected exactly one coin")),
        }
    }

    fn decode(&self, msg: TxMsg) -> DeputyResult<Action> {
        match (self.chain, msg.kind.as_str()) {
            (ChainKind::Bnb, bnb::HTLT_MSG_TYPE) => {
                let m: bnb::HtltMsg = serde_json::from_value(msg.value)?;
                let coins: Vec<_> = m
                    .amount
                    .iter()
                    .map(|c| (c.denom.clone(), c.amount.max(0) as u128))
                    .collect();
                let (denom, amount) = self.single_coin(&coins)?.clone();
                Ok(Action::Create {
                    from: m.from,
                    to: m.to,
                    sender_other_chain: m.sender_other_chain,
                    recipient_other_chain: m.recipient_other_chain,
                    random_number_hash: self.parse_hex(&m.random_number_hash)?,
                    timestamp: m.timestamp,
                    amount,
                    denom,
                    window: ExpiryWindow::Blocks(m.height_span.max(0) as u64),
                })
            }
            (ChainKind::Bnb, bnb::CLAIM_HTLT_MSG_TYPE) => {
                let m: bnb::ClaimHtltMsg = serde_json::from_value(msg.value)?;
                Ok(Action::Claim {
                    from: m.from,
                    swap_id: SwapId(self.parse_hex(&m.swap_id)?),
                    random_number: self.parse_hex(&m.random_number)?,
                })
            }
            (ChainKind::Bnb, bnb::REFUND_HTLT_MSG_TYPE) => {
                let m: bnb::RefundHtltMsg = serde_json::from_value(msg.value)?;
                Ok(Action::Refund {
                    from: m.from,
                    swap_id: SwapId(self.parse_hex(&m.swap_id)?),
                })
            }
            (ChainKind::Bnb, bnb::SEND_MSG_TYPE) => {
                let m: bnb::SendMsg = serde_json::from_value(msg.value)?;
                match (m.inputs.as_slice(), m.outputs.as_slice()) {
                    ([input], [output]) => {
                        let coins: Vec<_> = output
                            .coins
                            .iter()
                            .map(|c| (c.denom.clone(), c.amount.max(0) as u128))
                            .collect();
                        let (denom, amount) = self.single_coin(&coins)?.clone();
                        Ok(Action::Send {
                            from: input.address.clone(),
                            to: output.address.clone(),
                            amount,
                            denom,
                        })
                    }
                    _ => Err(self.rejected("expected one input and one output")),
                }
            }
            (ChainKind::Kava, kava::CREATE_SWAP_MSG_TYPE) => {
                let m: kava::MsgCreateAtomicSwap = serde_json::from_value(msg.value)?;
                let coins = m
                    .amount
                    .iter()
                    .map(|c| Ok((c.denom.clone(), self.parse_int(&c.amount, "amount")?)))
                    .collect::<DeputyResult<Vec<_>>>()?;
                let (denom, amount) = self.single_coin(&coins)?.clone();
                let window = match (&m.height_span, &m.time_span) {
                    (Some(span), None) => ExpiryWindow::Blocks(self.parse_int(span, "height_span")?),
                    (None, Some(span)) => ExpiryWindow::Seconds(self.parse_int(span, "time_span")?),
                    _ => return Err(self.rejected("exactly one of height_span, time_span")),
                };
                Ok(Action::Create {
                    from: m.from,
                    to: m.to,
                    sender_other_chain: m.sender_other_chain,
                    recipient_other_chain: m.recipient_other_chain,
                    random_number_hash: self.parse_hex(&m.random_number_hash)?,
                    timestamp: self.parse_int(&m.timestamp, "timestamp")?,
                    amount,
                    denom,
                    window,
                })
            }
            (ChainKind::Kava, kava::CLAIM_SWAP_MSG_TYPE) => {
                let m: kava::MsgClaimAtomicSwap = serde_json::from_value(msg.value)?;
                Ok(Action::Claim {
                    from: m.from,
                    swap_id: SwapId(self.parse_hex(&m.swap_id)?),
                    random_number: self.parse_hex(&m.random_number)?,
                })
            }
            (ChainKind::Kava, kava::REFUND_SWAP_MSG_TYPE) => {
                let m: kava::MsgRefundAtomicSwap = serde_json::from_value(msg.value)?;
                Ok(Action::Refund {
                    from: m.from,
                    swap_id: SwapId(self.parse_hex(&m.swap_id)?),
                })
            }
            (ChainKind::Kava, kava::SEND_MSG_TYPE) => {
                let m: kava::MsgSend = serde_json::from_value(msg.value)?;
                let coins = m
                    .amount
                    .iter()
                    .map(|c| Ok((c.denom.clone(), self.parse_int(&c.amount, "amount")?)))
                    .collect::<DeputyResult<Vec<_>>>()?;
                let (denom, amount) = self.single_coin(&coins)?.clone();
                Ok(Action::Send {
                    from: m.from_address,
                    to: m.to_address,
                    amount,
                    denom,
                })
            }
            (chain, kind) => Err(self.rejected(format!("{} does not accept {}", chain, kind))),
        }
    }

    fn fee(&self, action: &Action) -> u128 {
        match action {
            Action::Create { .. } => self.fees.htlt,
            Action::Claim { .. } => self.fees.claim,
            Action::Refund { .. } => self.fees.refund,
            Action::Send { .. } => self.fees.send,
        }
    }

    /// Upfront debit for the message: fee plus any value it moves out of the signer
    fn upfront(&self, action: &Action) -> DeputyResult<u128> {
        let value = match action {
            Action::Create { amount, denom, .. } | Action::Send { amount, denom, .. } => {
                if *denom != self.denom {
                    return Err(self.rejected(format!("unsupported denom {}", denom)));
                }
                *amount
            }
            _ => 0,
        };
        Ok(value + self.fee(action))
    }

    fn broadcast(&self, signer: &str, msg: TxMsg) -> DeputyResult<String> {
        let kind = msg.kind.clone();
        let digest_input = serde_json::to_vec(&msg)?;
        let action = self.decode(msg)?;

        let mut state = self.state();
        if state.offline {
            return Err(self.connection_error());
        }
        if action.from() != signer {
            return Err(self.rejected(format!(
                "signature by {} does not match sender {}",
                signer,
                action.from()
            )));
        }

        // check phase: nothing below here can reject the transaction
        let upfront = self.upfront(&action)?;
        let balance = state.balances.get(signer).copied().unwrap_or(0);
        if balance < upfront {
            return Err(self.rejected(format!(
                "insufficient funds: have {}, need {}",
                balance, upfront
            )));
        }
        state.balances.insert(signer.to_string(), balance - upfront);

        state.tip.height += 1;
        state.tip.time += BLOCK_TIME_SECS;
        let outcome = self.deliver(&mut state, action);

        let mut hasher = Sha256::new();
        hasher.update(self.chain.as_str().as_bytes());
        hasher.update(state.broadcasts.len().to_be_bytes());
        hasher.update(&digest_input);
        let tx_hash = hex::encode_upper(hasher.finalize());

        let polls_left = state.confirmation_polls;
        state.txs.insert(tx_hash.clone(), SimTx { outcome, polls_left });
        state.broadcasts.push((signer.to_string(), kind));
        Ok(tx_hash)
    }

    fn deliver(&self, state: &mut LedgerState, action: Action) -> TxOutcome {
        match self.execute(state, action) {
            Ok(()) => TxOutcome::Success,
            Err((refund_to, refund, log)) => {
                if refund > 0 {
                    *state.balances.entry(refund_to).or_default() += refund;
                }
                TxOutcome::Failed { log }
            }
        }
    }

    /// Apply a checked message. On failure returns value to give back to the signer.
    fn execute(
        &self,
        state: &mut LedgerState,
        action: Action,
    ) -> Result<(), (String, u128, String)> {
        let tip = state.tip;
        match action {
            Action::Create {
                from,
                to,
                sender_other_chain,
                recipient_other_chain,
                random_number_hash,
                timestamp,
                amount,
                denom,
                window,
            } => {
                let swap_id = self
                    .calc_swap_id(&random_number_hash, &from, &sender_other_chain)
                    .map_err(|e| (from.clone(), amount, e.to_string()))?;
                if state.swaps.contains_key(&swap_id) {
                    return Err((from, amount, format!("swap {} already exists", swap_id)));
                }
                let expiry = match window {
                    ExpiryWindow::Blocks(span) => Expiry::Height(tip.height + span),
                    ExpiryWindow::Seconds(span) => Expiry::Time(tip.time + span as i64),
                };
                state.swaps.insert(
                    swap_id,
                    OnChainSwap {
                        id: swap_id,
                        sender: from,
                        recipient: to,
                        sender_other_chain,
                        recipient_other_chain,
                        random_number_hash,
                        timestamp,
                        amount,
                        denom,
                        expiry,
                        created_height: tip.height,
                        status: SwapStatus::Open,
                        random_number: None,
                    },
                );
                Ok(())
            }
            Action::Claim {
                from,
                swap_id,
                random_number,
            } => {
                let swap = match state.swaps.get_mut(&swap_id) {
                    Some(swap) if swap.claimable(&tip) => swap,
                    Some(_) => return Err((from, 0, format!("swap {} is not claimable", swap_id))),
                    None => return Err((from, 0, format!("swap {} not found", swap_id))),
                };
                if random_number_hash(&random_number, swap.timestamp) != swap.random_number_hash {
                    return Err((from, 0, "random number does not match hash".to_string()));
                }
                swap.status = SwapStatus::Claimed;
                swap.random_number = Some(random_number);
                let (recipient, amount) = (swap.recipient.clone(), swap.amount);
                *state.balances.entry(recipient).or_default() += amount;
                Ok(())
            }
            Action::Refund { from, swap_id } => {
                let swap = match state.swaps.get_mut(&swap_id) {
                    Some(swap) if swap.refundable(&tip) => swap,
                    Some(_) => return Err((from, 0, format!("swap {} is not refundable", swap_id))),
                    None => return Err((from, 0, format!("swap {} not found", swap_id))),
                };
                swap.status = SwapStatus::Refunded;
                let (sender, amount) = (swap.sender.clone(), swap.amount);
                *state.balances.entry(sender).or_default() += amount;
                Ok(())
            }
            Action::Send { to, amount, .. } => {
                *state.balances.entry(to).or_default() += amount;
                Ok(())
            }
        }
    }

    fn tx_outcome(&self, tx_hash: &str) -> DeputyResult<Option<TxOutcome>> {
        let mut state = self.state();
        if state.offline {
            return Err(self.connection_error());
        }
        Ok(match state.txs.get_mut(tx_hash) {
            None => None,
            Some(tx) if tx.polls_left > 0 => {
                tx.polls_left -= 1;
                None
            }
            Some(tx) => Some(tx.outcome.clone()),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> DeputyResult<T> {
        let state = self.state();
        if state.offline {
            return Err(self.connection_error());
        }
        Ok(f(&state))
    }
}

/// `NodeClient` signing as one account on a `MemoryLedger`
pub struct MemoryNode {
    ledger: Arc<MemoryLedger>,
    signer: String,
}

#[async_trait]
impl NodeClient for MemoryNode {
    fn signer(&self) -> &str {
        &self.signer
    }

    async fn broadcast(&self, msg: TxMsg) -> DeputyResult<String> {
        self.ledger.broadcast(&self.signer, msg)
    }

    async fn tx_outcome(&self, tx_hash: &str) -> DeputyResult<Option<TxOutcome>> {
        self.ledger.tx_outcome(tx_hash)
    }

    async fn swap(&self, swap_id: &SwapId) -> DeputyResult<Option<OnChainSwap>> {
        self.ledger.read(|s| s.swaps.get(swap_id).cloned())
    }

    async fn swaps_to(
        &self,
        recipient: &str,
        from_height: u64,
        to_height: u64,
    ) -> DeputyResult<Vec<OnChainSwap>> {
        self.ledger.read(|s| {
            let mut swaps: Vec<_> = s
                .swaps
                .values()
                .filter(|swap| {
                    swap.recipient == recipient
                        && (from_height..=to_height).contains(&swap.created_height)
                })
                .cloned()
                .collect();
            swaps.sort_by_key(|swap| swap.created_height);
            swaps
        })
    }

    async fn latest_block(&self) -> DeputyResult<BlockInfo> {
        self.ledger.read(|s| s.tip)
    }

    async fn balance(&self, address: &str, denom: &str) -> DeputyResult<u128> {
        if denom != self.ledger.denom {
            return Ok(0);
        }
        self.ledger
            .read(|s| s.balances.get(address).copied().unwrap_or(0))
    }
}
