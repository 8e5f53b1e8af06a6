//! Relay of swaps from an origin chain to a destination chain
//!
//! Handles:
//! - Mirroring an incoming swap on the destination out of deputy custody
//! - Relaying the revealed secret back to claim the origin swap
//! - Refunding both legs when the counterpart never claims
//! - Resolving transactions left pending by a previous run

mod amount;
mod engine;
mod recovery;

pub use amount::ConversionRatio;
pub use engine::{RelayEngine, RelayPlan};
pub use recovery::{recover_pending, RecoveryReport};

use crate::chain::ExpiryWindow;

use serde::Serialize;
use std::time::Duration;

/// Immutable parameters of one origin -> destination relay direction
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deducted from every relayed amount, in origin base units
    pub fixed_fee: u128,
    pub ratio: ConversionRatio,
    /// Expiry window of mirror swaps, in destination units
    pub dest_expiry: ExpiryWindow,
    pub min_amount: u128,
    pub max_amount: Option<u128>,
    pub poll_interval: Duration,
    /// Wait for a broadcast transaction to reach a final status
    pub confirm_timeout: Duration,
    /// Wait for a confirmed mirror to become visible
    pub visibility_timeout: Duration,
    /// Wait for the counterpart to claim or the mirror to expire
    pub claim_timeout: Duration,
    /// Wait for the origin swap to close (or become refundable)
    pub close_timeout: Duration,
    /// How often held swaps are driven again
    pub redrive_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fixed_fee: 0,
            ratio: ConversionRatio::ONE,
            dest_expiry: ExpiryWindow::Blocks(crate::chain::bnb::MIN_HEIGHT_SPAN),
            min_amount: 0,
            max_amount: None,
            poll_interval: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(60),
            visibility_timeout: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(600),
            close_timeout: Duration::from_secs(600),
            redrive_interval: Duration::from_secs(30),
        }
    }
}

/// Local, re-derivable progress of one relayed swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Observed,
    MirrorSubmitted,
    MirrorConfirmed,
    CounterpartClaimed,
    SecretRelayed,
    OriginClosed,
    Expired,
    RefundSubmitted,
    RefundConfirmed,
}

impl RelayState {
    /// Position along either path; claim and refund states share ranks
    pub fn rank(&self) -> u8 {
        match self {
            RelayState::Observed => 0,
            RelayState::MirrorSubmitted => 1,
            RelayState::MirrorConfirmed => 2,
            RelayState::CounterpartClaimed | RelayState::Expired => 3,
            RelayState::SecretRelayed | RelayState::RefundSubmitted => 4,
            RelayState::OriginClosed | RelayState::RefundConfirmed => 5,
        }
    }
}

/// How a single relay attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Secret relayed and origin swap closed
    Completed,
    /// Both legs refunded
    Refunded,
    /// A bounded wait ran out; resumable from chain state and the tx ledger
    Held(RelayState),
    /// Not a swap this engine relays
    Skipped(String),
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Refunded => "refunded",
            RelayOutcome::Held(_) => "held",
            RelayOutcome::Skipped(_) => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayOutcome::Completed | RelayOutcome::Refunded)
    }
}
