//! Relay engine for one ordered chain pair

use super::{RelayConfig, RelayOutcome, RelayState};
use crate::chain::{ChainExecutor, ChainKind, HtltRequest, Swap, SwapId, TxSentStatus};
use crate::error::{DeputyError, DeputyResult};
use crate::retry::RetryScheduler;
use crate::store::{TxIntent, TxLedger, TxRecord};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Identities of both legs and the amount the mirror carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPlan {
    pub origin_swap_id: SwapId,
    pub dest_swap_id: SwapId,
    pub amount: u128,
}

enum Mirror {
    Confirmed,
    Held(RelayState),
    Skip(String),
}

/// Drives swaps observed on `origin` through mirror, secret relay and refund
pub struct RelayEngine {
    origin: Arc<dyn ChainExecutor>,
    dest: Arc<dyn ChainExecutor>,
    ledger: Arc<TxLedger>,
    scheduler: Arc<RetryScheduler>,
    config: RelayConfig,
    /// Progress by origin swap id
    states: DashMap<SwapId, RelayState>,
    /// Swaps whose last attempt can be resumed
    held: DashMap<SwapId, Swap>,
    in_flight: DashSet<SwapId>,
    relays: Mutex<JoinSet<()>>,
}

impl RelayEngine {
    pub fn new(
        origin: Arc<dyn ChainExecutor>,
        dest: Arc<dyn ChainExecutor>,
        ledger: Arc<TxLedger>,
        scheduler: Arc<RetryScheduler>,
        config: RelayConfig,
    ) -> Self {
        Self {
            origin,
            dest,
            ledger,
            scheduler,
            config,
            states: DashMap::new(),
            held: DashMap::new(),
            in_flight: DashSet::new(),
            relays: Mutex::new(JoinSet::new()),
        }
    }

    pub fn origin_chain(&self) -> ChainKind {
        self.origin.chain()
    }

    pub fn dest_chain(&self) -> ChainKind {
        self.dest.chain()
    }

    /// Deputy address on the destination: origin swaps name it as `sender_other_chain`
    pub fn dest_deputy(&self) -> String {
        self.dest.deputy_address()
    }

    pub fn state(&self, origin_swap_id: &SwapId) -> Option<RelayState> {
        self.states.get(origin_swap_id).map(|s| *s)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Relay tasks spawned and not yet reaped
    pub fn running_relays(&self) -> usize {
        self.relays().len()
    }

    fn relays(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.relays.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record progress. A re-drive never moves a swap back along its path.
    fn set_state(&self, plan: &RelayPlan, state: RelayState) {
        match self.states.entry(plan.origin_swap_id) {
            Entry::Occupied(mut current) => {
                if state.rank() <= current.get().rank() {
                    return;
                }
                current.insert(state);
            }
            Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }
        debug!("Swap {} -> {:?}", plan.origin_swap_id, state);
    }

    /// Derive both swap ids and the mirror amount, or the reason to skip
    pub fn plan(&self, swap: &Swap) -> DeputyResult<Result<RelayPlan, String>> {
        if swap.chain != self.origin.chain() {
            return Ok(Err(format!(
                "swap observed on {}, engine relays from {}",
                swap.chain,
                self.origin.chain()
            )));
        }
        if swap.recipient != self.origin.deputy_address() {
            return Ok(Err(format!("recipient {} is not the deputy", swap.recipient)));
        }
        let dest_deputy = self.dest.deputy_address();
        if !swap.sender_other_chain.eq_ignore_ascii_case(&dest_deputy) {
            return Ok(Err(format!(
                "sender_other_chain {} is not the {} deputy",
                swap.sender_other_chain,
                self.dest.chain()
            )));
        }

        if swap.amount < self.config.min_amount {
            return Err(DeputyError::InvalidSwap(format!(
                "amount {} below minimum {}",
                swap.amount, self.config.min_amount
            )));
        }
        if let Some(max) = self.config.max_amount {
            if swap.amount > max {
                return Err(DeputyError::InvalidSwap(format!(
                    "amount {} above maximum {}",
                    swap.amount, max
                )));
            }
        }
        let amount = self.config.ratio.convert(swap.amount, self.config.fixed_fee)?;

        let origin_swap_id = self.origin.calc_swap_id(
            &swap.random_number_hash,
            &swap.sender,
            &swap.sender_other_chain,
        )?;
        let dest_swap_id =
            self.dest
                .calc_swap_id(&swap.random_number_hash, &dest_deputy, &swap.sender)?;

        Ok(Ok(RelayPlan {
            origin_swap_id,
            dest_swap_id,
            amount,
        }))
    }

    /// Run one relay attempt for `swap` against current chain state.
    ///
    /// Safe to call again at any point, including concurrently for the same
    /// swap: every submission goes through the tx ledger first.
    pub async fn relay(&self, swap: Swap) -> DeputyResult<RelayOutcome> {
        let result = match self.plan(&swap) {
            Ok(Ok(plan)) => {
                let span = info_span!(
                    "relay",
                    from = %self.origin.chain(),
                    to = %self.dest.chain(),
                    swap_id = %plan.origin_swap_id
                );
                let result = self.drive(&swap, &plan).instrument(span).await;
                if matches!(&result, Ok(outcome) if outcome.is_terminal()) {
                    self.ledger.release(&plan.origin_swap_id);
                    self.ledger.release(&plan.dest_swap_id);
                    if let Err(e) = self.ledger.finish_relay(&plan.origin_swap_id).await {
                        warn!("Could not close relay of swap {}: {}", plan.origin_swap_id, e);
                    }
                }
                result
            }
            Ok(Err(reason)) => Ok(RelayOutcome::Skipped(reason)),
            Err(e) => Err(e),
        };
        self.report(&swap, &result);
        result
    }

    fn report(&self, swap: &Swap, result: &DeputyResult<RelayOutcome>) {
        let label = match result {
            Ok(RelayOutcome::Skipped(reason)) => {
                debug!("Skipped swap from {}: {}", swap.sender, reason);
                "skipped"
            }
            Ok(RelayOutcome::Held(state)) => {
                info!("Swap from {} held at {:?}", swap.sender, state);
                "held"
            }
            Ok(outcome) => outcome.label(),
            Err(e) if e.should_alert() => {
                error!(
                    kind = e.kind(),
                    "Escalation: relay of swap from {} on {} stopped: {}",
                    swap.sender,
                    swap.chain,
                    e
                );
                crate::metrics::record_escalation(e.kind());
                "escalated"
            }
            Err(e) => {
                warn!("Relay of swap from {} on {} failed: {}", swap.sender, swap.chain, e);
                "error"
            }
        };
        crate::metrics::record_relay_outcome(self.origin.chain(), self.dest.chain(), label);
    }

    async fn drive(&self, swap: &Swap, plan: &RelayPlan) -> DeputyResult<RelayOutcome> {
        if !self.config.ratio.is_one() {
            warn!(
                "Conversion ratio {} is not reconciled: relaying {} for {}",
                self.config.ratio, plan.amount, swap.amount
            );
        }
        self.set_state(plan, RelayState::Observed);

        match self.ensure_mirror(swap, plan).await? {
            Mirror::Confirmed => {}
            Mirror::Held(state) => return Ok(RelayOutcome::Held(state)),
            Mirror::Skip(reason) => return Ok(RelayOutcome::Skipped(reason)),
        }
        self.set_state(plan, RelayState::MirrorConfirmed);

        let dest_id = plan.dest_swap_id;
        let visible = self
            .scheduler
            .wait_until(
                "mirror_visible",
                self.config.visibility_timeout,
                self.config.poll_interval,
                move || async move { self.dest.has_swap(dest_id).await },
            )
            .await?;
        if !visible {
            return Ok(RelayOutcome::Held(RelayState::MirrorConfirmed));
        }

        let settled = self
            .scheduler
            .wait_until(
                "counterpart_claim",
                self.config.claim_timeout,
                self.config.poll_interval,
                move || async move { Ok(!self.dest.claimable(dest_id).await?) },
            )
            .await?;
        if !settled {
            return Ok(RelayOutcome::Held(RelayState::MirrorConfirmed));
        }

        match self.dest.revealed_secret(dest_id).await? {
            Some(secret) => self.relay_secret(plan, secret).await,
            None => self.refund(plan).await,
        }
    }

    async fn ensure_mirror(&self, swap: &Swap, plan: &RelayPlan) -> DeputyResult<Mirror> {
        let dest_id = plan.dest_swap_id;
        let record = {
            let _guard = self.ledger.lock(TxIntent::Htlt, dest_id).await;
            if let Some(record) = self.existing(TxIntent::Htlt, &dest_id).await? {
                Some(record)
            } else if self.dest.has_swap(dest_id).await? {
                debug!("Mirror {} already on {}", dest_id, self.dest.chain());
                self.ledger.track_relay(&plan.origin_swap_id, swap).await?;
                None
            } else {
                if !self.origin.claimable(plan.origin_swap_id).await? {
                    return Ok(Mirror::Skip("origin swap is no longer claimable".to_string()));
                }
                let custody = self.dest.get_balance(&self.dest.deputy_address()).await?;
                crate::metrics::record_custody_balance(self.dest.chain(), custody);
                if custody < plan.amount {
                    return Err(DeputyError::InsufficientBalance {
                        chain: self.dest.chain(),
                        have: custody,
                        need: plan.amount,
                    });
                }

                let request = HtltRequest {
                    random_number_hash: swap.random_number_hash,
                    timestamp: swap.timestamp,
                    expiry: self.config.dest_expiry,
                    recipient: swap.recipient_other_chain.clone(),
                    sender_other_chain: swap.sender.clone(),
                    recipient_other_chain: swap.recipient.clone(),
                    amount: plan.amount,
                };
                self.ledger.track_relay(&plan.origin_swap_id, swap).await?;
                let tx_hash = self.dest.htlt(request).await?;
                Some(self.record(&self.dest, TxIntent::Htlt, dest_id, tx_hash).await?)
            }
        };

        if let Some(record) = record {
            self.set_state(plan, RelayState::MirrorSubmitted);
            if !self.confirm(&self.dest, &record).await? {
                return Ok(Mirror::Held(RelayState::MirrorSubmitted));
            }
        }
        Ok(Mirror::Confirmed)
    }

    async fn relay_secret(&self, plan: &RelayPlan, secret: [u8; 32]) -> DeputyResult<RelayOutcome> {
        self.set_state(plan, RelayState::CounterpartClaimed);
        let origin_id = plan.origin_swap_id;

        let record = {
            let _guard = self.ledger.lock(TxIntent::Claim, origin_id).await;
            if let Some(record) = self.existing(TxIntent::Claim, &origin_id).await? {
                Some(record)
            } else if self.origin.claimable(origin_id).await? {
                let tx_hash = self.origin.claim(origin_id, secret).await?;
                Some(self.record(&self.origin, TxIntent::Claim, origin_id, tx_hash).await?)
            } else if self.origin.refundable(origin_id).await? {
                return Err(DeputyError::ClaimWindowMissed { swap_id: origin_id });
            } else {
                None
            }
        };

        if let Some(record) = record {
            if !self.confirm(&self.origin, &record).await? {
                return Ok(RelayOutcome::Held(RelayState::CounterpartClaimed));
            }
        }
        self.set_state(plan, RelayState::SecretRelayed);

        let closed = self
            .scheduler
            .wait_until(
                "origin_close",
                self.config.close_timeout,
                self.config.poll_interval,
                move || async move { self.closed(self.origin.as_ref(), origin_id).await },
            )
            .await?;
        if !closed {
            return Ok(RelayOutcome::Held(RelayState::SecretRelayed));
        }

        self.set_state(plan, RelayState::OriginClosed);
        info!("Swap {} completed", origin_id);
        Ok(RelayOutcome::Completed)
    }

    /// Refund the mirror to custody, then the origin swap to its sender
    async fn refund(&self, plan: &RelayPlan) -> DeputyResult<RelayOutcome> {
        self.set_state(plan, RelayState::Expired);
        let mut held_at = RelayState::Expired;

        if let Some(record) = self.submit_refund(&self.dest, plan.dest_swap_id).await? {
            held_at = RelayState::RefundSubmitted;
            self.set_state(plan, held_at);
            if !self.confirm(&self.dest, &record).await? {
                return Ok(RelayOutcome::Held(held_at));
            }
        }

        let origin_id = plan.origin_swap_id;
        let expired = self
            .scheduler
            .wait_until(
                "origin_expiry",
                self.config.close_timeout,
                self.config.poll_interval,
                move || async move { Ok(!self.origin.claimable(origin_id).await?) },
            )
            .await?;
        if !expired {
            return Ok(RelayOutcome::Held(held_at));
        }

        if let Some(record) = self.submit_refund(&self.origin, origin_id).await? {
            held_at = RelayState::RefundSubmitted;
            self.set_state(plan, held_at);
            if !self.confirm(&self.origin, &record).await? {
                return Ok(RelayOutcome::Held(held_at));
            }
        }
        if !self.closed(self.origin.as_ref(), origin_id).await? {
            return Ok(RelayOutcome::Held(held_at));
        }

        self.set_state(plan, RelayState::RefundConfirmed);
        info!("Swap {} refunded", origin_id);
        Ok(RelayOutcome::Refunded)
    }

    async fn submit_refund(
        &self,
        executor: &Arc<dyn ChainExecutor>,
        swap_id: SwapId,
    ) -> DeputyResult<Option<TxRecord>> {
        let _guard = self.ledger.lock(TxIntent::Refund, swap_id).await;
        if let Some(record) = self.existing(TxIntent::Refund, &swap_id).await? {
            return Ok(Some(record));
        }
        if !executor.refundable(swap_id).await? {
            return Ok(None);
        }
        let tx_hash = executor.refund(swap_id).await?;
        self.record(executor, TxIntent::Refund, swap_id, tx_hash)
            .await
            .map(Some)
    }

    /// Active record for the key. A failed one halts the swap for an operator.
    async fn existing(&self, intent: TxIntent, swap_id: &SwapId) -> DeputyResult<Option<TxRecord>> {
        match self.ledger.lookup(intent, swap_id).await? {
            Some(record) if record.status == TxSentStatus::Failed => {
                Err(DeputyError::TransactionFailed {
                    chain: record.chain,
                    tx_hash: record.tx_hash,
                    reason: format!("{} for swap {} failed; not resubmitting", intent, swap_id),
                })
            }
            other => Ok(other),
        }
    }

    async fn record(
        &self,
        executor: &Arc<dyn ChainExecutor>,
        intent: TxIntent,
        swap_id: SwapId,
        tx_hash: String,
    ) -> DeputyResult<TxRecord> {
        let record = TxRecord::pending(tx_hash, executor.chain(), intent, Some(swap_id));
        self.ledger.record(&record).await?;
        crate::metrics::record_tx_submitted(record.chain, intent);
        info!(
            tx_hash = %record.tx_hash,
            "Submitted {} for swap {} on {}", intent, swap_id, record.chain
        );
        Ok(record)
    }

    /// Wait for a recorded transaction to resolve; `Ok(false)` if it is still pending
    async fn confirm(&self, executor: &Arc<dyn ChainExecutor>, record: &TxRecord) -> DeputyResult<bool> {
        let status = match record.status {
            TxSentStatus::Pending => {
                let executor = executor.as_ref();
                let tx_hash = record.tx_hash.as_str();
                let resolved = self
                    .scheduler
                    .wait_until(
                        "tx_confirm",
                        self.config.confirm_timeout,
                        self.config.poll_interval,
                        move || async move {
                            Ok(executor.get_sent_tx_status(tx_hash).await?.is_final())
                        },
                    )
                    .await?;
                if !resolved {
                    return Ok(false);
                }
                let status = executor.get_sent_tx_status(tx_hash).await?;
                self.ledger.update_status(tx_hash, status).await?;
                crate::metrics::record_tx_resolved(record.chain, record.intent, status.as_str());
                status
            }
            status => status,
        };

        match status {
            TxSentStatus::Success => Ok(true),
            TxSentStatus::Pending => Ok(false),
            TxSentStatus::Failed => Err(DeputyError::TransactionFailed {
                chain: record.chain,
                tx_hash: record.tx_hash.clone(),
                reason: format!("{} mined as failed", record.intent),
            }),
        }
    }

    /// Neither claimable nor refundable
    async fn closed(&self, executor: &dyn ChainExecutor, swap_id: SwapId) -> DeputyResult<bool> {
        Ok(!executor.claimable(swap_id).await? && !executor.refundable(swap_id).await?)
    }

    fn origin_id(&self, swap: &Swap) -> Option<SwapId> {
        match self.origin.calc_swap_id(
            &swap.random_number_hash,
            &swap.sender,
            &swap.sender_other_chain,
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Cannot derive id of swap from {}: {}", swap.sender, e);
                None
            }
        }
    }

    /// Queue a swap whose relay was in flight before a restart for the next re-drive
    pub fn resume(&self, swap: Swap) -> bool {
        match self.origin_id(&swap) {
            Some(origin_id) => {
                info!("Resuming relay of swap {}", origin_id);
                self.held.insert(origin_id, swap);
                true
            }
            None => false,
        }
    }

    /// Spawn a relay task unless one is already running for this origin swap
    pub fn spawn_relay(self: &Arc<Self>, swap: Swap) -> bool {
        let Some(origin_id) = self.origin_id(&swap) else {
            return false;
        };
        if !self.in_flight.insert(origin_id) {
            debug!("Swap {} is already being relayed", origin_id);
            return false;
        }

        let engine = Arc::clone(self);
        let mut relays = self.relays();
        // reap finished tasks so the set only holds running relays
        while let Some(Some(_)) = relays.join_next().now_or_never() {}
        relays.spawn(async move {
            let result = engine.relay(swap.clone()).await;
            let resumable = match &result {
                Ok(RelayOutcome::Held(_)) => true,
                Err(e) => e.is_retryable(),
                Ok(_) => false,
            };
            if resumable {
                engine.held.insert(origin_id, swap);
            } else {
                engine.held.remove(&origin_id);
            }
            engine.in_flight.remove(&origin_id);
        });
        true
    }

    /// Abort every running relay task and wait for them to unwind
    pub async fn abort_relays(&self) {
        let mut relays = std::mem::take(&mut *self.relays());
        let running = relays.len();
        relays.shutdown().await;
        self.in_flight.clear();
        if running > 0 {
            info!(
                "Aborted {} relay tasks {} -> {}",
                running,
                self.origin.chain(),
                self.dest.chain()
            );
        }
    }

    /// Relay every swap received on `swaps`, re-driving held ones periodically
    pub async fn run(self: Arc<Self>, mut swaps: mpsc::Receiver<Swap>, shutdown: Arc<RwLock<bool>>) {
        let mut redrive = interval(self.config.redrive_interval);
        redrive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Relay engine {} -> {} started",
            self.origin.chain(),
            self.dest.chain()
        );

        loop {
            if *shutdown.read().await {
                break;
            }

            tokio::select! {
                received = swaps.recv() => match received {
                    Some(swap) => {
                        self.spawn_relay(swap);
                    }
                    None => break,
                },

                _ = redrive.tick() => {
                    let held: Vec<Swap> = self.held.iter().map(|e| e.value().clone()).collect();
                    if !held.is_empty() {
                        debug!("Re-driving {} held swaps", held.len());
                    }
                    for swap in held {
                        self.spawn_relay(swap);
                    }
                }
            }
        }

        info!(
            "Relay engine {} -> {} stopped",
            self.origin.chain(),
            self.dest.chain()
        );
    }
}
