//! Deputy composition: one relay engine per configured pair, one listener per
//! origin chain, plus custody transfers out of the deputy's hot wallets

use crate::chain::memory::{LedgerFees, MemoryLedger};
use crate::chain::{
    BnbExecutor, ChainExecutor, ChainKind, ChainManager, ExecutorSettings, GatewayNode,
    KavaExecutor, NodeClient, Swap, SwapId, SwapListener, TxSentStatus,
};
use crate::config::{ChainConfig, Settings};
use crate::error::{DeputyError, DeputyResult};
use crate::relay::{recover_pending, RecoveryReport, RelayEngine, RelayState};
use crate::retry::RetryScheduler;
use crate::store::{SqliteTxStore, TxIntent, TxLedger, TxRecord, TxStore};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const INBOX_CAPACITY: usize = 256;

/// Relay state of one origin swap in one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EngineState {
    pub origin: ChainKind,
    pub destination: ChainKind,
    pub state: RelayState,
}

pub struct DeputyService {
    settings: Settings,
    chains: Arc<ChainManager>,
    ledger: Arc<TxLedger>,
    scheduler: Arc<RetryScheduler>,
    engines: Vec<Arc<RelayEngine>>,
    /// Engine inboxes in `engines` order, taken by `start`
    inboxes: Mutex<Vec<mpsc::Receiver<Swap>>>,
    listeners: Vec<Arc<SwapListener>>,
    shutdown: Arc<RwLock<bool>>,
    /// Engine loops, listeners and the sweep loop
    tasks: Mutex<JoinSet<()>>,
    started_at: DateTime<Utc>,
}

impl DeputyService {
    /// Open the SQLite store and connect every enabled chain as configured
    pub async fn connect(settings: Settings) -> DeputyResult<Self> {
        let store: Arc<dyn TxStore> = Arc::new(SqliteTxStore::connect(&settings.database).await?);
        info!("Database connection established");

        let nodes = settings
            .enabled_chains()
            .into_iter()
            .map(|(name, chain)| (chain.kind, node_for(name, chain)))
            .collect();
        Self::build(settings, store, nodes).await
    }

    /// Assemble the service over the given store and per-chain node clients
    pub async fn build(
        settings: Settings,
        store: Arc<dyn TxStore>,
        nodes: HashMap<ChainKind, Arc<dyn NodeClient>>,
    ) -> DeputyResult<Self> {
        let shutdown = Arc::new(RwLock::new(false));
        let ledger = Arc::new(TxLedger::new(store.clone()));
        let scheduler = Arc::new(RetryScheduler::new(settings.retry_policy(), shutdown.clone()));

        let chains = Arc::new(ChainManager::new());
        for (_, chain) in settings.enabled_chains() {
            let node = nodes.get(&chain.kind).cloned().ok_or_else(|| {
                DeputyError::Config(format!("no node client for chain {}", chain.kind))
            })?;
            chains.register(executor_for(chain.kind, node, chain.executor_settings())?);
        }

        let mut listeners: HashMap<ChainKind, SwapListener> = HashMap::new();
        let mut engines = Vec::new();
        let mut inboxes = Vec::new();
        for pair in &settings.pairs {
            let (origin, destination) = settings.pair_chains(pair).map_err(config_error)?;
            let relay_config = settings.relay_config(pair).map_err(config_error)?;
            let engine = Arc::new(RelayEngine::new(
                chains.get(origin)?,
                chains.get(destination)?,
                ledger.clone(),
                scheduler.clone(),
                relay_config,
            ));

            let listener = match listeners.entry(origin) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let start_height = settings.chain(origin).map_or(0, |c| c.start_height);
                    entry.insert(
                        SwapListener::new(
                            chains.get(origin)?,
                            store.clone(),
                            settings.poll_interval(),
                            start_height,
                            settings.deputy.rescan_blocks,
                            shutdown.clone(),
                        )
                        .await?,
                    )
                }
            };
            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            listener.route(engine.dest_deputy(), tx);

            info!("Relay pair {} -> {} configured", origin, destination);
            engines.push(engine);
            inboxes.push(rx);
        }

        Ok(Self {
            settings,
            chains,
            ledger,
            scheduler,
            engines,
            inboxes: Mutex::new(inboxes),
            listeners: listeners.into_values().map(Arc::new).collect(),
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
            started_at: Utc::now(),
        })
    }

    /// Resolve pending transactions and resume open relays, then spawn
    /// engines, listeners and the sweep loop
    pub async fn start(self: &Arc<Self>) -> DeputyResult<()> {
        let inboxes = std::mem::take(&mut *self.inboxes.lock().await);
        if inboxes.is_empty() {
            return Err(DeputyError::Internal("deputy service already started".to_string()));
        }

        self.recover().await?;
        self.resume_open_relays().await?;

        let mut tasks = self.tasks.lock().await;
        for (engine, inbox) in self.engines.iter().cloned().zip(inboxes) {
            tasks.spawn(engine.run(inbox, self.shutdown.clone()));
        }
        for listener in &self.listeners {
            let listener = listener.clone();
            tasks.spawn(async move {
                if let Err(e) = listener.listen().await {
                    error!("Listener for {} stopped: {}", listener.chain(), e);
                }
            });
        }
        if let Some(secs) = self.settings.deputy.sweep_interval_secs {
            tasks.spawn(self.clone().sweep_loop(Duration::from_secs(secs)));
        }

        info!(
            "Deputy {} running {} relay pairs",
            self.settings.deputy.instance_id,
            self.engines.len()
        );
        Ok(())
    }

    /// Resolve every Pending record left by a previous run
    pub async fn recover(&self) -> DeputyResult<RecoveryReport> {
        recover_pending(
            &self.chains,
            &self.ledger,
            &self.scheduler,
            Duration::from_secs(self.settings.deputy.recovery_timeout_secs),
            self.settings.poll_interval(),
        )
        .await
    }

    /// Hand every relay whose mirror was in flight before a restart back to
    /// its engine. Their origin blocks may be older than the listener rescans.
    pub async fn resume_open_relays(&self) -> DeputyResult<usize> {
        let mut resumed = 0;
        for swap in self.ledger.open_relays().await? {
            let engine = self.engines.iter().find(|engine| {
                engine.origin_chain() == swap.chain
                    && swap.sender_other_chain.eq_ignore_ascii_case(&engine.dest_deputy())
            });
            match engine {
                Some(engine) if engine.resume(swap.clone()) => resumed += 1,
                Some(_) => {}
                None => warn!(
                    "No relay pair for open {} swap from {}",
                    swap.chain, swap.sender
                ),
            }
        }
        if resumed > 0 {
            info!("Resuming {} open relays", resumed);
        }
        Ok(resumed)
    }

    /// Signal shutdown, then abort and drain every task the deputy spawned
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Deputy shutting down");

        self.tasks.lock().await.shutdown().await;
        for engine in &self.engines {
            engine.abort_relays().await;
        }
    }

    /// Plain transfer out of custody, recorded and waited on like any relay transaction.
    ///
    /// A send still pending after the confirmation timeout is returned as
    /// Pending and resolved by recovery on the next start.
    pub async fn send_amount(
        &self,
        chain: ChainKind,
        to: &str,
        amount: u128,
    ) -> DeputyResult<TxRecord> {
        let executor = self.chains.get(chain)?;
        let tx_hash = executor.send_amount(to, amount).await?;

        let mut record = TxRecord::pending(tx_hash, chain, TxIntent::PlainSend, None);
        self.ledger.record(&record).await?;
        crate::metrics::record_tx_submitted(chain, TxIntent::PlainSend);
        info!(tx_hash = %record.tx_hash, "Sent {} to {} on {}", amount, to, chain);

        let exec = executor.as_ref();
        let tx_hash = record.tx_hash.as_str();
        let resolved = self
            .scheduler
            .wait_until(
                "send_confirm",
                Duration::from_secs(self.settings.deputy.confirm_timeout_secs),
                self.settings.poll_interval(),
                move || async move { Ok(exec.get_sent_tx_status(tx_hash).await?.is_final()) },
            )
            .await?;
        if !resolved {
            warn!("Send {} on {} still pending", record.tx_hash, chain);
            return Ok(record);
        }

        let status = executor.get_sent_tx_status(&record.tx_hash).await?;
        self.ledger.update_status(&record.tx_hash, status).await?;
        crate::metrics::record_tx_resolved(chain, TxIntent::PlainSend, status.as_str());
        record.status = status;

        if status == TxSentStatus::Failed {
            return Err(DeputyError::TransactionFailed {
                chain,
                tx_hash: record.tx_hash,
                reason: format!("send of {} to {} failed", amount, to),
            });
        }
        Ok(record)
    }

    /// Move custody above the hot wallet ceiling to the cold wallet.
    /// `None` when sweeping is not configured or nothing exceeds the ceiling.
    pub async fn sweep_to_cold_wallet(&self, chain: ChainKind) -> DeputyResult<Option<TxRecord>> {
        let config = self
            .settings
            .chain(chain)
            .ok_or(DeputyError::ChainNotFound { chain })?;
        let (Some(cold_wallet), Some(ceiling)) =
            (config.cold_wallet.as_deref(), config.hot_wallet_ceiling)
        else {
            return Ok(None);
        };
        let ceiling = u128::from(ceiling);

        let executor = self.chains.get(chain)?;
        let balance = executor.get_balance(&executor.deputy_address()).await?;
        crate::metrics::record_custody_balance(chain, balance);
        if balance <= ceiling {
            debug!("Custody {} on {} within ceiling {}", balance, chain, ceiling);
            return Ok(None);
        }

        info!(
            "Sweeping {} above ceiling {} on {} to {}",
            balance - ceiling,
            ceiling,
            chain,
            cold_wallet
        );
        self.send_amount(chain, cold_wallet, balance - ceiling)
            .await
            .map(Some)
    }

    async fn sweep_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            for chain in self.chains.connected_chains() {
                match self.sweep_to_cold_wallet(chain).await {
                    Ok(_) => {}
                    Err(e) if e.should_alert() => {
                        error!(kind = e.kind(), "Escalation: sweep on {} failed: {}", chain, e);
                        crate::metrics::record_escalation(e.kind());
                    }
                    Err(e) => warn!("Sweep on {} failed: {}", chain, e),
                }
            }
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    pub fn ledger(&self) -> &Arc<TxLedger> {
        &self.ledger
    }

    pub fn engines(&self) -> &[Arc<RelayEngine>] {
        &self.engines
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Local relay state of an origin swap in every engine that knows it
    pub fn relay_states(&self, origin_swap_id: &SwapId) -> Vec<EngineState> {
        self.engines
            .iter()
            .filter_map(|engine| {
                engine.state(origin_swap_id).map(|state| EngineState {
                    origin: engine.origin_chain(),
                    destination: engine.dest_chain(),
                    state,
                })
            })
            .collect()
    }
}

fn config_error(e: anyhow::Error) -> DeputyError {
    DeputyError::Config(format!("{:#}", e))
}

fn node_for(name: &str, chain: &ChainConfig) -> Arc<dyn NodeClient> {
    match &chain.gateway_url {
        Some(url) => {
            info!("Chain {} uses gateway {}", name, url);
            Arc::new(GatewayNode::new(
                chain.kind,
                url,
                &chain.deputy_address,
                chain.request_timeout(),
            ))
        }
        None => {
            let ledger = MemoryLedger::new(chain.kind, &chain.denom, LedgerFees::default());
            ledger.credit(&chain.deputy_address, u128::from(chain.simulated_balance));
            ledger.node(&chain.deputy_address)
        }
    }
}

fn executor_for(
    kind: ChainKind,
    node: Arc<dyn NodeClient>,
    settings: ExecutorSettings,
) -> DeputyResult<Arc<dyn ChainExecutor>> {
    Ok(match kind {
        ChainKind::Bnb => Arc::new(BnbExecutor::new(node, settings)?),
        ChainKind::Kava => Arc::new(KavaExecutor::new(node, settings)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::derive_address;
    use crate::store::MemoryTxStore;

    fn settings(bnb_deputy: &str, kava_deputy: &str, cold: &str) -> Settings {
        Settings::parse(&format!(
            r#"
            [deputy]
            instance_id = "service-test"
            poll_interval_ms = 100
            confirm_timeout_secs = 5
            visibility_timeout_secs = 5
            claim_timeout_secs = 5
            close_timeout_secs = 5
            recovery_timeout_secs = 1
            redrive_interval_secs = 1
            health_check_interval_secs = 30

            [database]
            url = "sqlite::memory:"
            max_connections = 1

            [api]
            host = "127.0.0.1"
            port = 0

            [metrics]
            enabled = false
            port = 0

            [chains.bnb]
            kind = "bnb"
            deputy_address = "{bnb_deputy}"
            address_prefix = "bnb"
            denom = "BNB"
            expiry = {{ blocks = 360 }}

            [chains.kava]
            kind = "kava"
            deputy_address = "{kava_deputy}"
            address_prefix = "kava"
            denom = "bnb"
            expiry = {{ blocks = 250 }}
            cold_wallet = "{cold}"
            hot_wallet_ceiling = 1000

            [[pairs]]
            origin = "bnb"
            destination = "kava"

            [[pairs]]
            origin = "kava"
            destination = "bnb"
            "#
        ))
        .unwrap()
    }

    struct Fixture {
        service: DeputyService,
        kava: Arc<MemoryLedger>,
        kava_deputy: String,
        cold: String,
    }

    async fn fixture() -> Fixture {
        let bnb_deputy = derive_address("bnb", "deputy").unwrap();
        let kava_deputy = derive_address("kava", "deputy").unwrap();
        let cold = derive_address("kava", "cold").unwrap();
        let bnb = MemoryLedger::new(ChainKind::Bnb, "BNB", LedgerFees::default());
        let kava = MemoryLedger::new(ChainKind::Kava, "bnb", LedgerFees::default());

        let mut nodes: HashMap<ChainKind, Arc<dyn NodeClient>> = HashMap::new();
        nodes.insert(ChainKind::Bnb, bnb.node(&bnb_deputy));
        nodes.insert(ChainKind::Kava, kava.node(&kava_deputy));

        let service = DeputyService::build(
            settings(&bnb_deputy, &kava_deputy, &cold),
            Arc::new(MemoryTxStore::new()),
            nodes,
        )
        .await
        .unwrap();
        Fixture {
            service,
            kava,
            kava_deputy,
            cold,
        }
    }

    #[tokio::test]
    async fn builds_one_engine_per_pair() {
        let f = fixture().await;
        let pairs: Vec<_> = f
            .service
            .engines()
            .iter()
            .map(|e| (e.origin_chain(), e.dest_chain()))
            .collect();
        assert_eq!(
            pairs,
            [(ChainKind::Bnb, ChainKind::Kava), (ChainKind::Kava, ChainKind::Bnb)]
        );
        assert_eq!(
            f.service.chains().connected_chains(),
            [ChainKind::Bnb, ChainKind::Kava]
        );
    }

    #[tokio::test]
    async fn send_amount_records_and_confirms() {
        let f = fixture().await;
        f.kava.credit(&f.kava_deputy, 500);
        let user = derive_address("kava", "user").unwrap();

        let record = f.service.send_amount(ChainKind::Kava, &user, 200).await.unwrap();
        assert_eq!(record.intent, TxIntent::PlainSend);
        assert_eq!(record.status, TxSentStatus::Success);
        assert_eq!(f.kava.balance_of(&user), 200);
        assert_eq!(
            f.service.ledger().get(&record.tx_hash).await.unwrap().unwrap().status,
            TxSentStatus::Success
        );
    }

    #[tokio::test]
    async fn sweeps_only_above_ceiling() {
        let f = fixture().await;
        f.kava.credit(&f.kava_deputy, 800);
        assert!(f
            .service
            .sweep_to_cold_wallet(ChainKind::Kava)
            .await
            .unwrap()
            .is_none());

        f.kava.credit(&f.kava_deputy, 700);
        let record = f
            .service
            .sweep_to_cold_wallet(ChainKind::Kava)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TxSentStatus::Success);
        assert_eq!(f.kava.balance_of(&f.cold), 500);
        assert_eq!(f.kava.balance_of(&f.kava_deputy), 1_000);

        // no cold wallet configured for bnb
        assert!(f
            .service
            .sweep_to_cold_wallet(ChainKind::Bnb)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn start_runs_once() {
        let f = fixture().await;
        let service = Arc::new(f.service);
        tokio_test::assert_ok!(service.start().await);
        let err = tokio_test::assert_err!(service.start().await);
        assert!(matches!(err, DeputyError::Internal(_)));
        service.stop().await;
        assert!(service.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn open_relays_resume_on_their_pair() {
        let f = fixture().await;
        let bnb_deputy = derive_address("bnb", "deputy").unwrap();
        let swap = |chain: ChainKind, sender: &str, other_deputy: &str| Swap {
            chain,
            random_number_hash: [3; 32],
            timestamp: 1_600_000_003,
            sender: sender.to_string(),
            sender_other_chain: other_deputy.to_string(),
            recipient: "deputy".to_string(),
            recipient_other_chain: "receiver".to_string(),
            amount: 10_000,
            expiry: crate::chain::Expiry::Height(500),
            height: 1,
        };
        let ledger = f.service.ledger();
        let user = derive_address("kava", "user").unwrap();
        ledger
            .track_relay(&SwapId([1; 32]), &swap(ChainKind::Kava, &user, &bnb_deputy))
            .await
            .unwrap();
        // routed to a deputy this service does not run
        ledger
            .track_relay(&SwapId([2; 32]), &swap(ChainKind::Kava, &user, "bnb1stranger"))
            .await
            .unwrap();

        assert_eq!(f.service.resume_open_relays().await.unwrap(), 1);
        let held: Vec<_> = f
            .service
            .engines()
            .iter()
            .map(|e| (e.origin_chain(), e.held_count()))
            .collect();
        assert_eq!(held, [(ChainKind::Bnb, 0), (ChainKind::Kava, 1)]);
    }
}
