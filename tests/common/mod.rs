//! Two simulated ledgers, a deputy service over them, and users acting on both chains

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use swap_deputy::chain::memory::{derive_address, LedgerFees, MemoryLedger};
use swap_deputy::chain::{
    bnb, kava, random_number_hash, BnbExecutor, ChainExecutor, ChainKind, ExecutorSettings,
    ExpiryWindow, HtltRequest, KavaExecutor, NodeClient, OnChainSwap, SwapId, SwapStatus,
};
use swap_deputy::config::Settings;
use swap_deputy::store::TxStore;
use swap_deputy::DeputyService;

pub const FIXED_FEE: u128 = 5_000;
pub const DEPUTY_CUSTODY: u128 = 10_000_000;

pub fn fees() -> LedgerFees {
    LedgerFees {
        htlt: 40,
        claim: 20,
        refund: 30,
        send: 10,
    }
}

pub struct Chains {
    pub bnb: Arc<MemoryLedger>,
    pub kava: Arc<MemoryLedger>,
    pub bnb_deputy: String,
    pub kava_deputy: String,
}

impl Chains {
    /// Fresh ledgers with a funded deputy on both chains
    pub fn new() -> Self {
        let chains = Self {
            bnb: MemoryLedger::new(ChainKind::Bnb, "BNB", fees()),
            kava: MemoryLedger::new(ChainKind::Kava, "bnb", fees()),
            bnb_deputy: derive_address("bnb", "deputy").unwrap(),
            kava_deputy: derive_address("kava", "deputy").unwrap(),
        };
        chains.bnb.credit(&chains.bnb_deputy, DEPUTY_CUSTODY);
        chains.kava.credit(&chains.kava_deputy, DEPUTY_CUSTODY);
        chains
    }

    pub fn settings(&self, database_url: &str) -> Settings {
        Settings::parse(&format!(
            r#"
            [deputy]
            instance_id = "deputy-it"
            poll_interval_ms = 10
            max_backoff_ms = 50
            confirm_timeout_secs = 30
            visibility_timeout_secs = 30
            claim_timeout_secs = 120
            close_timeout_secs = 120
            recovery_timeout_secs = 5
            redrive_interval_secs = 1
            health_check_interval_secs = 30
            rescan_blocks = 10000

            [database]
            url = "{database_url}"
            max_connections = 2

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

            [[pairs]]
            origin = "bnb"
            destination = "kava"
            fixed_fee = {FIXED_FEE}

            [[pairs]]
            origin = "kava"
            destination = "bnb"
            fixed_fee = {FIXED_FEE}
            "#,
            bnb_deputy = self.bnb_deputy,
            kava_deputy = self.kava_deputy,
        ))
        .unwrap()
    }

    pub async fn service(&self, store: Arc<dyn TxStore>) -> Arc<DeputyService> {
        let mut nodes: HashMap<ChainKind, Arc<dyn NodeClient>> = HashMap::new();
        nodes.insert(ChainKind::Bnb, self.bnb.node(&self.bnb_deputy));
        nodes.insert(ChainKind::Kava, self.kava.node(&self.kava_deputy));
        Arc::new(
            DeputyService::build(self.settings("sqlite::memory:"), store, nodes)
                .await
                .unwrap(),
        )
    }

    /// A user with an account on both chains
    pub fn user(&self, label: &str, bnb_funds: u128, kava_funds: u128) -> User {
        let bnb_address = derive_address("bnb", label).unwrap();
        let kava_address = derive_address("kava", label).unwrap();
        self.bnb.credit(&bnb_address, bnb_funds);
        self.kava.credit(&kava_address, kava_funds);

        let bnb = BnbExecutor::new(
            self.bnb.node(&bnb_address),
            ExecutorSettings {
                deputy_address: bnb_address.clone(),
                address_prefix: "bnb".to_string(),
                denom: "BNB".to_string(),
            },
        )
        .unwrap();
        let kava = KavaExecutor::new(
            self.kava.node(&kava_address),
            ExecutorSettings {
                deputy_address: kava_address.clone(),
                address_prefix: "kava".to_string(),
                denom: "bnb".to_string(),
            },
        )
        .unwrap();
        User {
            bnb,
            kava,
            bnb_address,
            kava_address,
        }
    }
}

/// Both legs of a swap a user opened towards the deputy
#[derive(Debug, Clone, Copy)]
pub struct OpenedSwap {
    pub secret: [u8; 32],
    pub origin_id: SwapId,
    pub mirror_id: SwapId,
}

pub struct User {
    pub bnb: BnbExecutor,
    pub kava: KavaExecutor,
    pub bnb_address: String,
    pub kava_address: String,
}

impl User {
    /// Lock `amount` on Binance Chain for the deputy, to be received on Kava
    pub async fn swap_bnb_to_kava(&self, chains: &Chains, seed: u8, amount: u128) -> OpenedSwap {
        self.swap_bnb_to_kava_spanning(chains, seed, amount, bnb::MIN_HEIGHT_SPAN)
            .await
    }

    /// Same as `swap_bnb_to_kava`, expiring `span` blocks after creation
    pub async fn swap_bnb_to_kava_spanning(
        &self,
        chains: &Chains,
        seed: u8,
        amount: u128,
        span: u64,
    ) -> OpenedSwap {
        let secret = [seed; 32];
        let timestamp = 1_600_000_000 + seed as i64;
        let rnh = random_number_hash(&secret, timestamp);
        self.bnb
            .htlt(HtltRequest {
                random_number_hash: rnh,
                timestamp,
                expiry: ExpiryWindow::Blocks(span),
                recipient: chains.bnb_deputy.clone(),
                sender_other_chain: chains.kava_deputy.clone(),
                recipient_other_chain: self.kava_address.clone(),
                amount,
            })
            .await
            .unwrap();

        OpenedSwap {
            secret,
            origin_id: bnb::calc_swap_id(&rnh, &self.bnb_address, &chains.kava_deputy, "bnb")
                .unwrap(),
            mirror_id: kava::calc_swap_id(&rnh, &chains.kava_deputy, &self.bnb_address, "kava")
                .unwrap(),
        }
    }

    /// Lock `amount` on Kava for the deputy, to be received on Binance Chain
    pub async fn swap_kava_to_bnb(&self, chains: &Chains, seed: u8, amount: u128) -> OpenedSwap {
        let secret = [seed; 32];
        let timestamp = 1_600_000_000 + seed as i64;
        let rnh = random_number_hash(&secret, timestamp);
        self.kava
            .htlt(HtltRequest {
                random_number_hash: rnh,
                timestamp,
                expiry: ExpiryWindow::Blocks(250),
                recipient: chains.kava_deputy.clone(),
                sender_other_chain: chains.bnb_deputy.clone(),
                recipient_other_chain: self.bnb_address.clone(),
                amount,
            })
            .await
            .unwrap();

        OpenedSwap {
            secret,
            origin_id: kava::calc_swap_id(&rnh, &self.kava_address, &chains.bnb_deputy, "kava")
                .unwrap(),
            mirror_id: bnb::calc_swap_id(&rnh, &chains.bnb_deputy, &self.kava_address, "bnb")
                .unwrap(),
        }
    }

    /// Claim the mirror on Kava, revealing the secret
    pub async fn claim_on_kava(&self, swap: &OpenedSwap) {
        self.kava.claim(swap.mirror_id, swap.secret).await.unwrap();
    }

    /// Claim the mirror on Binance Chain, revealing the secret
    pub async fn claim_on_bnb(&self, swap: &OpenedSwap) {
        self.bnb.claim(swap.mirror_id, swap.secret).await.unwrap();
    }
}

pub fn status(ledger: &MemoryLedger, swap_id: &SwapId) -> Option<SwapStatus> {
    ledger.swap(swap_id).map(|swap: OnChainSwap| swap.status)
}

/// Poll `condition` every 10ms, panicking after `attempts` polls
pub async fn wait_for(what: &str, attempts: u32, mut condition: impl FnMut() -> bool) {
    for _ in 0..attempts {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
