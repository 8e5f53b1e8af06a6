//! Configuration management for the swap deputy
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::{ChainKind, ExecutorSettings, ExpiryWindow};
use crate::relay::{ConversionRatio, RelayConfig};
use crate::retry::RetryPolicy;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub deputy: DeputyConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeputyConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    pub confirm_timeout_secs: u64,
    pub visibility_timeout_secs: u64,
    pub claim_timeout_secs: u64,
    pub close_timeout_secs: u64,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    pub redrive_interval_secs: u64,
    pub health_check_interval_secs: u64,
    /// Blocks the listeners re-scan below their checkpoint on startup
    #[serde(default)]
    pub rescan_blocks: u64,
    /// Cold wallet sweeps are off when unset
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub kind: ChainKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Signing gateway; without one the chain runs on an in-process simulated ledger
    pub gateway_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub deputy_address: String,
    pub address_prefix: String,
    pub denom: String,
    /// Expiry window of swaps the deputy creates here, `{ blocks = N }` or `{ seconds = N }`
    pub expiry: ExpiryWindow,
    #[serde(default)]
    pub start_height: u64,
    pub cold_wallet: Option<String>,
    /// Custody above this is swept to the cold wallet
    pub hot_wallet_ceiling: Option<u64>,
    /// Deputy funds credited on a simulated ledger
    #[serde(default)]
    pub simulated_balance: u64,
}

impl ChainConfig {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            deputy_address: self.deputy_address.clone(),
            address_prefix: self.address_prefix.clone(),
            denom: self.denom.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// One relay direction, by chain name
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub origin: String,
    pub destination: String,
    #[serde(default)]
    pub fixed_fee: u64,
    #[serde(default)]
    pub ratio: ConversionRatio,
    #[serde(default)]
    pub min_amount: u64,
    pub max_amount: Option<u64>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("DEPUTY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            anyhow::bail!("At least one relay pair must be configured");
        }

        let mut kinds = HashSet::new();
        for (name, chain) in self.enabled_chains() {
            if !kinds.insert(chain.kind) {
                anyhow::bail!("Chain {} is the second enabled {} chain", name, chain.kind);
            }
            if chain.deputy_address.is_empty() {
                anyhow::bail!("Chain {} has no deputy address", name);
            }
            if chain.cold_wallet.is_some() != chain.hot_wallet_ceiling.is_some() {
                anyhow::bail!(
                    "Chain {} needs both cold_wallet and hot_wallet_ceiling to sweep",
                    name
                );
            }
            match chain.gateway_url.as_deref() {
                Some("") => anyhow::bail!("Chain {} has an empty gateway URL", name),
                Some(_) => {}
                None => tracing::warn!("Chain {} has no gateway - using a simulated ledger", name),
            }
        }

        let mut seen = HashSet::new();
        for pair in &self.pairs {
            let origin = self.enabled_chain(&pair.origin)?;
            let destination = self.enabled_chain(&pair.destination)?;
            if origin.kind == destination.kind {
                anyhow::bail!("Pair {} -> {} relays to itself", pair.origin, pair.destination);
            }
            if !seen.insert((origin.kind, destination.kind)) {
                anyhow::bail!("Duplicate pair {} -> {}", pair.origin, pair.destination);
            }
            if let Some(max) = pair.max_amount {
                if pair.min_amount > max {
                    anyhow::bail!(
                        "Pair {} -> {} has min_amount {} above max_amount {}",
                        pair.origin,
                        pair.destination,
                        pair.min_amount,
                        max
                    );
                }
            }
        }

        Ok(())
    }

    fn enabled_chain(&self, name: &str) -> Result<&ChainConfig> {
        match self.chains.get(name) {
            Some(chain) if chain.enabled => Ok(chain),
            Some(_) => anyhow::bail!("Chain {} is disabled", name),
            None => anyhow::bail!("Unknown chain {}", name),
        }
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        let mut chains: Vec<_> = self.chains.iter().filter(|(_, c)| c.enabled).collect();
        chains.sort_by_key(|(_, c)| c.kind);
        chains
    }

    /// Get chain config by kind
    pub fn chain(&self, kind: ChainKind) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.enabled && c.kind == kind)
    }

    /// Origin and destination kinds of a validated pair
    pub fn pair_chains(&self, pair: &PairConfig) -> Result<(ChainKind, ChainKind)> {
        Ok((
            self.enabled_chain(&pair.origin)?.kind,
            self.enabled_chain(&pair.destination)?.kind,
        ))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.deputy.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_interval: Duration::from_millis(self.deputy.max_backoff_ms),
            backoff_factor: self.deputy.backoff_factor,
        }
    }

    /// Parameters of the engine relaying `pair`
    pub fn relay_config(&self, pair: &PairConfig) -> Result<RelayConfig> {
        let destination = self.enabled_chain(&pair.destination)?;
        let deputy = &self.deputy;
        Ok(RelayConfig {
            fixed_fee: u128::from(pair.fixed_fee),
            ratio: pair.ratio,
            dest_expiry: destination.expiry,
            min_amount: u128::from(pair.min_amount),
            max_amount: pair.max_amount.map(u128::from),
            poll_interval: self.poll_interval(),
            confirm_timeout: Duration::from_secs(deputy.confirm_timeout_secs),
            visibility_timeout: Duration::from_secs(deputy.visibility_timeout_secs),
            claim_timeout: Duration::from_secs(deputy.claim_timeout_secs),
            close_timeout: Duration::from_secs(deputy.close_timeout_secs),
            redrive_interval: Duration::from_secs(deputy.redrive_interval_secs),
        })
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;
    Ok(re
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [deputy]
        instance_id = "deputy-test"
        poll_interval_ms = 500
        confirm_timeout_secs = 60
        visibility_timeout_secs = 60
        claim_timeout_secs = 600
        close_timeout_secs = 600
        redrive_interval_secs = 30
        health_check_interval_secs = 30

        [database]
        url = "sqlite::memory:"
        max_connections = 1

        [api]
        host = "127.0.0.1"
        port = 8080

        [metrics]
        enabled = false
        port = 9090

        [chains.bnb]
        kind = "bnb"
        deputy_address = "bnb1deputy"
        address_prefix = "bnb"
        denom = "BNB"
        expiry = { blocks = 360 }

        [chains.kava]
        kind = "kava"
        gateway_url = "http://localhost:1317"
        deputy_address = "kava1deputy"
        address_prefix = "kava"
        denom = "bnb"
        expiry = { seconds = 86400 }
        cold_wallet = "kava1cold"
        hot_wallet_ceiling = 5000000000
    "#;

    fn with_pairs(pairs: &str) -> String {
        format!("{}\n{}", BASE, pairs)
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("DEPUTY_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${DEPUTY_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn parses_pairs_into_relay_configs() {
        let settings = Settings::parse(&with_pairs(
            r#"
            [[pairs]]
            origin = "bnb"
            destination = "kava"
            fixed_fee = 5000
            ratio = "0.995"
            min_amount = 10000
            max_amount = 100000000000

            [[pairs]]
            origin = "kava"
            destination = "bnb"
            "#,
        ))
        .unwrap();

        let names: Vec<_> = settings.enabled_chains().into_iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["bnb", "kava"]);

        let outbound = settings.relay_config(&settings.pairs[0]).unwrap();
        assert_eq!(outbound.fixed_fee, 5_000);
        assert_eq!(outbound.ratio.to_string(), "199/200");
        assert_eq!(outbound.dest_expiry, ExpiryWindow::Seconds(86_400));
        assert_eq!(outbound.max_amount, Some(100_000_000_000));
        assert_eq!(outbound.poll_interval, Duration::from_millis(500));

        let inbound = settings.relay_config(&settings.pairs[1]).unwrap();
        assert!(inbound.ratio.is_one());
        assert_eq!(inbound.dest_expiry, ExpiryWindow::Blocks(360));
        assert_eq!(
            settings.pair_chains(&settings.pairs[1]).unwrap(),
            (ChainKind::Kava, ChainKind::Bnb)
        );
        assert_eq!(
            settings.chain(ChainKind::Kava).unwrap().hot_wallet_ceiling,
            Some(5_000_000_000)
        );
    }

    #[test]
    fn rejects_invalid_pairs() {
        let cases = [
            ("", "relay pair"),
            (
                "[[pairs]]\norigin = \"bnb\"\ndestination = \"bnb\"",
                "relays to itself",
            ),
            (
                "[[pairs]]\norigin = \"bnb\"\ndestination = \"eth\"",
                "Unknown chain",
            ),
            (
                "[[pairs]]\norigin = \"bnb\"\ndestination = \"kava\"\n[[pairs]]\norigin = \"bnb\"\ndestination = \"kava\"",
                "Duplicate pair",
            ),
            (
                "[[pairs]]\norigin = \"bnb\"\ndestination = \"kava\"\nmin_amount = 10\nmax_amount = 5",
                "above max_amount",
            ),
        ];
        for (pairs, expected) in cases {
            let err = Settings::parse(&with_pairs(pairs)).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{:?}: expected {:?}, got {}",
                pairs,
                expected,
                err
            );
        }
    }

    #[test]
    fn shipped_configs_parse() {
        env::set_var("BNB_GATEWAY_URL", "http://bnb-gateway:8080");
        env::set_var("BNB_DEPUTY_ADDRESS", "bnb1qpjjycwc7hn6g5sa4tjvsttqr3p2cv62m2c8l0");
        env::set_var("KAVA_GATEWAY_URL", "http://kava-gateway:8080");
        env::set_var("KAVA_DEPUTY_ADDRESS", "kava1qpjjycwc7hn6g5sa4tjvsttqr3p2cv629mnkgx");

        let deployed = Settings::parse(include_str!("../config/default.toml")).unwrap();
        assert_eq!(
            deployed.chain(ChainKind::Bnb).unwrap().gateway_url.as_deref(),
            Some("http://bnb-gateway:8080")
        );
        for pair in &deployed.pairs {
            let relay = deployed.relay_config(pair).unwrap();
            assert_eq!(relay.fixed_fee, 5_000);
            assert_eq!(relay.min_amount, 10_000);
            assert_eq!(relay.max_amount, Some(1_000_000_000_000));
        }

        let simulated = Settings::parse(include_str!("../config/simulated.toml")).unwrap();
        let kava = simulated.chain(ChainKind::Kava).unwrap();
        assert!(kava.gateway_url.is_none());
        assert_eq!(kava.simulated_balance, 1_000_000_000_000);
        assert_eq!(simulated.relay_config(&simulated.pairs[0]).unwrap().fixed_fee, 5_000);
    }

    #[test]
    fn rejects_non_positive_ratio() {
        let err = Settings::parse(&with_pairs(
            "[[pairs]]\norigin = \"bnb\"\ndestination = \"kava\"\nratio = \"0\"",
        ))
        .unwrap_err();
        assert!(format!("{:#}", err).contains("not positive"));
    }
}
