//! `NodeClient` over the JSON/HTTP signing gateway
//!
//! Endpoints:
//! - POST /txs
//! - GET /txs/{hash}
//! - GET /swaps/{id}
//! - GET /swaps?recipient=&from_height=&to_height=
//! - GET /blocks/latest
//! - GET /accounts/{address}/balance?denom=

use super::node::{BlockInfo, NodeClient, OnChainSwap, TxMsg, TxOutcome};
use super::{ChainKind, SwapId};
use crate::error::{DeputyError, DeputyResult};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct BroadcastResponse {
    tx_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BalanceResponse {
    /// Decimal string, base units
    amount: String,
}

/// Gateway that holds the deputy key for one chain, signs and sequences
pub struct GatewayNode {
    chain: ChainKind,
    base_url: String,
    signer: String,
    client: reqwest::Client,
}

impl GatewayNode {
    pub fn new(chain: ChainKind, base_url: &str, signer: &str, timeout: Duration) -> Self {
        Self {
            chain,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer: signer.to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn unavailable(&self, message: impl Into<String>) -> DeputyError {
        DeputyError::ChainConnection {
            chain: self.chain,
            message: message.into(),
        }
    }

    /// GET returning `None` on 404
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> DeputyResult<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unavailable(format!("GET {} failed: {}", path, e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("GET {} returned {}: {}", path, status, body)));
        }
        resp.json()
            .await
            .map(Some)
            .map_err(|e| self.unavailable(format!("GET {}: bad response: {}", path, e)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> DeputyResult<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| self.unavailable(format!("GET {} returned 404", path)))
    }
}

#[async_trait]
impl NodeClient for GatewayNode {
    fn signer(&self) -> &str {
        &self.signer
    }

    async fn broadcast(&self, msg: TxMsg) -> DeputyResult<String> {
        let rejected = |message: String| DeputyError::Submission {
            chain: self.chain,
            message,
        };

        let url = format!("{}/txs", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&msg)
            .send()
            .await
            .map_err(|e| rejected(format!("broadcast failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(rejected(format!("gateway returned {}: {}", status, body)));
        }

        let body: BroadcastResponse = resp
            .json()
            .await
            .map_err(|e| rejected(format!("bad broadcast response: {}", e)))?;
        debug!("Broadcast {} on {}: {}", msg.kind, self.chain, body.tx_hash);
        Ok(body.tx_hash)
    }

    async fn tx_outcome(&self, tx_hash: &str) -> DeputyResult<Option<TxOutcome>> {
        self.get_optional(&format!("/txs/{}", tx_hash)).await
    }

    async fn swap(&self, swap_id: &SwapId) -> DeputyResult<Option<OnChainSwap>> {
        self.get_optional(&format!("/swaps/{}", swap_id)).await
    }

    async fn swaps_to(
        &self,
        recipient: &str,
        from_height: u64,
        to_height: u64,
    ) -> DeputyResult<Vec<OnChainSwap>> {
        self.get(&format!(
            "/swaps?recipient={}&from_height={}&to_height={}",
            recipient, from_height, to_height
        ))
        .await
    }

    async fn latest_block(&self) -> DeputyResult<BlockInfo> {
        self.get("/blocks/latest").await
    }

    async fn balance(&self, address: &str, denom: &str) -> DeputyResult<u128> {
        let body: BalanceResponse = self
            .get(&format!("/accounts/{}/balance?denom={}", address, denom))
            .await?;
        body.amount
            .parse()
            .map_err(|_| self.unavailable(format!("bad balance amount {}", body.amount)))
    }
}
