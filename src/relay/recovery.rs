//! Startup resolution of transactions left Pending by a previous run

use crate::chain::{ChainManager, TxSentStatus};
use crate::error::DeputyResult;
use crate::retry::RetryScheduler;
use crate::store::{TxLedger, TxRecord};

use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Still pending after the wait, or not resolvable at all; engines keep
    /// waiting on them instead of resubmitting
    pub unresolved: usize,
}

/// Poll every Pending record's chain until it resolves or `timeout` elapses.
///
/// Runs before any engine starts so that no submission decision is made for a
/// swap whose last broadcast is of unknown fate. Records are resolved
/// concurrently; one that cannot be queried is escalated and counted as
/// unresolved.
pub async fn recover_pending(
    chains: &ChainManager,
    ledger: &TxLedger,
    scheduler: &RetryScheduler,
    timeout: Duration,
    poll_interval: Duration,
) -> DeputyResult<RecoveryReport> {
    let pending = ledger.pending().await?;
    let mut report = RecoveryReport::default();
    if pending.is_empty() {
        return Ok(report);
    }
    info!("Resolving {} pending transactions", pending.len());

    let results = join_all(
        pending
            .iter()
            .map(|record| resolve(chains, ledger, scheduler, record, timeout, poll_interval)),
    )
    .await;

    for (record, result) in pending.iter().zip(results) {
        let swap = record
            .related_swap_id
            .map(|id| format!(" for swap {}", id))
            .unwrap_or_default();
        match result {
            Ok(TxSentStatus::Success) => report.succeeded += 1,
            Ok(TxSentStatus::Failed) => {
                error!(
                    "Escalation: recovered {} tx {} on {} failed{}",
                    record.intent, record.tx_hash, record.chain, swap
                );
                crate::metrics::record_escalation("transaction_failed");
                report.failed += 1;
            }
            Ok(TxSentStatus::Pending) => {
                warn!(
                    "{} tx {} on {} is still pending",
                    record.intent, record.tx_hash, record.chain
                );
                report.unresolved += 1;
            }
            Err(e) => {
                error!(
                    kind = e.kind(),
                    "Escalation: could not resolve {} tx {} on {}{}: {}",
                    record.intent,
                    record.tx_hash,
                    record.chain,
                    swap,
                    e
                );
                crate::metrics::record_escalation(e.kind());
                report.unresolved += 1;
            }
        }
    }

    info!(
        "Recovery done: {} succeeded, {} failed, {} unresolved",
        report.succeeded, report.failed, report.unresolved
    );
    Ok(report)
}

/// Final status of one record, or Pending if it did not resolve in time
async fn resolve(
    chains: &ChainManager,
    ledger: &TxLedger,
    scheduler: &RetryScheduler,
    record: &TxRecord,
    timeout: Duration,
    poll_interval: Duration,
) -> DeputyResult<TxSentStatus> {
    let executor = chains.get(record.chain)?;
    let executor = executor.as_ref();
    let tx_hash = record.tx_hash.as_str();

    let resolved = scheduler
        .wait_until("recovery", timeout, poll_interval, move || async move {
            Ok(executor.get_sent_tx_status(tx_hash).await?.is_final())
        })
        .await?;
    if !resolved {
        return Ok(TxSentStatus::Pending);
    }

    let status = executor.get_sent_tx_status(tx_hash).await?;
    ledger.update_status(tx_hash, status).await?;
    crate::metrics::record_tx_resolved(record.chain, record.intent, status.as_str());
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainKind, MockChainExecutor, SwapId};
    use crate::error::DeputyError;
    use crate::retry::RetryPolicy;
    use crate::store::{MemoryTxStore, TxIntent, TxRecord};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn executor(chain: ChainKind) -> MockChainExecutor {
        let mut mock = MockChainExecutor::new();
        mock.expect_chain().return_const(chain);
        mock.expect_get_sent_tx_status().returning(|hash| {
            Ok(match hash {
                "OK" => TxSentStatus::Success,
                "BAD" => TxSentStatus::Failed,
                "GONE" => {
                    return Err(DeputyError::Internal("tx index pruned".to_string()));
                }
                _ => TxSentStatus::Pending,
            })
        });
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_each_pending_record_on_its_chain() {
        let chains = ChainManager::new();
        chains.register(Arc::new(executor(ChainKind::Bnb)));
        chains.register(Arc::new(executor(ChainKind::Kava)));

        let ledger = TxLedger::new(Arc::new(MemoryTxStore::new()));
        for (hash, chain, intent, swap) in [
            ("OK", ChainKind::Kava, TxIntent::Htlt, Some(SwapId([1; 32]))),
            ("BAD", ChainKind::Bnb, TxIntent::Claim, Some(SwapId([2; 32]))),
            ("SLOW", ChainKind::Bnb, TxIntent::PlainSend, None),
        ] {
            ledger
                .record(&TxRecord::pending(hash, chain, intent, swap))
                .await
                .unwrap();
        }

        let scheduler = RetryScheduler::new(RetryPolicy::default(), Arc::new(RwLock::new(false)));
        let report = recover_pending(
            &chains,
            &ledger,
            &scheduler,
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            RecoveryReport {
                succeeded: 1,
                failed: 1,
                unresolved: 1
            }
        );
        assert_eq!(
            ledger.get("BAD").await.unwrap().unwrap().status,
            TxSentStatus::Failed
        );
        let pending = ledger.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx_hash, "SLOW");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_and_broken_records_do_not_hold_up_the_rest() {
        // no kava executor registered
        let chains = ChainManager::new();
        chains.register(Arc::new(executor(ChainKind::Bnb)));

        let ledger = TxLedger::new(Arc::new(MemoryTxStore::new()));
        for (hash, chain) in [
            ("SLOW1", ChainKind::Bnb),
            ("SLOW2", ChainKind::Bnb),
            ("SLOW3", ChainKind::Bnb),
            ("GONE", ChainKind::Bnb),
            ("ELSEWHERE", ChainKind::Kava),
            ("OK", ChainKind::Bnb),
        ] {
            ledger
                .record(&TxRecord::pending(hash, chain, TxIntent::PlainSend, None))
                .await
                .unwrap();
        }

        let scheduler = RetryScheduler::new(RetryPolicy::default(), Arc::new(RwLock::new(false)));
        let timeout = Duration::from_secs(30);
        let started = tokio::time::Instant::now();
        let report = recover_pending(&chains, &ledger, &scheduler, timeout, Duration::from_secs(1))
            .await
            .unwrap();

        // the slow records waited side by side
        assert!(started.elapsed() < timeout * 2);
        assert_eq!(
            report,
            RecoveryReport {
                succeeded: 1,
                failed: 0,
                unresolved: 5
            }
        );
        assert_eq!(
            ledger.get("OK").await.unwrap().unwrap().status,
            TxSentStatus::Success
        );
        assert_eq!(ledger.pending().await.unwrap().len(), 5);
    }
}
