//! SQLite transaction store

use super::{check_transition, TxIntent, TxRecord, TxStats, TxStore};
use crate::chain::{ChainKind, Swap, SwapId, TxSentStatus};
use crate::config::DatabaseConfig;
use crate::error::{DeputyError, DeputyResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

const RECORD_COLUMNS: &str =
    "tx_hash, chain, intent, related_swap_id, submitted_at, status";

/// Transaction store persisted in SQLite
pub struct SqliteTxStore {
    pool: SqlitePool,
}

impl SqliteTxStore {
    /// Open (creating if missing) the database and run migrations
    pub async fn connect(config: &DatabaseConfig) -> DeputyResult<Self> {
        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to :memory: is its own database
        let max_connections = if in_memory { 1 } else { config.max_connections };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create tables inline
    pub async fn run_migrations(&self) -> DeputyResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain TEXT PRIMARY KEY,
                next_height INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tx_records (
                tx_hash TEXT PRIMARY KEY,
                chain TEXT NOT NULL,
                intent TEXT NOT NULL,
                related_swap_id TEXT,
                submitted_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                resolved_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // at most one pending/success record per (intent, swap)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_records_active_key
            ON tx_records (intent, related_swap_id)
            WHERE status IN ('pending', 'success') AND related_swap_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tx_records_status
            ON tx_records (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relays (
                origin_swap_id TEXT PRIMARY KEY,
                origin_chain TEXT NOT NULL,
                swap TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> DeputyResult<TxRecord> {
        let related_swap_id: Option<String> = row.try_get("related_swap_id")?;
        Ok(TxRecord {
            tx_hash: row.try_get("tx_hash")?,
            chain: row.try_get::<String, _>("chain")?.parse()?,
            intent: row.try_get::<String, _>("intent")?.parse()?,
            related_swap_id: related_swap_id.map(|id| id.parse()).transpose()?,
            submitted_at: row.try_get::<DateTime<Utc>, _>("submitted_at")?,
            status: row.try_get::<String, _>("status")?.parse()?,
        })
    }
}

#[async_trait]
impl TxStore for SqliteTxStore {
    async fn record(&self, record: &TxRecord) -> DeputyResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tx_records (tx_hash, chain, intent, related_swap_id, submitted_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.tx_hash)
        .bind(record.chain.as_str())
        .bind(record.intent.as_str())
        .bind(record.related_swap_id.map(|id| id.to_hex()))
        .bind(record.submitted_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    "Recorded {} tx {} on {}",
                    record.intent, record.tx_hash, record.chain
                );
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                match record.related_swap_id {
                    Some(swap_id) => Err(DeputyError::DuplicateSubmission {
                        intent: record.intent,
                        swap_id,
                    }),
                    None => Err(DeputyError::Internal(format!(
                        "tx {} already recorded",
                        record.tx_hash
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, tx_hash: &str, status: TxSentStatus) -> DeputyResult<()> {
        if status != TxSentStatus::Pending {
            let result = sqlx::query(
                r#"
                UPDATE tx_records
                SET status = ?1, resolved_at = ?2
                WHERE tx_hash = ?3 AND status = 'pending'
                "#,
            )
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(tx_hash)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                debug!("Tx {} is now {}", tx_hash, status);
                return Ok(());
            }
        }

        // nothing moved: the record is missing, already there, or resolved otherwise
        let current = self
            .get(tx_hash)
            .await?
            .ok_or_else(|| DeputyError::TransactionNotFound {
                tx_hash: tx_hash.to_string(),
            })?;
        check_transition(current.status, status)
    }

    async fn lookup(&self, intent: TxIntent, swap_id: &SwapId) -> DeputyResult<Option<TxRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM tx_records
            WHERE intent = ?1 AND related_swap_id = ?2
            ORDER BY CASE WHEN status = 'failed' THEN 1 ELSE 0 END, submitted_at DESC, rowid DESC
            LIMIT 1
            "#,
            RECORD_COLUMNS
        ))
        .bind(intent.as_str())
        .bind(swap_id.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get(&self, tx_hash: &str) -> DeputyResult<Option<TxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tx_records WHERE tx_hash = ?1",
            RECORD_COLUMNS
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn pending(&self) -> DeputyResult<Vec<TxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tx_records WHERE status = 'pending' ORDER BY submitted_at, rowid",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn records_for_swap(&self, swap_id: &SwapId) -> DeputyResult<Vec<TxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tx_records WHERE related_swap_id = ?1 ORDER BY submitted_at, rowid",
            RECORD_COLUMNS
        ))
        .bind(swap_id.to_hex())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn get_checkpoint(&self, chain: ChainKind) -> DeputyResult<Option<u64>> {
        let row = sqlx::query("SELECT next_height FROM chain_checkpoints WHERE chain = ?1")
            .bind(chain.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("next_height") as u64))
    }

    async fn save_checkpoint(&self, chain: ChainKind, next_height: u64) -> DeputyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, next_height, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (chain)
            DO UPDATE SET next_height = excluded.next_height, updated_at = excluded.updated_at
            "#,
        )
        .bind(chain.as_str())
        .bind(next_height as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for chain {}: height {}", chain, next_height);
        Ok(())
    }

    async fn track_relay(&self, origin_swap_id: &SwapId, swap: &Swap) -> DeputyResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO relays (origin_swap_id, origin_chain, swap, started_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (origin_swap_id) DO NOTHING
            "#,
        )
        .bind(origin_swap_id.to_hex())
        .bind(swap.chain.as_str())
        .bind(serde_json::to_string(swap)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!("Tracking relay of {} swap {}", swap.chain, origin_swap_id);
        }
        Ok(())
    }

    async fn finish_relay(&self, origin_swap_id: &SwapId) -> DeputyResult<()> {
        sqlx::query(
            "UPDATE relays SET finished_at = ?1 WHERE origin_swap_id = ?2 AND finished_at IS NULL",
        )
        .bind(Utc::now())
        .bind(origin_swap_id.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_relays(&self) -> DeputyResult<Vec<Swap>> {
        let rows = sqlx::query(
            "SELECT swap FROM relays WHERE finished_at IS NULL ORDER BY started_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> DeputyResult<Swap> {
                let swap: String = row.try_get("swap")?;
                Ok(serde_json::from_str(&swap)?)
            })
            .collect()
    }

    async fn stats(&self) -> DeputyResult<TxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS success,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
            FROM tx_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TxStats {
            pending: row.get::<i64, _>("pending") as u64,
            success: row.get::<i64, _>("success") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }

    async fn health_check(&self) -> DeputyResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
