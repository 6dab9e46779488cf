use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::debug;

use crate::domain::{BalanceEvent, BalanceState};

/// SQLSTATEs that mean "another transaction got in the way, try again".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const ADMIN_SHUTDOWN: &str = "57P01";
const CANNOT_CONNECT_NOW: &str = "57P03";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("{operation} lost a lock/serialization conflict ({code})")]
    Conflict {
        operation: &'static str,
        code: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} could not reach the store: {source}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} failed: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// Classifies a driver error by SQLSTATE and error kind.
    pub fn from_sqlx(operation: &'static str, err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
            _ => None,
        };

        match (code.as_deref(), &err) {
            (Some(c @ (SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE)), _) => {
                StoreError::Conflict {
                    operation,
                    code: c.to_string(),
                    source: err,
                }
            }
            (Some(c), _) if c.starts_with("08") || c == ADMIN_SHUTDOWN || c == CANNOT_CONNECT_NOW => {
                StoreError::Unavailable { operation, source: err }
            }
            (None, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed) => {
                StoreError::Unavailable { operation, source: err }
            }
            _ => StoreError::Database { operation, source: err },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Timeout { .. }
            | StoreError::Conflict { .. }
            | StoreError::Unavailable { .. } => ErrorClass::Transient,
            StoreError::Database { .. } => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub events_inserted: u64,
    pub balances_applied: u64,
}

/// The only component that talks to the authoritative store.
///
/// Implementations bound every call by their own deadline and report an
/// overrun as [`StoreError::Timeout`]; they never retry internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceRepository: Send + Sync {
    /// Inserts events; a row whose `event_id` is already logged is skipped.
    async fn save_events_batch(&self, events: &[BalanceEvent]) -> Result<u64, StoreError>;

    /// Upserts balances, replacing a row only when the incoming version is
    /// strictly greater than the stored one.
    async fn save_balances_batch(&self, balances: &[BalanceState]) -> Result<u64, StoreError>;

    /// `save_events_batch` and `save_balances_batch` in one transaction.
    async fn commit_batch(
        &self,
        events: &[BalanceEvent],
        balances: &[BalanceState],
    ) -> Result<CommitOutcome, StoreError>;

    /// Which of `event_ids` are already present in the event log.
    async fn existing_event_ids(&self, event_ids: &[String]) -> Result<HashSet<String>, StoreError>;

    async fn get_by_ids(&self, entity_ids: &[i64]) -> Result<Vec<BalanceState>, StoreError>;

    /// Balances ordered by entity id.
    async fn get_all_paged(&self, limit: i64, offset: i64) -> Result<Vec<BalanceState>, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;
}

#[derive(Clone)]
pub struct PgBalanceRepository {
    pool: PgPool,
    operation_timeout: Duration,
}

impl PgBalanceRepository {
    pub fn new(pool: PgPool, operation_timeout: Duration) -> Self {
        Self {
            pool,
            operation_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(|e| StoreError::from_sqlx(operation, e)),
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout: self.operation_timeout,
            }),
        }
    }

    async fn insert_events(
        conn: &mut PgConnection,
        events: &[BalanceEvent],
    ) -> Result<u64, sqlx::Error> {
        if events.is_empty() {
            return Ok(0);
        }

        let entity_ids: Vec<i64> = events.iter().map(|e| e.entity_id).collect();
        let amounts: Vec<Decimal> = events.iter().map(|e| e.amount).collect();
        let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
        let timestamps: Vec<DateTime<Utc>> = events.iter().map(|e| e.event_timestamp).collect();
        let event_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO balance_events (user_id, amount, version, event_timestamp, event_id)
            SELECT * FROM UNNEST($1::bigint[], $2::numeric[], $3::bigint[], $4::timestamptz[], $5::text[])
            ON CONFLICT (event_id) WHERE event_id <> '' DO NOTHING
            "#,
        )
        .bind(&entity_ids)
        .bind(&amounts)
        .bind(&versions)
        .bind(&timestamps)
        .bind(&event_ids)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() < events.len() as u64 {
            debug!(
                "{} events were already logged and skipped",
                events.len() as u64 - result.rows_affected()
            );
        }
        Ok(result.rows_affected())
    }

    async fn upsert_balances(
        conn: &mut PgConnection,
        balances: &[BalanceState],
    ) -> Result<u64, sqlx::Error> {
        if balances.is_empty() {
            return Ok(0);
        }

        let entity_ids: Vec<i64> = balances.iter().map(|b| b.entity_id).collect();
        let amounts: Vec<Decimal> = balances.iter().map(|b| b.amount).collect();
        let versions: Vec<i64> = balances.iter().map(|b| b.version).collect();
        let updated_ats: Vec<DateTime<Utc>> = balances.iter().map(|b| b.updated_at).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO balances (user_id, amount, version, updated_at)
            SELECT * FROM UNNEST($1::bigint[], $2::numeric[], $3::bigint[], $4::timestamptz[])
            ON CONFLICT (user_id) DO UPDATE SET
                amount = EXCLUDED.amount,
                version = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at
            WHERE balances.version < EXCLUDED.version
            "#,
        )
        .bind(&entity_ids)
        .bind(&amounts)
        .bind(&versions)
        .bind(&updated_ats)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BalanceRepository for PgBalanceRepository {
    async fn save_events_batch(&self, events: &[BalanceEvent]) -> Result<u64, StoreError> {
        self.bounded("save_events_batch", async {
            let mut conn = self.pool.acquire().await?;
            Self::insert_events(&mut conn, events).await
        })
        .await
    }

    async fn save_balances_batch(&self, balances: &[BalanceState]) -> Result<u64, StoreError> {
        self.bounded("save_balances_batch", async {
            let mut conn = self.pool.acquire().await?;
            Self::upsert_balances(&mut conn, balances).await
        })
        .await
    }

    async fn commit_batch(
        &self,
        events: &[BalanceEvent],
        balances: &[BalanceState],
    ) -> Result<CommitOutcome, StoreError> {
        self.bounded("commit_batch", async {
            let mut tx = self.pool.begin().await?;
            let events_inserted = Self::insert_events(&mut tx, events).await?;
            let balances_applied = Self::upsert_balances(&mut tx, balances).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(CommitOutcome {
                events_inserted,
                balances_applied,
            })
        })
        .await
    }

    async fn existing_event_ids(&self, event_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if event_ids.is_empty() {
            return Ok(HashSet::new());
        }
        self.bounded("existing_event_ids", async {
            let found: Vec<String> =
                sqlx::query_scalar("SELECT event_id FROM balance_events WHERE event_id = ANY($1)")
                    .bind(event_ids)
                    .fetch_all(&self.pool)
                    .await?;
            Ok::<_, sqlx::Error>(found.into_iter().collect())
        })
        .await
    }

    async fn get_by_ids(&self, entity_ids: &[i64]) -> Result<Vec<BalanceState>, StoreError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.bounded(
            "get_by_ids",
            sqlx::query_as::<_, BalanceState>(
                "SELECT user_id, amount, version, updated_at FROM balances WHERE user_id = ANY($1) ORDER BY user_id",
            )
            .bind(entity_ids)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn get_all_paged(&self, limit: i64, offset: i64) -> Result<Vec<BalanceState>, StoreError> {
        self.bounded(
            "get_all_paged",
            sqlx::query_as::<_, BalanceState>(
                "SELECT user_id, amount, version, updated_at FROM balances ORDER BY user_id LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn count(&self) -> Result<i64, StoreError> {
        self.bounded(
            "count",
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM balances").fetch_one(&self.pool),
        )
        .await
    }
}
