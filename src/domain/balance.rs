use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::message::BalanceUpdate;

/// Authoritative balance row, one per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BalanceState {
    #[sqlx(rename = "user_id")]
    pub entity_id: i64,
    pub amount: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl BalanceState {
    pub fn from_update(update: &BalanceUpdate) -> Self {
        Self {
            entity_id: update.entity_id,
            amount: update.amount,
            version: update.version,
            updated_at: update.timestamp,
        }
    }
}

/// Append-only record of an accepted update, unique per `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceEvent {
    pub entity_id: i64,
    pub amount: Decimal,
    pub version: i64,
    pub event_timestamp: DateTime<Utc>,
    pub event_id: String,
}

impl BalanceEvent {
    pub fn from_update(update: &BalanceUpdate) -> Self {
        Self {
            entity_id: update.entity_id,
            amount: update.amount,
            version: update.version,
            event_timestamp: update.timestamp,
            event_id: update.event_id.clone(),
        }
    }
}

/// Cache value. Never authoritative, always rebuildable from [`BalanceState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBalance {
    pub amount: Decimal,
    pub version: i64,
    pub observed_at: DateTime<Utc>,
}

impl From<&BalanceState> for CachedBalance {
    fn from(state: &BalanceState) -> Self {
        Self {
            amount: state.amount,
            version: state.version,
            observed_at: Utc::now(),
        }
    }
}
