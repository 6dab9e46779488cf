use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Balance-change message as the producer puts it on the queue.
///
/// The producer has shipped two spellings for the amount and for the event
/// time over its lifetime; both are accepted here and collapsed into a
/// [`BalanceUpdate`] by [`decode_update`]. `old_amount` and any other extra
/// fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BalanceMessage {
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub new_amount: Option<Decimal>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("payload is not a valid balance message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("message has no user_id")]
    MissingEntityId,
    #[error("{field} value {value} does not fit a store column")]
    OutOfRange { field: &'static str, value: u64 },
}

/// Normalized update, the only shape the pipeline works with past the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub entity_id: i64,
    pub amount: Decimal,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    /// Empty when the producer did not supply one; idempotency checks are
    /// skipped for such updates.
    pub event_id: String,
    /// Set when the message carried no usable event time and `timestamp`
    /// is the processing time instead.
    pub timestamp_fallback: bool,
}

impl BalanceUpdate {
    pub fn has_event_id(&self) -> bool {
        !self.event_id.is_empty()
    }

    pub fn has_negative_amount(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }
}

impl BalanceMessage {
    /// `new_amount` wins when it is present and non-zero.
    pub fn resolved_amount(&self) -> Decimal {
        match self.new_amount {
            Some(amount) if !amount.is_zero() => amount,
            _ => self.amount.or(self.new_amount).unwrap_or(Decimal::ZERO),
        }
    }

    pub fn raw_timestamp(&self) -> Option<&str> {
        [self.timestamp.as_deref(), self.updated_at.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|ts| !ts.is_empty())
    }
}

/// Parses the event-time formats producers are known to emit.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, SQL_DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Decodes a raw queue payload into a validated [`BalanceUpdate`].
///
/// `received_at` stands in for the event time when the message has none or
/// it cannot be parsed.
pub fn decode_update(body: &[u8], received_at: DateTime<Utc>) -> Result<BalanceUpdate, MessageError> {
    let message: BalanceMessage = serde_json::from_slice(body)?;

    let user_id = match message.user_id {
        Some(id) if id > 0 => id,
        _ => return Err(MessageError::MissingEntityId),
    };
    let entity_id = i64::try_from(user_id).map_err(|_| MessageError::OutOfRange {
        field: "user_id",
        value: user_id,
    })?;
    let version = i64::try_from(message.version).map_err(|_| MessageError::OutOfRange {
        field: "version",
        value: message.version,
    })?;

    let parsed = message.raw_timestamp().and_then(parse_timestamp);
    let timestamp_fallback = parsed.is_none();

    Ok(BalanceUpdate {
        entity_id,
        amount: message.resolved_amount(),
        version,
        timestamp: parsed.unwrap_or(received_at),
        event_id: message.event_id.clone().unwrap_or_default(),
        timestamp_fallback,
    })
}
