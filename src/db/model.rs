//! Row models as stored in SQLite.
//!
//! Timestamps are INTEGER unix milliseconds and operations are upper-case
//! TEXT; conversion into `crate::model` types happens here so the stores
//! stay focused on SQL.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::FromRow;

use crate::error::{StoreError, StoreResult};
use crate::model::{MutationRecord, SyncOperation, SyncRecord};

pub(crate) const SYNC_STATE_COLUMNS: &str = "entity_type, entity_id, remote_id, last_synced_at, \
     dirty, pending_operation, attempts, last_error, updated_at";

pub(crate) const PENDING_ACTION_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, \
     priority, created_at, retry_count, last_attempt_at, last_error, requires_network, revision";

#[derive(Debug, Clone, FromRow)]
pub struct SyncStateRow {
    pub entity_type: String,
    pub entity_id: i64,
    pub remote_id: Option<String>,
    pub last_synced_at: Option<i64>,
    pub dirty: bool,
    pub pending_operation: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PendingActionRow {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub operation: String,
    pub payload: Vec<u8>,
    pub priority: i32,
    pub created_at: i64,
    pub retry_count: i32,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub requires_network: bool,
    pub revision: i64,
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(table: &'static str, ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt {
            table,
            reason: format!("timestamp {} out of range", ms),
        })
}

fn parse_operation(table: &'static str, value: &str) -> StoreResult<SyncOperation> {
    SyncOperation::parse_operation(value).ok_or_else(|| StoreError::Corrupt {
        table,
        reason: format!("unknown operation {}", value),
    })
}

impl TryFrom<SyncStateRow> for SyncRecord {
    type Error = StoreError;

    fn try_from(row: SyncStateRow) -> StoreResult<Self> {
        const TABLE: &str = "sync_state";
        Ok(SyncRecord {
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            remote_id: row.remote_id,
            last_synced_at: row
                .last_synced_at
                .map(|ms| from_millis(TABLE, ms))
                .transpose()?,
            dirty: row.dirty,
            pending_operation: row
                .pending_operation
                .as_deref()
                .map(|op| parse_operation(TABLE, op))
                .transpose()?,
            attempts: row.attempts,
            last_error: row.last_error,
            updated_at: from_millis(TABLE, row.updated_at)?,
        })
    }
}

impl TryFrom<PendingActionRow> for MutationRecord {
    type Error = StoreError;

    fn try_from(row: PendingActionRow) -> StoreResult<Self> {
        const TABLE: &str = "pending_actions";
        Ok(MutationRecord {
            id: row.id,
            operation: parse_operation(TABLE, &row.operation)?,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            payload: row.payload,
            priority: row.priority,
            created_at: from_millis(TABLE, row.created_at)?,
            retry_count: row.retry_count,
            last_attempt_at: row
                .last_attempt_at
                .map(|ms| from_millis(TABLE, ms))
                .transpose()?,
            last_error: row.last_error,
            requires_network: row.requires_network,
            revision: row.revision,
        })
    }
}

pub(crate) fn into_records<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_operation() {
        let row = PendingActionRow {
            id: 1,
            entity_type: "TRIP".into(),
            entity_id: 1,
            operation: "MERGE".into(),
            payload: vec![],
            priority: 0,
            created_at: 0,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            requires_network: true,
            revision: 0,
        };
        let err = MutationRecord::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { table: "pending_actions", .. }));
    }

    #[test]
    fn millis_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
        assert_eq!(from_millis("t", to_millis(ts)).unwrap(), ts);
    }
}
