//! `SyncStateStore`: one bookkeeping row per tracked entity.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::instrument;

use super::model::{into_records, to_millis, SyncStateRow, SYNC_STATE_COLUMNS};
use super::Pool;
use crate::clock::SharedClock;
use crate::error::{StoreError, StoreResult};
use crate::model::{SyncOperation, SyncRecord};

#[derive(Clone)]
pub struct SyncStateStore {
    pool: Pool,
    clock: SharedClock,
}

impl std::fmt::Debug for SyncStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStateStore").finish_non_exhaustive()
    }
}

impl SyncStateStore {
    pub fn new(pool: Pool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip_all)]
    pub async fn get(&self, entity_type: &str, entity_id: i64) -> StoreResult<Option<SyncRecord>> {
        let mut conn = self.pool.acquire().await?;
        get_tx(&mut *conn, entity_type, entity_id).await
    }

    /// Create-or-replace the whole record. Replacing resets attempt and
    /// error bookkeeping.
    #[instrument(skip_all)]
    pub async fn upsert(
        &self,
        entity_type: &str,
        entity_id: i64,
        remote_id: Option<&str>,
        last_synced_at: Option<DateTime<Utc>>,
        dirty: bool,
        pending_operation: Option<SyncOperation>,
    ) -> StoreResult<SyncRecord> {
        if dirty != pending_operation.is_some() {
            return Err(StoreError::Invariant(
                "dirty must be set exactly when a pending operation is present",
            ));
        }
        let sql = format!(
            "INSERT INTO sync_state (entity_type, entity_id, remote_id, last_synced_at, dirty, \
                 pending_operation, attempts, last_error, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?) \
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
                 remote_id = excluded.remote_id, \
                 last_synced_at = excluded.last_synced_at, \
                 dirty = excluded.dirty, \
                 pending_operation = excluded.pending_operation, \
                 attempts = 0, \
                 last_error = NULL, \
                 updated_at = excluded.updated_at \
             RETURNING {}",
            SYNC_STATE_COLUMNS
        );
        let row = sqlx::query_as::<_, SyncStateRow>(&sql)
            .bind(entity_type)
            .bind(entity_id)
            .bind(remote_id)
            .bind(last_synced_at.map(to_millis))
            .bind(dirty)
            .bind(pending_operation.map(|op| op.as_str()))
            .bind(to_millis(self.clock.now()))
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    #[instrument(skip_all)]
    pub async fn mark_dirty(
        &self,
        entity_type: &str,
        entity_id: i64,
        operation: SyncOperation,
    ) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        mark_dirty_tx(&mut *conn, entity_type, entity_id, operation, self.clock.now()).await
    }

    #[instrument(skip_all)]
    pub async fn mark_synced(
        &self,
        entity_type: &str,
        entity_id: i64,
        remote_id: &str,
    ) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        mark_synced_tx(&mut *conn, entity_type, entity_id, remote_id, self.clock.now()).await
    }

    /// Keep the last remote error for diagnostics. Retry bookkeeping lives on
    /// the queue entry; the dirty flag and `attempts` are left alone.
    #[instrument(skip_all)]
    pub async fn record_error(
        &self,
        entity_type: &str,
        entity_id: i64,
        error: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        record_error_tx(&mut *conn, entity_type, entity_id, error, self.clock.now()).await
    }

    #[instrument(skip_all)]
    pub async fn set_remote_id(
        &self,
        entity_type: &str,
        entity_id: i64,
        remote_id: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        set_remote_id_tx(&mut *conn, entity_type, entity_id, remote_id, self.clock.now()).await
    }

    /// Dirty records, oldest change first.
    #[instrument(skip_all)]
    pub async fn list_dirty(&self, entity_type: Option<&str>) -> StoreResult<Vec<SyncRecord>> {
        let rows = match entity_type {
            Some(entity_type) => {
                let sql = format!(
                    "SELECT {} FROM sync_state WHERE dirty = 1 AND entity_type = ? \
                     ORDER BY updated_at ASC, sync_id ASC",
                    SYNC_STATE_COLUMNS
                );
                sqlx::query_as::<_, SyncStateRow>(&sql)
                    .bind(entity_type)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM sync_state WHERE dirty = 1 ORDER BY updated_at ASC, sync_id ASC",
                    SYNC_STATE_COLUMNS
                );
                sqlx::query_as::<_, SyncStateRow>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        into_records(rows)
    }

    #[instrument(skip_all)]
    pub async fn count_dirty(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_state WHERE dirty = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_all(&self) -> StoreResult<Vec<SyncRecord>> {
        let sql = format!(
            "SELECT {} FROM sync_state ORDER BY entity_type ASC, entity_id ASC",
            SYNC_STATE_COLUMNS
        );
        let rows = sqlx::query_as::<_, SyncStateRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    /// Drop tracking for a permanently purged entity.
    #[instrument(skip_all)]
    pub async fn delete(&self, entity_type: &str, entity_id: i64) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        delete_tx(&mut *conn, entity_type, entity_id).await
    }
}

pub(crate) async fn get_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
) -> StoreResult<Option<SyncRecord>> {
    let sql = format!(
        "SELECT {} FROM sync_state WHERE entity_type = ? AND entity_id = ?",
        SYNC_STATE_COLUMNS
    );
    let row = sqlx::query_as::<_, SyncStateRow>(&sql)
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(SyncRecord::try_from).transpose()
}

pub(crate) async fn mark_dirty_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
    operation: SyncOperation,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO sync_state (entity_type, entity_id, dirty, pending_operation, updated_at) \
         VALUES (?, ?, 1, ?, ?) \
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
             dirty = 1, \
             pending_operation = excluded.pending_operation, \
             updated_at = excluded.updated_at",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(operation.as_str())
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn mark_synced_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
    remote_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let now = to_millis(now);
    sqlx::query(
        "INSERT INTO sync_state (entity_type, entity_id, remote_id, last_synced_at, dirty, \
             pending_operation, attempts, last_error, updated_at) \
         VALUES (?, ?, ?, ?, 0, NULL, 0, NULL, ?) \
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
             remote_id = excluded.remote_id, \
             last_synced_at = excluded.last_synced_at, \
             dirty = 0, \
             pending_operation = NULL, \
             attempts = 0, \
             last_error = NULL, \
             updated_at = excluded.updated_at",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(remote_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Like [`mark_synced_tx`] but never creates a row for an untracked entity.
pub(crate) async fn mark_synced_if_tracked_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
    remote_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let now = to_millis(now);
    let res = sqlx::query(
        "UPDATE sync_state SET remote_id = ?, last_synced_at = ?, dirty = 0, \
             pending_operation = NULL, attempts = 0, last_error = NULL, updated_at = ? \
         WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(remote_id)
    .bind(now)
    .bind(now)
    .bind(entity_type)
    .bind(entity_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub(crate) async fn record_error_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let res = sqlx::query(
        "UPDATE sync_state SET last_error = ?, updated_at = ? \
         WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(error)
    .bind(to_millis(now))
    .bind(entity_type)
    .bind(entity_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub(crate) async fn set_remote_id_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
    remote_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let now = to_millis(now);
    let res = sqlx::query(
        "UPDATE sync_state SET remote_id = ?, last_synced_at = ?, updated_at = ? \
         WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(remote_id)
    .bind(now)
    .bind(now)
    .bind(entity_type)
    .bind(entity_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Dirty records that have no queued action behind them.
pub(crate) async fn list_orphans_tx(conn: &mut SqliteConnection) -> StoreResult<Vec<SyncRecord>> {
    let sql = format!(
        "SELECT {} FROM sync_state s WHERE s.dirty = 1 AND NOT EXISTS ( \
             SELECT 1 FROM pending_actions p \
             WHERE p.entity_type = s.entity_type AND p.entity_id = s.entity_id) \
         ORDER BY s.updated_at ASC, s.sync_id ASC",
        SYNC_STATE_COLUMNS
    );
    let rows = sqlx::query_as::<_, SyncStateRow>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    into_records(rows)
}

pub(crate) async fn delete_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
) -> StoreResult<bool> {
    let res = sqlx::query("DELETE FROM sync_state WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type)
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::db::connect_in_memory;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    async fn setup() -> (SyncStateStore, Arc<ManualClock>) {
        let pool = connect_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        (SyncStateStore::new(pool, clock.clone()), clock)
    }

    #[tokio::test]
    async fn mark_dirty_creates_then_updates() {
        let (store, clock) = setup().await;
        assert!(store.get("TRIP", 1).await.unwrap().is_none());

        store.mark_dirty("TRIP", 1, SyncOperation::Create).await.unwrap();
        let rec = store.get("TRIP", 1).await.unwrap().unwrap();
        assert!(rec.dirty);
        assert_eq!(rec.pending_operation, Some(SyncOperation::Create));
        let first_update = rec.updated_at;

        clock.advance(Duration::seconds(5));
        store.mark_dirty("TRIP", 1, SyncOperation::Update).await.unwrap();
        let rec = store.get("TRIP", 1).await.unwrap().unwrap();
        assert_eq!(rec.pending_operation, Some(SyncOperation::Update));
        assert!(rec.updated_at > first_update);
    }

    #[tokio::test]
    async fn mark_synced_clears_dirty_and_resets_bookkeeping() {
        let (store, clock) = setup().await;
        store.mark_dirty("ACCOUNT", 3, SyncOperation::Create).await.unwrap();
        store.record_error("ACCOUNT", 3, "offline").await.unwrap();
        let rec = store.get("ACCOUNT", 3).await.unwrap().unwrap();
        assert_eq!(rec.attempts, 0);
        assert!(rec.dirty);
        assert_eq!(rec.last_error.as_deref(), Some("offline"));

        clock.advance(Duration::minutes(1));
        store.mark_synced("ACCOUNT", 3, "acc-3").await.unwrap();
        let rec = store.get("ACCOUNT", 3).await.unwrap().unwrap();
        assert!(!rec.dirty);
        assert!(rec.pending_operation.is_none());
        assert_eq!(rec.remote_id.as_deref(), Some("acc-3"));
        assert_eq!(rec.last_synced_at, Some(clock.now()));
        assert_eq!(rec.attempts, 0);
        assert!(rec.last_error.is_none());
        assert!(rec.has_been_synced());
    }

    #[tokio::test]
    async fn upsert_rejects_inconsistent_dirty_flag() {
        let (store, _) = setup().await;
        let err = store
            .upsert("CARD", 1, None, None, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));

        let err = store
            .upsert("CARD", 1, None, None, false, Some(SyncOperation::Delete))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let (store, clock) = setup().await;
        let synced_at = clock.now();
        let a = store
            .upsert("CARD", 9, Some("card-9"), Some(synced_at), false, None)
            .await
            .unwrap();
        let b = store
            .upsert("CARD", 9, Some("card-9"), Some(synced_at), false, None)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_dirty_orders_by_last_change_and_filters_type() {
        let (store, clock) = setup().await;
        store.mark_dirty("TRANSACTION", 1, SyncOperation::Create).await.unwrap();
        clock.advance(Duration::seconds(1));
        store.mark_dirty("TRIP", 1, SyncOperation::Create).await.unwrap();
        clock.advance(Duration::seconds(1));
        store.mark_dirty("TRANSACTION", 2, SyncOperation::Create).await.unwrap();
        clock.advance(Duration::seconds(1));
        // Touching 1 again moves it to the back.
        store.mark_dirty("TRANSACTION", 1, SyncOperation::Update).await.unwrap();
        store.mark_synced("TRIP", 1, "trip-1").await.unwrap();

        let all = store.list_dirty(None).await.unwrap();
        let keys: Vec<_> = all.iter().map(|r| (r.entity_type.as_str(), r.entity_id)).collect();
        assert_eq!(keys, vec![("TRANSACTION", 2), ("TRANSACTION", 1)]);

        assert!(store.list_dirty(Some("TRIP")).await.unwrap().is_empty());
        assert_eq!(store.count_dirty().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn set_remote_id_keeps_entity_dirty() {
        let (store, _) = setup().await;
        store.mark_dirty("GROUP", 5, SyncOperation::Update).await.unwrap();
        assert!(store.set_remote_id("GROUP", 5, "grp-5").await.unwrap());
        let rec = store.get("GROUP", 5).await.unwrap().unwrap();
        assert!(rec.dirty);
        assert_eq!(rec.remote_id.as_deref(), Some("grp-5"));
    }

    #[tokio::test]
    async fn delete_removes_tracking() {
        let (store, _) = setup().await;
        store.mark_dirty("NOTIFICATION", 2, SyncOperation::Create).await.unwrap();
        assert!(store.delete("NOTIFICATION", 2).await.unwrap());
        assert!(!store.delete("NOTIFICATION", 2).await.unwrap());
        assert_eq!(store.count_dirty().await.unwrap(), 0);
    }
}
