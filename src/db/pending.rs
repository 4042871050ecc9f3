//! `PendingActionQueue`: durable, ordered queue of outstanding mutations.
//!
//! Each `(entity_type, entity_id)` has at most one entry. Enqueuing a newer
//! snapshot for an entity that already has one replaces it in place with a
//! single upsert statement, so concurrent callers racing on the same entity
//! can never produce a duplicate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use super::model::{into_records, to_millis, PendingActionRow, PENDING_ACTION_COLUMNS};
use super::Pool;
use crate::backoff::Backoff;
use crate::clock::SharedClock;
use crate::error::StoreResult;
use crate::model::{MutationRecord, SyncOperation};

const SCHEDULE_ORDER: &str = "ORDER BY priority DESC, created_at ASC, id ASC";

/// A new mutation to place on the queue.
#[derive(Debug, Clone, Copy)]
pub struct NewMutation<'a> {
    pub entity_type: &'a str,
    pub entity_id: i64,
    pub operation: SyncOperation,
    pub payload: &'a [u8],
    pub priority: i32,
    pub requires_network: bool,
}

impl<'a> NewMutation<'a> {
    pub fn new(
        entity_type: &'a str,
        entity_id: i64,
        operation: SyncOperation,
        payload: &'a [u8],
    ) -> Self {
        Self {
            entity_type,
            entity_id,
            operation,
            payload,
            priority: 0,
            requires_network: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries still eligible for automatic attempts.
    pub pending: i64,
    /// Pending entries whose backoff window has elapsed.
    pub ready: i64,
    /// Entries that exhausted their retries.
    pub dead: i64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PendingActionQueue {
    pool: Pool,
    clock: SharedClock,
    backoff: Backoff,
}

impl std::fmt::Debug for PendingActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingActionQueue")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl PendingActionQueue {
    pub fn new(pool: Pool, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Enqueue with default priority. Returns the action id.
    #[instrument(skip_all)]
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: i64,
        operation: SyncOperation,
        payload: &[u8],
    ) -> StoreResult<i64> {
        self.enqueue_mutation(NewMutation::new(entity_type, entity_id, operation, payload))
            .await
    }

    #[instrument(skip_all)]
    pub async fn enqueue_with_priority(
        &self,
        entity_type: &str,
        entity_id: i64,
        operation: SyncOperation,
        payload: &[u8],
        priority: i32,
    ) -> StoreResult<i64> {
        self.enqueue_mutation(
            NewMutation::new(entity_type, entity_id, operation, payload).with_priority(priority),
        )
        .await
    }

    #[instrument(skip_all)]
    pub async fn enqueue_mutation(&self, mutation: NewMutation<'_>) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        enqueue_tx(&mut *conn, &mutation, self.clock.now()).await
    }

    /// Entries below the retry ceiling whose backoff window has elapsed at
    /// `now`, highest priority first and FIFO within a priority.
    #[instrument(skip_all)]
    pub async fn dequeue_ready(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
    ) -> StoreResult<Vec<MutationRecord>> {
        let sql = format!(
            "SELECT {} FROM pending_actions WHERE retry_count < ? {}",
            PENDING_ACTION_COLUMNS, SCHEDULE_ORDER
        );
        let rows = sqlx::query_as::<_, PendingActionRow>(&sql)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;
        let mut ready: Vec<MutationRecord> = into_records(rows)?;
        ready.retain(|action| self.backoff.is_due(action, now));
        Ok(ready)
    }

    #[instrument(skip_all)]
    pub async fn get(&self, action_id: i64) -> StoreResult<Option<MutationRecord>> {
        let sql = format!(
            "SELECT {} FROM pending_actions WHERE id = ?",
            PENDING_ACTION_COLUMNS
        );
        let row = sqlx::query_as::<_, PendingActionRow>(&sql)
            .bind(action_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MutationRecord::try_from).transpose()
    }

    #[instrument(skip_all)]
    pub async fn get_for_entity(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> StoreResult<Option<MutationRecord>> {
        let mut conn = self.pool.acquire().await?;
        get_for_entity_tx(&mut *conn, entity_type, entity_id).await
    }

    /// Confirmed remote success: the entry is deleted.
    #[instrument(skip_all)]
    pub async fn record_success(&self, action_id: i64) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        settle_success_tx(&mut *conn, action_id, None).await
    }

    /// Failed attempt: bump the retry counter and stamp the attempt.
    #[instrument(skip_all)]
    pub async fn record_failure(&self, action_id: i64, error: &str) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        settle_failure_tx(&mut *conn, action_id, None, error, self.clock.now()).await
    }

    /// Entries that exhausted `max_retries`; never scheduled automatically.
    #[instrument(skip_all)]
    pub async fn list_failed(&self, max_retries: i32) -> StoreResult<Vec<MutationRecord>> {
        let sql = format!(
            "SELECT {} FROM pending_actions WHERE retry_count >= ? {}",
            PENDING_ACTION_COLUMNS, SCHEDULE_ORDER
        );
        let rows = sqlx::query_as::<_, PendingActionRow>(&sql)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    /// Operator action: drop every DEAD entry. Returns how many were removed.
    #[instrument(skip_all)]
    pub async fn purge_failed(&self, max_retries: i32) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM pending_actions WHERE retry_count >= ?")
            .bind(max_retries)
            .execute(&self.pool)
            .await?;
        debug!(purged = res.rows_affected(), "purged dead actions");
        Ok(res.rows_affected())
    }

    /// Manual re-enqueue of an entry: retry bookkeeping is reset and the
    /// payload kept, making it immediately eligible again.
    #[instrument(skip_all)]
    pub async fn retry_now(&self, action_id: i64) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE pending_actions SET retry_count = 0, last_attempt_at = NULL, last_error = NULL \
             WHERE id = ?",
        )
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Cancel the outstanding mutation for an entity, if any.
    #[instrument(skip_all)]
    pub async fn remove_for_entity(&self, entity_type: &str, entity_id: i64) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        remove_for_entity_tx(&mut *conn, entity_type, entity_id).await
    }

    /// Every entry in scheduling order, DEAD ones included.
    pub async fn list_all(&self) -> StoreResult<Vec<MutationRecord>> {
        let mut conn = self.pool.acquire().await?;
        list_all_tx(&mut *conn).await
    }

    pub async fn list_by_type(&self, entity_type: &str) -> StoreResult<Vec<MutationRecord>> {
        let sql = format!(
            "SELECT {} FROM pending_actions WHERE entity_type = ? {}",
            PENDING_ACTION_COLUMNS, SCHEDULE_ORDER
        );
        let rows = sqlx::query_as::<_, PendingActionRow>(&sql)
            .bind(entity_type)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    pub async fn count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Count of entries still eligible for automatic attempts.
    pub async fn count_pending(&self, max_retries: i32) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_actions WHERE retry_count < ?")
                .bind(max_retries)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    #[instrument(skip_all)]
    pub async fn stats(&self, max_retries: i32) -> StoreResult<QueueStats> {
        let now = self.clock.now();
        // Both reads see the same snapshot.
        let mut tx = self.pool.begin().await?;
        let dead: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_actions WHERE retry_count >= ?")
                .bind(max_retries)
                .fetch_one(&mut *tx)
                .await?;
        let sql = format!(
            "SELECT {} FROM pending_actions WHERE retry_count < ? {}",
            PENDING_ACTION_COLUMNS, SCHEDULE_ORDER
        );
        let rows = sqlx::query_as::<_, PendingActionRow>(&sql)
            .bind(max_retries)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        let pending: Vec<MutationRecord> = into_records(rows)?;
        Ok(QueueStats {
            pending: pending.len() as i64,
            ready: pending
                .iter()
                .filter(|action| self.backoff.is_due(action, now))
                .count() as i64,
            dead,
            oldest_pending: pending.iter().map(|action| action.created_at).min(),
        })
    }

    /// Drop every entry, DEAD or not.
    pub async fn clear(&self) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM pending_actions")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

pub(crate) async fn enqueue_tx(
    conn: &mut SqliteConnection,
    mutation: &NewMutation<'_>,
    now: DateTime<Utc>,
) -> StoreResult<i64> {
    // Replacing keeps id and created_at so the entity does not lose its place
    // in line; retry bookkeeping starts over for the new snapshot.
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO pending_actions (entity_type, entity_id, operation, payload, priority, \
             created_at, retry_count, last_attempt_at, last_error, requires_network, revision) \
         VALUES (?, ?, ?, ?, ?, ?, 0, NULL, NULL, ?, 0) \
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
             operation = excluded.operation, \
             payload = excluded.payload, \
             priority = excluded.priority, \
             requires_network = excluded.requires_network, \
             retry_count = 0, \
             last_attempt_at = NULL, \
             last_error = NULL, \
             revision = pending_actions.revision + 1 \
         RETURNING id",
    )
    .bind(mutation.entity_type)
    .bind(mutation.entity_id)
    .bind(mutation.operation.as_str())
    .bind(mutation.payload)
    .bind(mutation.priority)
    .bind(to_millis(now))
    .bind(mutation.requires_network)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub(crate) async fn list_all_tx(conn: &mut SqliteConnection) -> StoreResult<Vec<MutationRecord>> {
    let sql = format!(
        "SELECT {} FROM pending_actions {}",
        PENDING_ACTION_COLUMNS, SCHEDULE_ORDER
    );
    let rows = sqlx::query_as::<_, PendingActionRow>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    into_records(rows)
}

pub(crate) async fn get_for_entity_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
) -> StoreResult<Option<MutationRecord>> {
    let sql = format!(
        "SELECT {} FROM pending_actions WHERE entity_type = ? AND entity_id = ?",
        PENDING_ACTION_COLUMNS
    );
    let row = sqlx::query_as::<_, PendingActionRow>(&sql)
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(MutationRecord::try_from).transpose()
}

/// Delete the entry, optionally only if it is still at `revision`.
pub(crate) async fn settle_success_tx(
    conn: &mut SqliteConnection,
    action_id: i64,
    revision: Option<i64>,
) -> StoreResult<bool> {
    let res = sqlx::query(
        "DELETE FROM pending_actions WHERE id = ? AND (? IS NULL OR revision = ?)",
    )
    .bind(action_id)
    .bind(revision)
    .bind(revision)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Charge a failed attempt, optionally only if the entry is still at
/// `revision`.
pub(crate) async fn settle_failure_tx(
    conn: &mut SqliteConnection,
    action_id: i64,
    revision: Option<i64>,
    error: &str,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let res = sqlx::query(
        "UPDATE pending_actions SET retry_count = retry_count + 1, last_attempt_at = ?, \
             last_error = ? \
         WHERE id = ? AND (? IS NULL OR revision = ?)",
    )
    .bind(to_millis(now))
    .bind(error)
    .bind(action_id)
    .bind(revision)
    .bind(revision)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub(crate) async fn remove_for_entity_tx(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
) -> StoreResult<bool> {
    let res = sqlx::query("DELETE FROM pending_actions WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type)
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() > 0)
}
