//! Entry point for domain repositories: every local mutation of a synced
//! entity goes through [`SyncTracker`], which marks the entity dirty and
//! queues its snapshot atomically.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::SharedClock;
use crate::db::pending::NewMutation;
use crate::db::{self, pending, sync_state, Pool};
use crate::error::StoreResult;
use crate::model::{SyncOperation, SyncRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The snapshot is queued under `action_id` as `operation`, which may
    /// differ from the requested one after coalescing.
    Queued {
        action_id: i64,
        operation: SyncOperation,
    },
    /// A delete cancelled a create the remote never saw; nothing is left to
    /// send and the entity is no longer tracked. If that create was already
    /// being applied, the coordinator queues the delete once it lands.
    Collapsed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Queued entities whose sync record was missing or disagreed with the
    /// queue and has been forced dirty.
    pub repaired: Vec<(String, i64)>,
    /// Dirty records with no queued action. Left dirty for manual review.
    pub orphans: Vec<SyncRecord>,
}

#[derive(Clone)]
pub struct SyncTracker {
    pool: Pool,
    clock: SharedClock,
    priority: i32,
}

impl std::fmt::Debug for SyncTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTracker")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl SyncTracker {
    pub fn new(pool: Pool, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            priority: 0,
        }
    }

    /// A tracker that queues at `priority` instead of the default 0.
    pub fn with_priority(&self, priority: i32) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }

    /// Record a local mutation. `serialize` is only called when a snapshot
    /// actually has to be queued.
    #[instrument(skip_all)]
    pub async fn on_entity_mutated<F>(
        &self,
        entity_type: &str,
        entity_id: i64,
        operation: SyncOperation,
        serialize: F,
    ) -> StoreResult<TrackOutcome>
    where
        F: FnOnce() -> Vec<u8>,
    {
        let now = self.clock.now();
        let mut tx = db::begin_write(&self.pool).await?;

        let queued = pending::get_for_entity_tx(&mut *tx, entity_type, entity_id).await?;
        let record = sync_state::get_tx(&mut *tx, entity_type, entity_id).await?;
        let never_accepted = record.map_or(true, |rec| rec.remote_id.is_none());
        let create_queued =
            queued.map_or(false, |action| action.operation == SyncOperation::Create);

        let operation = match operation {
            SyncOperation::Delete if create_queued && never_accepted => {
                pending::remove_for_entity_tx(&mut *tx, entity_type, entity_id).await?;
                sync_state::delete_tx(&mut *tx, entity_type, entity_id).await?;
                tx.commit().await?;
                debug!(entity_type, entity_id, "create cancelled by delete before sync");
                return Ok(TrackOutcome::Collapsed);
            }
            SyncOperation::Update if create_queued && never_accepted => SyncOperation::Create,
            op => op,
        };

        let payload = serialize();
        sync_state::mark_dirty_tx(&mut *tx, entity_type, entity_id, operation, now).await?;
        let action_id = pending::enqueue_tx(
            &mut *tx,
            &NewMutation::new(entity_type, entity_id, operation, &payload)
                .with_priority(self.priority),
            now,
        )
        .await?;
        tx.commit().await?;
        debug!(action_id, entity_type, entity_id, operation = %operation, "mutation queued");
        Ok(TrackOutcome::Queued {
            action_id,
            operation,
        })
    }

    /// [`Self::on_entity_mutated`] with a JSON snapshot of `entity`.
    pub async fn track_json<T>(
        &self,
        entity_type: &str,
        entity_id: i64,
        operation: SyncOperation,
        entity: &T,
    ) -> StoreResult<TrackOutcome>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(entity)?;
        self.on_entity_mutated(entity_type, entity_id, operation, move || payload)
            .await
    }

    /// The entity is gone for good locally: forget its queued action and its
    /// sync record.
    #[instrument(skip_all)]
    pub async fn purge_entity(&self, entity_type: &str, entity_id: i64) -> StoreResult<bool> {
        let mut tx = db::begin_write(&self.pool).await?;
        let dequeued = pending::remove_for_entity_tx(&mut *tx, entity_type, entity_id).await?;
        let untracked = sync_state::delete_tx(&mut *tx, entity_type, entity_id).await?;
        tx.commit().await?;
        Ok(dequeued || untracked)
    }

    /// Bring the two stores back in line after a crash or manual edit. The
    /// queue wins: every queued entity ends up dirty with the queued
    /// operation.
    #[instrument(skip_all)]
    pub async fn reconcile(&self) -> StoreResult<ReconcileReport> {
        let now = self.clock.now();
        let mut tx = db::begin_write(&self.pool).await?;
        let mut report = ReconcileReport::default();

        for action in pending::list_all_tx(&mut *tx).await? {
            let record =
                sync_state::get_tx(&mut *tx, &action.entity_type, action.entity_id).await?;
            let in_line = record.map_or(false, |rec| {
                rec.dirty && rec.pending_operation == Some(action.operation)
            });
            if in_line {
                continue;
            }
            sync_state::mark_dirty_tx(
                &mut *tx,
                &action.entity_type,
                action.entity_id,
                action.operation,
                now,
            )
            .await?;
            report.repaired.push((action.entity_type, action.entity_id));
        }

        report.orphans = sync_state::list_orphans_tx(&mut *tx).await?;
        tx.commit().await?;

        for orphan in &report.orphans {
            warn!(
                entity_type = %orphan.entity_type,
                entity_id = orphan.entity_id,
                "dirty entity has no queued action"
            );
        }
        if !report.repaired.is_empty() {
            info!(repaired = report.repaired.len(), "sync state repaired from queue");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::connect_in_memory;
    use crate::db::{PendingActionQueue, SyncStateStore};
    use chrono::{TimeZone, Utc};
    use serde::Serialize;
    use std::sync::Arc;

    struct Fixture {
        tracker: SyncTracker,
        queue: PendingActionQueue,
        state: SyncStateStore,
    }

    async fn setup() -> Fixture {
        let pool = connect_in_memory().await.unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 10, 7, 30, 0).unwrap(),
        ));
        Fixture {
            tracker: SyncTracker::new(pool.clone(), clock.clone()),
            queue: PendingActionQueue::new(pool.clone(), clock.clone()),
            state: SyncStateStore::new(pool, clock),
        }
    }

    #[derive(Serialize)]
    struct Transaction<'a> {
        amount_cents: i64,
        memo: &'a str,
    }

    #[tokio::test]
    async fn mutation_marks_dirty_and_queues() {
        let f = setup().await;
        let outcome = f
            .tracker
            .on_entity_mutated("TRANSACTION", 11, SyncOperation::Update, || b"{}".to_vec())
            .await
            .unwrap();
        let TrackOutcome::Queued { action_id, operation } = outcome else {
            panic!("expected queued, got {:?}", outcome);
        };
        assert_eq!(operation, SyncOperation::Update);

        let action = f.queue.get(action_id).await.unwrap().unwrap();
        assert_eq!(action.payload, b"{}");
        let rec = f.state.get("TRANSACTION", 11).await.unwrap().unwrap();
        assert!(rec.needs_sync());
        assert_eq!(rec.pending_operation, Some(SyncOperation::Update));
    }

    #[tokio::test]
    async fn update_after_unsent_create_stays_create() {
        let f = setup().await;
        f.tracker
            .track_json(
                "TRANSACTION",
                1,
                SyncOperation::Create,
                &Transaction {
                    amount_cents: 100,
                    memo: "coffee",
                },
            )
            .await
            .unwrap();
        let outcome = f
            .tracker
            .track_json(
                "TRANSACTION",
                1,
                SyncOperation::Update,
                &Transaction {
                    amount_cents: 250,
                    memo: "lunch",
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TrackOutcome::Queued { operation: SyncOperation::Create, .. }
        ));

        let action = f.queue.get_for_entity("TRANSACTION", 1).await.unwrap().unwrap();
        assert_eq!(action.operation, SyncOperation::Create);
        let body: serde_json::Value = serde_json::from_slice(&action.payload).unwrap();
        assert_eq!(body["memo"], "lunch");
        assert_eq!(f.queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_after_unsent_create_collapses() {
        let f = setup().await;
        f.tracker
            .on_entity_mutated("TRIP", 3, SyncOperation::Create, || b"{}".to_vec())
            .await
            .unwrap();
        let outcome = f
            .tracker
            .on_entity_mutated("TRIP", 3, SyncOperation::Delete, || {
                panic!("nothing should be serialized")
            })
            .await
            .unwrap();
        assert_eq!(outcome, TrackOutcome::Collapsed);
        assert_eq!(f.queue.count().await.unwrap(), 0);
        assert!(f.state.get("TRIP", 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synced_entities_are_not_coalesced() {
        let f = setup().await;
        f.state.mark_synced("TRIP", 3, "trip-remote-3").await.unwrap();
        f.queue
            .enqueue("TRIP", 3, SyncOperation::Create, b"{}")
            .await
            .unwrap();

        let outcome = f
            .tracker
            .on_entity_mutated("TRIP", 3, SyncOperation::Delete, || b"{}".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TrackOutcome::Queued { operation: SyncOperation::Delete, .. }
        ));
        let action = f.queue.get_for_entity("TRIP", 3).await.unwrap().unwrap();
        assert!(action.is_delete());
    }

    #[tokio::test]
    async fn with_priority_queues_at_that_priority() {
        let f = setup().await;
        let urgent = f.tracker.with_priority(5);
        urgent
            .on_entity_mutated("CREDIT_CARD", 1, SyncOperation::Update, || b"{}".to_vec())
            .await
            .unwrap();
        let action = f.queue.get_for_entity("CREDIT_CARD", 1).await.unwrap().unwrap();
        assert_eq!(action.priority, 5);
    }

    #[tokio::test]
    async fn reconcile_forces_queued_entities_dirty_and_reports_orphans() {
        let f = setup().await;
        // Queued without a matching sync record, e.g. after a crash.
        f.queue
            .enqueue("ACCOUNT", 1, SyncOperation::Update, b"{}")
            .await
            .unwrap();
        // Dirty with nothing queued.
        f.state
            .mark_dirty("ACCOUNT", 2, SyncOperation::Update)
            .await
            .unwrap();

        let report = f.tracker.reconcile().await.unwrap();
        assert_eq!(report.repaired, vec![("ACCOUNT".to_string(), 1)]);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].entity_id, 2);

        let rec = f.state.get("ACCOUNT", 1).await.unwrap().unwrap();
        assert_eq!(rec.pending_operation, Some(SyncOperation::Update));
        assert_eq!(f.state.count_dirty().await.unwrap(), 2);

        let again = f.tracker.reconcile().await.unwrap();
        assert!(again.repaired.is_empty());
    }

    #[tokio::test]
    async fn reconcile_redirties_clean_record_with_queued_action() {
        let f = setup().await;
        f.state.mark_synced("ACCOUNT", 5, "acc-5").await.unwrap();
        f.queue
            .enqueue("ACCOUNT", 5, SyncOperation::Update, b"{}")
            .await
            .unwrap();
        assert_eq!(f.state.count_dirty().await.unwrap(), 0);

        let report = f.tracker.reconcile().await.unwrap();
        assert_eq!(report.repaired, vec![("ACCOUNT".to_string(), 5)]);
        assert!(report.orphans.is_empty());

        let rec = f.state.get("ACCOUNT", 5).await.unwrap().unwrap();
        assert!(rec.dirty);
        assert_eq!(rec.pending_operation, Some(SyncOperation::Update));
        assert_eq!(rec.remote_id.as_deref(), Some("acc-5"));
    }

    #[tokio::test]
    async fn purge_entity_removes_both_sides() {
        let f = setup().await;
        f.tracker
            .on_entity_mutated("GROUP", 9, SyncOperation::Update, || b"{}".to_vec())
            .await
            .unwrap();
        assert!(f.tracker.purge_entity("GROUP", 9).await.unwrap());
        assert!(f.queue.get_for_entity("GROUP", 9).await.unwrap().is_none());
        assert!(f.state.get("GROUP", 9).await.unwrap().is_none());
        assert!(!f.tracker.purge_entity("GROUP", 9).await.unwrap());
    }
}
