//! Drives queued mutations to the remote sink.
//!
//! One call to [`SyncCoordinator::run_once`] is one tick: every ready action
//! is attempted in scheduling order and its outcome is settled locally in a
//! single transaction. Remote failures are counted against the action and
//! never abort the tick; local store failures do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::backoff::DEFAULT_MAX_RETRIES;
use crate::clock::SharedClock;
use crate::db::pending::NewMutation;
use crate::db::{self, pending, sync_state, PendingActionQueue, SyncStateStore};
use crate::error::StoreResult;
use crate::model::{MutationRecord, SyncOperation};
use crate::sink::{ApplyRequest, RemoteSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub max_retries: i32,
    pub apply_timeout: Duration,
    /// Upper bound on actions attempted per tick; 0 means unlimited.
    pub batch_limit: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            apply_timeout: Duration::from_secs(30),
            batch_limit: 0,
        }
    }
}

/// What happened to one action during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Synced { remote_id: String },
    Requeued { retry_count: i32, error: String },
    Dead { retry_count: i32, error: String },
    /// The entry was replaced or removed while the attempt was in flight, so
    /// the attempt's outcome was not applied to it.
    Superseded { remote_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub action_id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub operation: SyncOperation,
    pub outcome: ActionOutcome,
}

/// Result of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub started_at: Option<DateTime<Utc>>,
    pub succeeded: usize,
    /// Failed and requeued for a later attempt.
    pub failed: usize,
    /// Failed and now past the retry ceiling.
    pub dead: usize,
    pub superseded: usize,
    /// Entries still eligible for automatic attempts after the tick.
    pub still_queued: i64,
    pub outcomes: Vec<ActionReport>,
}

impl SyncReport {
    fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    fn add(&mut self, report: ActionReport) {
        match report.outcome {
            ActionOutcome::Synced { .. } => self.succeeded += 1,
            ActionOutcome::Requeued { .. } => self.failed += 1,
            ActionOutcome::Dead { .. } => self.dead += 1,
            ActionOutcome::Superseded { .. } => self.superseded += 1,
        }
        self.outcomes.push(report);
    }

    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.dead == 0
    }
}

pub struct SyncCoordinator {
    queue: PendingActionQueue,
    state: SyncStateStore,
    sink: Arc<dyn RemoteSink>,
    settings: CoordinatorSettings,
    clock: SharedClock,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(
        queue: PendingActionQueue,
        state: SyncStateStore,
        sink: Arc<dyn RemoteSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            queue,
            state,
            sink,
            settings: CoordinatorSettings::default(),
            clock,
        }
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    pub fn queue(&self) -> &PendingActionQueue {
        &self.queue
    }

    pub fn state(&self) -> &SyncStateStore {
        &self.state
    }

    #[instrument(skip_all)]
    pub async fn run_once(&self) -> StoreResult<SyncReport> {
        let now = self.clock.now();
        let mut actions = self
            .queue
            .dequeue_ready(now, self.settings.max_retries)
            .await?;
        if self.settings.batch_limit > 0 {
            actions.truncate(self.settings.batch_limit);
        }
        debug!(ready = actions.len(), "sync tick");

        let mut report = SyncReport::started(now);
        for action in &actions {
            let outcome = self.process(action).await?;
            report.add(ActionReport {
                action_id: action.id,
                entity_type: action.entity_type.clone(),
                entity_id: action.entity_id,
                operation: action.operation,
                outcome,
            });
        }
        report.still_queued = self.queue.count_pending(self.settings.max_retries).await?;
        if report.attempted() > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                dead = report.dead,
                superseded = report.superseded,
                still_queued = report.still_queued,
                "sync tick finished"
            );
        }
        Ok(report)
    }

    async fn process(&self, action: &MutationRecord) -> StoreResult<ActionOutcome> {
        let known = self
            .state
            .get(&action.entity_type, action.entity_id)
            .await?;
        let remote_id = known.as_ref().and_then(|rec| rec.remote_id.as_deref());
        let request = ApplyRequest::from_action(action, remote_id);

        let result =
            match tokio::time::timeout(self.settings.apply_timeout, self.sink.apply(&request))
                .await
            {
                Ok(Ok(remote_id)) => Ok(remote_id),
                Ok(Err(err)) => Err(format!("{:#}", err)),
                Err(_) => Err(format!(
                    "apply timed out after {} ms",
                    self.settings.apply_timeout.as_millis()
                )),
            };

        match result {
            Ok(remote_id) => self.settle_success(action, remote_id).await,
            Err(error) => self.settle_failure(action, error).await,
        }
    }

    async fn settle_success(
        &self,
        action: &MutationRecord,
        remote_id: String,
    ) -> StoreResult<ActionOutcome> {
        let now = self.clock.now();
        let mut tx = db::begin_write(self.queue.pool()).await?;

        if pending::settle_success_tx(&mut *tx, action.id, Some(action.revision)).await? {
            sync_state::mark_synced_tx(
                &mut *tx,
                &action.entity_type,
                action.entity_id,
                &remote_id,
                now,
            )
            .await?;
            tx.commit().await?;
            info!(
                action_id = action.id,
                entity_type = %action.entity_type,
                entity_id = action.entity_id,
                operation = %action.operation,
                remote_id = %remote_id,
                "action synced"
            );
            return Ok(ActionOutcome::Synced { remote_id });
        }

        // The remote accepted an older snapshot. Keep its id; the entity
        // stays dirty when a newer snapshot is still queued.
        let replaced =
            pending::get_for_entity_tx(&mut *tx, &action.entity_type, action.entity_id)
                .await?
                .is_some();
        if replaced {
            sync_state::set_remote_id_tx(
                &mut *tx,
                &action.entity_type,
                action.entity_id,
                &remote_id,
                now,
            )
            .await?;
        } else if sync_state::get_tx(&mut *tx, &action.entity_type, action.entity_id)
            .await?
            .is_some()
            || action.is_delete()
        {
            sync_state::mark_synced_if_tracked_tx(
                &mut *tx,
                &action.entity_type,
                action.entity_id,
                &remote_id,
                now,
            )
            .await?;
        } else {
            // The entity was dropped locally while its copy was being
            // created remotely. Remember the remote id and queue a delete
            // so the remote copy does not outlive the local one.
            sync_state::mark_dirty_tx(
                &mut *tx,
                &action.entity_type,
                action.entity_id,
                SyncOperation::Delete,
                now,
            )
            .await?;
            sync_state::set_remote_id_tx(
                &mut *tx,
                &action.entity_type,
                action.entity_id,
                &remote_id,
                now,
            )
            .await?;
            let delete = NewMutation::new(
                &action.entity_type,
                action.entity_id,
                SyncOperation::Delete,
                &action.payload,
            )
            .with_priority(action.priority);
            pending::enqueue_tx(&mut *tx, &delete, now).await?;
            warn!(
                action_id = action.id,
                entity_type = %action.entity_type,
                entity_id = action.entity_id,
                remote_id = %remote_id,
                "entity removed locally while being created remotely; delete queued"
            );
        }
        tx.commit().await?;
        debug!(
            action_id = action.id,
            entity_type = %action.entity_type,
            entity_id = action.entity_id,
            replaced,
            "action superseded while in flight"
        );
        Ok(ActionOutcome::Superseded {
            remote_id: Some(remote_id),
        })
    }

    async fn settle_failure(
        &self,
        action: &MutationRecord,
        error: String,
    ) -> StoreResult<ActionOutcome> {
        let now = self.clock.now();
        let mut tx = db::begin_write(self.queue.pool()).await?;

        let charged =
            pending::settle_failure_tx(&mut *tx, action.id, Some(action.revision), &error, now)
                .await?;
        if !charged {
            tx.rollback().await?;
            debug!(
                action_id = action.id,
                entity_type = %action.entity_type,
                entity_id = action.entity_id,
                "failed action superseded while in flight"
            );
            return Ok(ActionOutcome::Superseded { remote_id: None });
        }
        sync_state::record_error_tx(&mut *tx, &action.entity_type, action.entity_id, &error, now)
            .await?;
        tx.commit().await?;

        let retry_count = action.retry_count + 1;
        if retry_count >= self.settings.max_retries {
            warn!(
                action_id = action.id,
                entity_type = %action.entity_type,
                entity_id = action.entity_id,
                operation = %action.operation,
                retry_count,
                error = %error,
                "action exhausted retries; left for manual review"
            );
            Ok(ActionOutcome::Dead { retry_count, error })
        } else {
            let next = self
                .queue
                .backoff()
                .window(retry_count)
                .num_seconds();
            warn!(
                action_id = action.id,
                entity_type = %action.entity_type,
                entity_id = action.entity_id,
                operation = %action.operation,
                retry_count,
                retry_in_secs = next,
                error = %error,
                "action failed; backoff"
            );
            Ok(ActionOutcome::Requeued { retry_count, error })
        }
    }
}
