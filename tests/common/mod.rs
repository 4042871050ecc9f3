#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use fintrack_sync::clock::ManualClock;
use fintrack_sync::coordinator::{CoordinatorSettings, SyncCoordinator};
use fintrack_sync::db::{self, PendingActionQueue, Pool, SyncStateStore};
use fintrack_sync::model::SyncOperation;
use fintrack_sync::sink::{ApplyRequest, RemoteSink};
use fintrack_sync::tracker::SyncTracker;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub entity_type: String,
    pub entity_id: i64,
    pub operation: SyncOperation,
    pub payload: Vec<u8>,
}

/// Remote sink double: pops scripted responses, then falls back to
/// `Ok("remote-<id>")` or, when `fail_always` is set, to an error.
#[derive(Clone, Default)]
pub struct RecordingSink {
    responses: Arc<Mutex<VecDeque<Result<String>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_always: bool,
}

impl RecordingSink {
    pub fn with_responses(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_always: true,
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl RemoteSink for RecordingSink {
    async fn apply(&self, request: &ApplyRequest<'_>) -> Result<String> {
        self.calls.lock().await.push(Call {
            entity_type: request.entity_type.to_string(),
            entity_id: request.entity_id,
            operation: request.operation,
            payload: request.payload.to_vec(),
        });
        let scripted = self.responses.lock().await.pop_front();
        match scripted {
            Some(response) => response,
            None if self.fail_always => Err(anyhow!("remote unavailable")),
            None => Ok(format!("remote-{}", request.entity_id)),
        }
    }
}

pub struct Harness {
    pub pool: Pool,
    pub clock: Arc<ManualClock>,
    pub queue: PendingActionQueue,
    pub state: SyncStateStore,
    pub tracker: SyncTracker,
}

impl Harness {
    pub async fn in_memory() -> Self {
        Self::with_pool(db::connect_in_memory().await.unwrap())
    }

    pub fn with_pool(pool: Pool) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        Self {
            queue: PendingActionQueue::new(pool.clone(), clock.clone()),
            state: SyncStateStore::new(pool.clone(), clock.clone()),
            tracker: SyncTracker::new(pool.clone(), clock.clone()),
            pool,
            clock,
        }
    }

    pub fn coordinator(&self, sink: Arc<dyn RemoteSink>) -> SyncCoordinator {
        self.coordinator_with(sink, CoordinatorSettings::default())
    }

    pub fn coordinator_with(
        &self,
        sink: Arc<dyn RemoteSink>,
        settings: CoordinatorSettings,
    ) -> SyncCoordinator {
        SyncCoordinator::new(
            self.queue.clone(),
            self.state.clone(),
            sink,
            self.clock.clone(),
        )
        .with_settings(settings)
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }
}

pub fn short_timeout() -> CoordinatorSettings {
    CoordinatorSettings {
        apply_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}
