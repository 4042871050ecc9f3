//! Background task that owns the coordinator.
//!
//! Exactly one task drives a queue. It ticks on a fixed interval and
//! whenever [`SyncWorkerHandle::sync_now`] is called, for example when
//! connectivity comes back.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::coordinator::{SyncCoordinator, SyncReport};

/// Shortest accepted poll interval; shorter ones, zero included, are raised
/// to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    SyncNow,
    Shutdown,
}

pub struct SyncWorker;

impl SyncWorker {
    /// Move `coordinator` into a new task. The first tick runs immediately.
    pub fn spawn(coordinator: SyncCoordinator, poll_interval: Duration) -> SyncWorkerHandle {
        let (commands, rx) = mpsc::channel(4);
        let (reports_tx, reports) = watch::channel(None);
        let task = tokio::spawn(run(coordinator, poll_interval, rx, reports_tx));
        SyncWorkerHandle {
            commands,
            reports,
            task,
        }
    }
}

#[derive(Debug)]
pub struct SyncWorkerHandle {
    commands: mpsc::Sender<Command>,
    reports: watch::Receiver<Option<SyncReport>>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Ask for a tick as soon as the current one (if any) finishes. Returns
    /// false once the worker has stopped.
    pub fn sync_now(&self) -> bool {
        match self.commands.try_send(Command::SyncNow) {
            Ok(()) => true,
            // A tick is already requested.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Receiver of the most recent tick report.
    pub fn subscribe(&self) -> watch::Receiver<Option<SyncReport>> {
        self.reports.clone()
    }

    pub fn latest(&self) -> Option<SyncReport> {
        self.reports.borrow().clone()
    }

    /// Stop after the current tick and wait for the task to exit.
    pub async fn shutdown(self) {
        // Closed means the loop already exited.
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(err) = self.task.await {
            error!(?err, "sync worker task panicked");
        }
    }
}

async fn run(
    coordinator: SyncCoordinator,
    poll_interval: Duration,
    mut commands: mpsc::Receiver<Command>,
    reports: watch::Sender<Option<SyncReport>>,
) {
    let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(poll_interval_ms = poll_interval.as_millis() as u64, "sync worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            cmd = commands.recv() => match cmd {
                Some(Command::SyncNow) => {
                    debug!("sync requested");
                    ticker.reset();
                }
                Some(Command::Shutdown) | None => break,
            },
        }

        match coordinator.run_once().await {
            Ok(report) => {
                reports.send_replace(Some(report));
            }
            Err(err) => error!(?err, "sync tick failed"),
        }
    }
    info!("sync worker stopped");
}
