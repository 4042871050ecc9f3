//! Offline mutation queue and sync-state tracking for a local-first
//! finance store.
//!
//! Local writes go through [`tracker::SyncTracker`], which marks the entity
//! dirty and queues a snapshot in one transaction. A single
//! [`worker::SyncWorker`] task drains the queue through a
//! [`coordinator::SyncCoordinator`] into a [`sink::RemoteSink`], retrying
//! failures with bounded exponential backoff.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod model;
pub mod sink;
pub mod tracker;
pub mod worker;
