use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use fintrack_sync::clock;
use fintrack_sync::config;
use fintrack_sync::db::{self, PendingActionQueue, QueueStats, SyncStateStore};
use fintrack_sync::model::{MutationRecord, SyncRecord};
use fintrack_sync::tracker::SyncTracker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and repair the offline sync queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dirty entity count and queue statistics
    Status,
    /// List entities with unsynced local changes
    Dirty {
        #[arg(long)]
        entity_type: Option<String>,
    },
    /// List every queued action in scheduling order
    Pending,
    /// List actions that exhausted their retries
    Failed,
    /// Reset an action's retries so it is attempted on the next tick
    Retry { action_id: i64 },
    /// Drop every action that exhausted its retries
    Purge,
    /// Force queued entities dirty and report dirty entities with nothing queued
    Reconcile,
}

#[derive(Debug, Serialize)]
struct Status {
    dirty: i64,
    queue: QueueStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    let clock = clock::system();
    let queue =
        PendingActionQueue::new(pool.clone(), clock.clone()).with_backoff(cfg.sync.backoff());
    let state = SyncStateStore::new(pool.clone(), clock.clone());
    let max_retries = cfg.sync.max_retries;

    match args.command {
        Command::Status => {
            let status = Status {
                dirty: state.count_dirty().await?,
                queue: queue.stats(max_retries).await?,
            };
            if args.json {
                print_json(&status)?;
            } else {
                println!("dirty entities:  {}", status.dirty);
                println!("queued:          {}", status.queue.pending);
                println!("ready now:       {}", status.queue.ready);
                println!("dead:            {}", status.queue.dead);
                if let Some(oldest) = status.queue.oldest_pending {
                    println!("oldest queued:   {}", oldest.to_rfc3339());
                }
            }
        }
        Command::Dirty { entity_type } => {
            let records = state.list_dirty(entity_type.as_deref()).await?;
            if args.json {
                print_json(&records)?;
            } else {
                records.iter().for_each(print_record);
            }
        }
        Command::Pending => {
            let actions = queue.list_all().await?;
            if args.json {
                print_json(&actions)?;
            } else {
                for action in &actions {
                    print_action(&queue, action, max_retries);
                }
            }
        }
        Command::Failed => {
            let actions = queue.list_failed(max_retries).await?;
            if args.json {
                print_json(&actions)?;
            } else {
                for action in &actions {
                    print_action(&queue, action, max_retries);
                }
            }
        }
        Command::Retry { action_id } => {
            if !queue.retry_now(action_id).await? {
                bail!("no queued action with id {}", action_id);
            }
            info!(action_id, "action reset for retry");
        }
        Command::Purge => {
            let purged = queue.purge_failed(max_retries).await?;
            if args.json {
                print_json(&serde_json::json!({ "purged": purged }))?;
            } else {
                println!("purged {} dead action(s)", purged);
            }
        }
        Command::Reconcile => {
            let report = SyncTracker::new(pool, clock).reconcile().await?;
            if args.json {
                print_json(&report)?;
            } else {
                println!("repaired {} sync record(s)", report.repaired.len());
                for (entity_type, entity_id) in &report.repaired {
                    println!("  {} {}", entity_type, entity_id);
                }
                println!("{} dirty record(s) with nothing queued", report.orphans.len());
                report.orphans.iter().for_each(print_record);
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_record(rec: &SyncRecord) {
    println!(
        "{} {} op={} remote={} updated={}{}",
        rec.entity_type,
        rec.entity_id,
        rec.pending_operation
            .map(|op| op.as_str())
            .unwrap_or("-"),
        rec.remote_id.as_deref().unwrap_or("-"),
        rec.updated_at.to_rfc3339(),
        rec.last_error
            .as_deref()
            .map(|e| format!(" error={}", e))
            .unwrap_or_default(),
    );
}

fn print_action(queue: &PendingActionQueue, action: &MutationRecord, max_retries: i32) {
    let next = if action.is_dead(max_retries) {
        "dead".to_string()
    } else {
        queue
            .backoff()
            .next_attempt_at(action)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "now".to_string())
    };
    println!(
        "#{} {} {} {} priority={} retries={} next={}{}",
        action.id,
        action.operation,
        action.entity_type,
        action.entity_id,
        action.priority,
        action.retry_count,
        next,
        action
            .last_error
            .as_deref()
            .map(|e| format!(" error={}", e))
            .unwrap_or_default(),
    );
}
