//! Durable storage for sync bookkeeping.
//!
//! This module is split into:
//! - `model`: row structs as they come out of SQLite, and their conversion
//!   into the domain records of `crate::model`.
//! - `sync_state`: the per-entity `SyncStateStore`.
//! - `pending`: the `PendingActionQueue` of outstanding mutations.
//!
//! Both stores share one `SqlitePool`; the coordinator and tracker combine
//! them inside a single transaction through the `*_tx` helpers.

pub mod model;
pub mod pending;
pub mod sync_state;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

use crate::error::StoreResult;

pub use pending::{PendingActionQueue, QueueStats};
pub use sync_state::SyncStateStore;

pub type Pool = SqlitePool;

/// Open (creating if needed) the database at `database_url` and apply
/// migrations.
pub async fn init_pool(database_url: &str) -> StoreResult<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus full sync on every pooled connection, and wait on writer
    // contention instead of failing with SQLITE_BUSY.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Private in-memory database on a single long-lived connection.
///
/// Every pooled connection to `sqlite::memory:` would get its own empty
/// database, so the pool is pinned to exactly one connection that never
/// expires.
pub async fn connect_in_memory() -> StoreResult<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Start a transaction that already holds the write lock.
///
/// sqlx 0.7 always issues a deferred `BEGIN`; the no-op write below takes the
/// RESERVED lock up front so a read-then-write sequence inside the
/// transaction never has to upgrade its lock and fail with `SQLITE_BUSY`.
pub(crate) async fn begin_write(pool: &Pool) -> StoreResult<Transaction<'static, Sqlite>> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE pending_actions SET id = id WHERE 0")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    // Pass through non-sqlite schemes
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn file_url_creates_parent_and_keeps_query() {
        let td = tempfile::tempdir().unwrap();
        let db_path = td.path().join("nested").join("sync.db");
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, format!("sqlite://{}?mode=rwc", db_path.display()));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn in_memory_pool_is_migrated() {
        let pool = connect_in_memory().await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('sync_state', 'pending_actions') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["pending_actions", "sync_state"]);
    }

    #[tokio::test]
    async fn file_pool_is_created_and_migrated() {
        let td = tempfile::tempdir().unwrap();
        let db_path = td.path().join("data").join("sync.db");
        let pool = init_pool(&format!("sqlite://{}", db_path.display()))
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_actions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(db_path.exists());
    }
}
