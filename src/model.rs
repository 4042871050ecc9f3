use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mutation kinds replicated to the remote sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "CREATE",
            SyncOperation::Update => "UPDATE",
            SyncOperation::Delete => "DELETE",
        }
    }

    pub fn parse_operation(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Some(SyncOperation::Create),
            "UPDATE" => Some(SyncOperation::Update),
            "DELETE" => Some(SyncOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronization bookkeeping for one `(entity_type, entity_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRecord {
    pub entity_type: String,
    pub entity_id: i64,
    pub remote_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub dirty: bool,
    pub pending_operation: Option<SyncOperation>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    /// Local changes exist and an operation is recorded for them.
    pub fn needs_sync(&self) -> bool {
        self.dirty && self.pending_operation.is_some()
    }

    /// The remote side has accepted this entity at least once.
    pub fn has_been_synced(&self) -> bool {
        self.remote_id.is_some() && self.last_synced_at.is_some()
    }
}

/// A queued mutation together with the payload snapshot taken at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub operation: SyncOperation,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub payload: Vec<u8>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub requires_network: bool,
    /// Bumped each time a newer snapshot replaces this entry.
    pub revision: i64,
}

impl MutationRecord {
    pub fn is_dead(&self, max_retries: i32) -> bool {
        self.retry_count >= max_retries
    }

    pub fn is_delete(&self) -> bool {
        self.operation == SyncOperation::Delete
    }
}
