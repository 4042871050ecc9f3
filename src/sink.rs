use anyhow::Result;
use async_trait::async_trait;

use crate::model::{MutationRecord, SyncOperation};

/// One queued mutation as handed to the remote side.
#[derive(Debug, Clone, Copy)]
pub struct ApplyRequest<'a> {
    pub entity_type: &'a str,
    pub entity_id: i64,
    pub operation: SyncOperation,
    pub payload: &'a [u8],
    /// Remote id from an earlier successful sync, if any.
    pub remote_id: Option<&'a str>,
}

impl<'a> ApplyRequest<'a> {
    pub fn from_action(action: &'a MutationRecord, remote_id: Option<&'a str>) -> Self {
        Self {
            entity_type: &action.entity_type,
            entity_id: action.entity_id,
            operation: action.operation,
            payload: &action.payload,
            remote_id,
        }
    }
}

/// Remote document store that accepts entity mutations.
///
/// `apply` returns the remote identifier of the entity on success. Any error
/// is treated as retryable by the caller; transient and permanent failures
/// are not distinguished.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn apply(&self, request: &ApplyRequest<'_>) -> Result<String>;
}
