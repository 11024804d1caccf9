//! Granular Operation Log
//!
//! Applies [`GranularOperation`]s straight at the storage layer and remembers the most
//! recent ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stasis_core::{
    AppliedOperation, GranularOperation, Revision, SessionId, SessionValue, StorageBackend,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::errors::{SessionError, SessionResult};
use crate::metrics::SessionMetrics;

/// One applied operation as kept in the journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub session_id: SessionId,
    pub operation: GranularOperation,
    pub result: SessionValue,
    pub revision: Revision,
    pub applied_at: DateTime<Utc>,
}

pub struct OperationLog {
    backend: Arc<dyn StorageBackend>,
    metrics: Arc<SessionMetrics>,
    journal: Mutex<VecDeque<OperationRecord>>,
    capacity: usize,
}

impl OperationLog {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        metrics: Arc<SessionMetrics>,
        capacity: usize,
    ) -> Self {
        Self {
            backend,
            metrics,
            journal: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn journal(&self) -> MutexGuard<'_, VecDeque<OperationRecord>> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one operation atomically at the backend
    pub async fn apply(
        &self,
        session_id: &SessionId,
        operation: &GranularOperation,
    ) -> SessionResult<AppliedOperation> {
        operation
            .validate()
            .map_err(|e| SessionError::from_core(session_id, e))?;

        let applied = self
            .backend
            .apply_atomic_op(session_id, operation)
            .await
            .map_err(|e| SessionError::from_core(session_id, e))?;

        debug!(
            session_id = %session_id,
            operation = %operation,
            revision = %applied.revision,
            "Applied granular operation"
        );
        self.record(session_id, operation, &applied);
        Ok(applied)
    }

    /// Apply operations in order, stopping at the first failure
    ///
    /// Each operation is atomic on its own; the sequence as a whole is not, so
    /// operations before the failing one stay applied.
    pub async fn apply_all(
        &self,
        session_id: &SessionId,
        operations: &[GranularOperation],
    ) -> SessionResult<Vec<AppliedOperation>> {
        let mut applied = Vec::with_capacity(operations.len());
        for operation in operations {
            applied.push(self.apply(session_id, operation).await?);
        }
        Ok(applied)
    }

    fn record(
        &self,
        session_id: &SessionId,
        operation: &GranularOperation,
        applied: &AppliedOperation,
    ) {
        self.metrics.record_operation();
        if self.capacity == 0 {
            return;
        }

        let mut journal = self.journal();
        journal.push_back(OperationRecord {
            session_id: session_id.clone(),
            operation: operation.clone(),
            result: applied.result.clone(),
            revision: applied.revision,
            applied_at: Utc::now(),
        });
        while journal.len() > self.capacity {
            journal.pop_front();
        }
    }

    /// The last `count` applied operations, oldest first
    pub fn recent(&self, count: usize) -> Vec<OperationRecord> {
        let journal = self.journal();
        let skip = journal.len().saturating_sub(count);
        journal.iter().skip(skip).cloned().collect()
    }
}
