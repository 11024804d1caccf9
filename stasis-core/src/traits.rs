//! Core trait definitions

use crate::error::StasisResult;
use crate::operations::GranularOperation;
use crate::types::*;
use async_trait::async_trait;

/// Durable session store the manager is built on
///
/// Every method must be atomic on its own. In particular `compare_and_swap` and
/// `apply_atomic_op` must never be a separate read followed by a write that another
/// caller could interleave with.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the current snapshot, `None` if the session was never saved or was deleted
    async fn load(&self, id: &SessionId) -> StasisResult<Option<StoredSession>>;

    /// Replace the snapshot only if the stored revision equals `expected`
    ///
    /// `expected = None` means "create only if absent". Revisions are never reused for
    /// one id: recreating a deleted session continues after its last revision.
    async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected: Option<Revision>,
        data: &SessionData,
    ) -> StasisResult<CasOutcome>;

    /// Apply a granular operation to an existing session
    ///
    /// Fails with `NotFound` for unknown sessions and `InvalidOperation` when the
    /// operation does not fit the stored data; neither failure writes anything.
    async fn apply_atomic_op(
        &self,
        id: &SessionId,
        operation: &GranularOperation,
    ) -> StasisResult<AppliedOperation>;

    /// Remove a session; removing an unknown session is not an error
    ///
    /// The session's last revision must outlive it, see `compare_and_swap`.
    async fn delete(&self, id: &SessionId) -> StasisResult<()>;

    /// Health check for the storage backend
    async fn health_check(&self) -> StasisResult<()>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}
