//! In-memory session storage
//!
//! Snapshots are kept in their serialized form so that reads hand out independent
//! copies and stored bytes only change when a write lands. Deleting a session leaves
//! a tombstone holding its last revision, so a recreated session continues the
//! sequence instead of restarting at `Revision(0)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stasis_core::{
    not_found_error, AppliedOperation, CasOutcome, GranularOperation, Revision, SessionData,
    SessionId, StasisResult, StorageBackend, StoredSession,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct MemoryEntry {
    /// `None` once the session has been deleted
    bytes: Option<Vec<u8>>,
    revision: Revision,
    updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    fn live_revision(&self) -> Option<Revision> {
        self.bytes.as_ref().map(|_| self.revision)
    }
}

/// In-memory session storage (default implementation)
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    sessions: Arc<RwLock<HashMap<SessionId, MemoryEntry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes of a session, for byte-level inspection
    pub async fn raw_bytes(&self, id: &SessionId) -> Option<Vec<u8>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).and_then(|entry| entry.bytes.clone())
    }

    /// Number of stored sessions, not counting deleted ones
    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|entry| entry.bytes.is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self, id: &SessionId) -> StasisResult<Option<StoredSession>> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(MemoryEntry {
                bytes: Some(bytes),
                revision,
                updated_at,
            }) => Ok(Some(StoredSession {
                data: SessionData::from_bytes(bytes)?,
                revision: *revision,
                updated_at: *updated_at,
            })),
            _ => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected: Option<Revision>,
        data: &SessionData,
    ) -> StasisResult<CasOutcome> {
        let bytes = data.to_bytes()?;

        let mut sessions = self.sessions.write().await;
        let entry = sessions.get(id);
        let current = entry.and_then(MemoryEntry::live_revision);
        if current != expected {
            debug!(
                session_id = %id,
                expected = ?expected,
                current = ?current,
                "Compare-and-swap rejected"
            );
            return Ok(CasOutcome::Conflict { current });
        }

        // A tombstone carries its last revision forward
        let revision = match entry {
            Some(entry) => entry.revision.next()?,
            None => Revision::INITIAL,
        };
        sessions.insert(
            id.clone(),
            MemoryEntry {
                bytes: Some(bytes),
                revision,
                updated_at: Utc::now(),
            },
        );
        debug!(session_id = %id, revision = %revision, "Saved session to memory storage");
        Ok(CasOutcome::Committed(revision))
    }

    async fn apply_atomic_op(
        &self,
        id: &SessionId,
        operation: &GranularOperation,
    ) -> StasisResult<AppliedOperation> {
        operation.validate()?;

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| not_found_error!(id, "memory_backend"))?;
        let bytes = entry
            .bytes
            .as_deref()
            .ok_or_else(|| not_found_error!(id, "memory_backend"))?;

        let mut data = SessionData::from_bytes(bytes)?;
        let result = operation.apply_to(&mut data)?;
        let bytes = data.to_bytes()?;
        let revision = entry.revision.next()?;

        entry.bytes = Some(bytes);
        entry.revision = revision;
        entry.updated_at = Utc::now();

        debug!(
            session_id = %id,
            operation = operation.name(),
            revision = %entry.revision,
            "Applied granular operation in memory storage"
        );
        Ok(AppliedOperation {
            result,
            revision: entry.revision,
        })
    }

    async fn delete(&self, id: &SessionId) -> StasisResult<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(id) {
            if entry.bytes.take().is_some() {
                entry.updated_at = Utc::now();
                debug!(
                    session_id = %id,
                    revision = %entry.revision,
                    "Deleted session from memory storage"
                );
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> StasisResult<()> {
        // Memory storage is always healthy
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stasis_core::{SessionValue, StasisError};

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn cart(mugs: i64) -> SessionData {
        let mut data = SessionData::new();
        data.set("cart.mug", SessionValue::Int(mugs)).unwrap();
        data
    }

    #[tokio::test]
    async fn test_first_save_is_revision_zero() {
        let backend = MemoryBackend::new();
        let id = sid("S1");

        assert!(backend.load(&id).await.unwrap().is_none());
        let outcome = backend.compare_and_swap(&id, None, &cart(1)).await.unwrap();
        assert_eq!(outcome, CasOutcome::Committed(Revision(0)));

        let stored = backend.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.revision, Revision(0));
        assert_eq!(stored.data, cart(1));
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected_without_write() {
        let backend = MemoryBackend::new();
        let id = sid("S1");
        backend.compare_and_swap(&id, None, &cart(1)).await.unwrap();
        backend
            .compare_and_swap(&id, Some(Revision(0)), &cart(2))
            .await
            .unwrap();
        let before = backend.raw_bytes(&id).await.unwrap();

        let outcome = backend
            .compare_and_swap(&id, Some(Revision(0)), &cart(99))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                current: Some(Revision(1))
            }
        );
        assert_eq!(backend.raw_bytes(&id).await.unwrap(), before);

        // Create-if-absent also refuses to clobber
        let outcome = backend.compare_and_swap(&id, None, &cart(0)).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_apply_requires_existing_session() {
        let backend = MemoryBackend::new();
        let err = backend
            .apply_atomic_op(&sid("nobody"), &GranularOperation::increment("n", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StasisError::NotFound { .. }));
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_apply_advances_revision() {
        let backend = MemoryBackend::new();
        let id = sid("S1");
        backend.compare_and_swap(&id, None, &cart(0)).await.unwrap();

        let applied = backend
            .apply_atomic_op(&id, &GranularOperation::increment("cart.mug", 5))
            .await
            .unwrap();
        assert_eq!(applied.result, SessionValue::Int(5));
        assert_eq!(applied.revision, Revision(1));
    }

    #[tokio::test]
    async fn test_invalid_operation_has_no_effect() {
        let backend = MemoryBackend::new();
        let id = sid("S1");
        backend.compare_and_swap(&id, None, &cart(0)).await.unwrap();
        let before = backend.raw_bytes(&id).await.unwrap();

        let err = backend
            .apply_atomic_op(&id, &GranularOperation::add_to_set("cart.mug", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StasisError::InvalidOperation { .. }));
        assert_eq!(backend.raw_bytes(&id).await.unwrap(), before);
        assert_eq!(backend.load(&id).await.unwrap().unwrap().revision, Revision(0));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        let id = sid("S1");
        backend.compare_and_swap(&id, None, &cart(1)).await.unwrap();

        backend.delete(&id).await.unwrap();
        backend.delete(&id).await.unwrap();
        assert!(backend.load(&id).await.unwrap().is_none());
        assert!(backend.raw_bytes(&id).await.is_none());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_recreated_session_continues_revisions() {
        let backend = MemoryBackend::new();
        let id = sid("S1");
        backend.compare_and_swap(&id, None, &cart(1)).await.unwrap();
        backend
            .compare_and_swap(&id, Some(Revision(0)), &cart(2))
            .await
            .unwrap();
        backend.delete(&id).await.unwrap();

        // Neither an update against the old revision nor an op may revive it
        let outcome = backend
            .compare_and_swap(&id, Some(Revision(1)), &cart(9))
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict { current: None });
        let err = backend
            .apply_atomic_op(&id, &GranularOperation::increment("cart.mug", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StasisError::NotFound { .. }));

        let outcome = backend.compare_and_swap(&id, None, &cart(3)).await.unwrap();
        assert_eq!(outcome, CasOutcome::Committed(Revision(2)));

        let outcome = backend
            .compare_and_swap(&id, Some(Revision(1)), &cart(9))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                current: Some(Revision(2))
            }
        );
        assert_eq!(backend.load(&id).await.unwrap().unwrap().data, cart(3));
        assert_eq!(backend.len().await, 1);
    }
}
