//! Version Clock - revision-checked commits
//!
//! Every write the manager makes goes through here. The check-and-write itself is
//! delegated to [`StorageBackend::compare_and_swap`], which is atomic at the storage
//! layer; this type only translates its outcome into the session error taxonomy.

use stasis_core::{CasOutcome, Revision, SessionData, SessionId, StorageBackend, StoredSession};
use std::sync::Arc;
use tracing::debug;

use crate::errors::{SessionError, SessionResult};

pub struct VersionClock {
    backend: Arc<dyn StorageBackend>,
}

impl VersionClock {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Load a snapshot together with the revision a later commit must match
    pub async fn reserve(&self, session_id: &SessionId) -> SessionResult<Option<StoredSession>> {
        let stored = self
            .backend
            .load(session_id)
            .await
            .map_err(|e| SessionError::from_core(session_id, e))?;

        debug!(
            session_id = %session_id,
            revision = ?stored.as_ref().map(|s| s.revision),
            "Reserved session revision"
        );
        Ok(stored)
    }

    /// Write `data` only if the stored revision is still `expected`
    ///
    /// `expected = None` creates the session and conflicts if it already exists.
    pub async fn commit_if_unchanged(
        &self,
        session_id: &SessionId,
        expected: Option<Revision>,
        data: &SessionData,
    ) -> SessionResult<Revision> {
        let outcome = self
            .backend
            .compare_and_swap(session_id, expected, data)
            .await
            .map_err(|e| SessionError::from_core(session_id, e))?;

        match outcome {
            CasOutcome::Committed(revision) => Ok(revision),
            CasOutcome::Conflict { current } => Err(SessionError::Conflict {
                session_id: session_id.clone(),
                expected,
                actual: current,
            }),
        }
    }

    /// Create an empty session unless one already exists
    pub async fn ensure_exists(&self, session_id: &SessionId) -> SessionResult<()> {
        match self
            .commit_if_unchanged(session_id, None, &SessionData::new())
            .await
        {
            Ok(revision) => {
                debug!(session_id = %session_id, revision = %revision, "Created empty session");
                Ok(())
            }
            Err(SessionError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stasis_core::SessionValue;
    use stasis_storage::MemoryBackend;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let clock = VersionClock::new(Arc::new(MemoryBackend::new()));
        let id = sid("S1");
        assert!(clock.reserve(&id).await.unwrap().is_none());

        let mut data = SessionData::new();
        data.set("cart.mug", SessionValue::Int(1)).unwrap();
        let first = clock.commit_if_unchanged(&id, None, &data).await.unwrap();
        assert_eq!(first, Revision(0));

        let reserved = clock.reserve(&id).await.unwrap().unwrap();
        assert_eq!(reserved.revision, first);

        let second = clock
            .commit_if_unchanged(&id, Some(first), &data)
            .await
            .unwrap();
        assert_eq!(second, Revision(1));

        let err = clock
            .commit_if_unchanged(&id, Some(first), &data)
            .await
            .unwrap_err();
        match err {
            SessionError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, Some(Revision(0)));
                assert_eq!(actual, Some(Revision(1)));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ensure_exists_keeps_existing_data() {
        let clock = VersionClock::new(Arc::new(MemoryBackend::new()));
        let id = sid("S1");
        clock.ensure_exists(&id).await.unwrap();

        let mut data = SessionData::new();
        data.set("user", SessionValue::from("ada")).unwrap();
        clock
            .commit_if_unchanged(&id, Some(Revision(0)), &data)
            .await
            .unwrap();

        clock.ensure_exists(&id).await.unwrap();
        let stored = clock.reserve(&id).await.unwrap().unwrap();
        assert_eq!(stored.data, data);
        assert_eq!(stored.revision, Revision(1));
    }
}
