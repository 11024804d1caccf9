//! Session handles
//!
//! A [`SessionHandle`] owns one request's copy of a session snapshot. Closing it with
//! [`SessionHandle::commit`] or [`SessionHandle::discard`] consumes it, so a handle can be
//! closed at most once. Dropping a handle that was never closed is treated as a leak:
//! the lock is released, nothing is written, and a warning is logged.

use serde::{Deserialize, Serialize};
use stasis_core::{
    AccessMode, ConcurrencyStrategy, Revision, SessionData, SessionId, SessionValue,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{SessionError, SessionResult};
use crate::lock_table::{HolderId, LockGuard};
use crate::manager::ManagerInner;

/// Lifecycle of a handle
///
/// `Committed`, `Discarded` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Acquired(AccessMode),
    Committed(Revision),
    Discarded,
    /// The watchdog broke the handle's lock
    Expired,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HandleState::Acquired(_))
    }
}

pub struct SessionHandle {
    inner: Arc<ManagerInner>,
    id: SessionId,
    holder: HolderId,
    mode: AccessMode,
    strategy: ConcurrencyStrategy,
    data: SessionData,
    revision: Option<Revision>,
    dirty: bool,
    lock: Option<LockGuard>,
    state: HandleState,
}

impl SessionHandle {
    pub(crate) fn new(
        inner: Arc<ManagerInner>,
        id: SessionId,
        holder: HolderId,
        mode: AccessMode,
        data: SessionData,
        revision: Option<Revision>,
        lock: Option<LockGuard>,
    ) -> Self {
        let strategy = inner.config.strategy;
        Self {
            inner,
            id,
            holder,
            mode,
            strategy,
            data,
            revision,
            dirty: false,
            lock,
            state: HandleState::Acquired(mode),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Revision the snapshot was loaded at, `None` for a session not yet saved
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    /// Current lifecycle state; reports `Expired` once the watchdog has broken the lock
    pub fn state(&self) -> HandleState {
        if self.state == HandleState::Acquired(self.mode) && self.lock_was_broken() {
            return HandleState::Expired;
        }
        self.state
    }

    pub fn get(&self, path: &str) -> Option<&SessionValue> {
        self.data.get(path)
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Set the value at `path` in the local snapshot, returning the previous value
    pub fn set<V: Into<SessionValue>>(
        &mut self,
        path: &str,
        value: V,
    ) -> SessionResult<Option<SessionValue>> {
        self.ensure_writable(|| format!("set '{}'", path))?;
        let previous = self
            .data
            .set(path, value.into())
            .map_err(|e| SessionError::from_core(&self.id, e))?;
        self.dirty = true;
        Ok(previous)
    }

    /// Remove the value at `path` from the local snapshot
    pub fn remove(&mut self, path: &str) -> SessionResult<Option<SessionValue>> {
        self.ensure_writable(|| format!("remove '{}'", path))?;
        let removed = self
            .data
            .remove(path)
            .map_err(|e| SessionError::from_core(&self.id, e))?;
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// Persist the snapshot and close the handle
    ///
    /// Under the locking strategy the write is fenced on the revision loaded at
    /// acquisition, and fails with `LockLost` if the lock was broken meanwhile. Under the
    /// optimistic strategy a stale revision fails with `Conflict`. Failed commits write
    /// nothing; the caller starts over from a fresh `acquire`.
    pub async fn commit(mut self) -> SessionResult<Revision> {
        let result = self.persist().await;
        self.release_lock();

        match &result {
            Ok(revision) => {
                self.transition(HandleState::Committed(*revision));
                self.inner.metrics.record_commit();
                debug!(
                    session_id = %self.id,
                    holder = %self.holder,
                    revision = %revision,
                    "Committed session"
                );
            }
            Err(error) => {
                let next = match error {
                    SessionError::LockLost { .. } => HandleState::Expired,
                    _ => HandleState::Discarded,
                };
                self.transition(next);
                self.inner.metrics.record_failed_close();
                self.inner.metrics.record_error(error.category());
                debug!(
                    session_id = %self.id,
                    holder = %self.holder,
                    error = %error,
                    "Commit rejected"
                );
            }
        }
        result
    }

    /// Close the handle without writing
    ///
    /// Fails with `LockLost` if the watchdog broke the handle's lock; nothing is written
    /// either way.
    pub fn discard(mut self) -> SessionResult<()> {
        let lock_lost = self.lock_was_broken();
        self.release_lock();

        if lock_lost {
            self.transition(HandleState::Expired);
            self.inner.metrics.record_failed_close();
            self.inner.metrics.record_error("lock_lost");
            return Err(SessionError::LockLost {
                session_id: self.id.clone(),
            });
        }

        self.transition(HandleState::Discarded);
        self.inner.metrics.record_discard();
        debug!(session_id = %self.id, holder = %self.holder, "Discarded session handle");
        Ok(())
    }

    async fn persist(&self) -> SessionResult<Revision> {
        if self.mode == AccessMode::ReadOnly {
            return Err(SessionError::ReadOnlyViolation {
                session_id: self.id.clone(),
                attempted: "commit".to_string(),
            });
        }

        match self.strategy {
            ConcurrencyStrategy::Locking => {
                if self.lock_was_broken() {
                    return Err(SessionError::LockLost {
                        session_id: self.id.clone(),
                    });
                }
                // The revision read under the lock fences out writes from a later holder.
                match self
                    .inner
                    .clock
                    .commit_if_unchanged(&self.id, self.revision, &self.data)
                    .await
                {
                    Err(SessionError::Conflict { .. }) => Err(SessionError::LockLost {
                        session_id: self.id.clone(),
                    }),
                    other => other,
                }
            }
            ConcurrencyStrategy::Optimistic => {
                self.inner
                    .clock
                    .commit_if_unchanged(&self.id, self.revision, &self.data)
                    .await
            }
        }
    }

    fn ensure_writable(&self, attempted: impl FnOnce() -> String) -> SessionResult<()> {
        if self.mode == AccessMode::ReadOnly {
            let error = SessionError::ReadOnlyViolation {
                session_id: self.id.clone(),
                attempted: attempted(),
            };
            self.inner.metrics.record_error(error.category());
            return Err(error);
        }
        Ok(())
    }

    fn lock_was_broken(&self) -> bool {
        self.lock.as_ref().is_some_and(|lock| !lock.is_held())
    }

    fn release_lock(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        // NotHeld here means the watchdog already took the lock away.
        if let Err(error) = lock.release() {
            debug!(session_id = %self.id, error = %error, "Lock already released");
        }
    }

    fn transition(&mut self, next: HandleState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = next;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("holder", &self.holder)
            .field("mode", &self.mode)
            .field("revision", &self.revision)
            .field("dirty", &self.dirty)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        warn!(
            session_id = %self.id,
            holder = %self.holder,
            mode = ?self.mode,
            dirty = self.dirty,
            "Session handle dropped without commit or discard; discarding it"
        );
        self.release_lock();
        self.state = HandleState::Discarded;
        self.inner.metrics.record_leak();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!HandleState::Acquired(AccessMode::ReadWrite).is_terminal());
        assert!(HandleState::Committed(Revision(3)).is_terminal());
        assert!(HandleState::Discarded.is_terminal());
        assert!(HandleState::Expired.is_terminal());
    }

    #[test]
    fn test_state_wire_shape() {
        let states = [
            HandleState::Acquired(AccessMode::ReadWrite),
            HandleState::Committed(Revision(3)),
            HandleState::Expired,
        ];
        assert_eq!(
            serde_json::to_value(states).unwrap(),
            serde_json::json!([{ "acquired": "read_write" }, { "committed": 3 }, "expired"])
        );
        let parsed: HandleState = serde_json::from_str(r#"{"committed":7}"#).unwrap();
        assert_eq!(parsed, HandleState::Committed(Revision(7)));
    }
}
