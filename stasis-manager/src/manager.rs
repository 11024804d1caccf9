//! Session Manager - concurrency-controlled access to session state
//!
//! Hands out [`SessionHandle`]s under one of two strategies. With `Locking`, a
//! ReadWrite handle holds the session's exclusive lock from `acquire` until it is
//! closed, so writers to one session run one at a time. With `Optimistic`, nothing is
//! held and commits are revision-checked; the loser of a race gets `Conflict`.
//! Granular operations bypass handles entirely and are applied at the storage layer.
//!
//! The manager never retries on the caller's behalf.

use stasis_core::{
    AccessMode, ConcurrencyStrategy, GranularOperation, ManagerConfig, MissingSessionPolicy,
    Revision, SessionData, SessionId, SessionValue, StasisConfig, StasisResult, StorageBackend,
};
use stasis_storage::MemoryBackend;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{SessionError, SessionResult};
use crate::handle::SessionHandle;
use crate::lock_table::{HolderId, LockGuard, LockTable};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::operation_log::{OperationLog, OperationRecord};
use crate::version_clock::VersionClock;

/// State shared between the manager, its handles and the watchdog
pub(crate) struct ManagerInner {
    pub(crate) config: ManagerConfig,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) locks: Arc<LockTable>,
    pub(crate) clock: VersionClock,
    pub(crate) operations: OperationLog,
    pub(crate) metrics: Arc<SessionMetrics>,
}

impl ManagerInner {
    fn sweep_expired_locks(&self) -> usize {
        let broken = self.locks.sweep_expired(self.config.max_hold());
        if !broken.is_empty() {
            self.metrics.record_forced_releases(broken.len());
        }
        broken.len()
    }
}

pub struct SessionManager {
    inner: Arc<ManagerInner>,
    watchdog_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl SessionManager {
    /// Create a manager over `backend`
    ///
    /// The lock watchdog is spawned on the current Tokio runtime; outside a runtime it
    /// is not started and [`SessionManager::sweep_expired_locks`] must be called by hand.
    pub fn new(config: ManagerConfig, backend: Arc<dyn StorageBackend>) -> StasisResult<Self> {
        config.validate()?;

        let metrics = Arc::new(SessionMetrics::default());
        let inner = Arc::new(ManagerInner {
            locks: Arc::new(LockTable::new()),
            clock: VersionClock::new(Arc::clone(&backend)),
            operations: OperationLog::new(
                Arc::clone(&backend),
                Arc::clone(&metrics),
                config.operation_log_capacity,
            ),
            metrics,
            backend,
            config,
        });

        let watchdog_shutdown = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(Self::spawn_watchdog(&runtime, Arc::clone(&inner))),
            Err(_) => {
                warn!("No Tokio runtime available, lock watchdog not started");
                None
            }
        };

        info!(
            strategy = ?inner.config.strategy,
            backend = inner.backend.name(),
            lock_timeout_ms = inner.config.lock_timeout_ms,
            max_hold_ms = inner.config.max_hold_ms,
            "Session manager started"
        );

        Ok(Self {
            inner,
            watchdog_shutdown: Mutex::new(watchdog_shutdown),
        })
    }

    /// Create a manager with the backend described by `config.storage`
    pub async fn from_config(config: &StasisConfig) -> StasisResult<Self> {
        config.validate()?;
        let backend = stasis_storage::connect(&config.storage).await?;
        Self::new(config.manager.clone(), backend)
    }

    /// Create a manager over a fresh in-memory backend
    pub fn with_memory(config: ManagerConfig) -> StasisResult<Self> {
        Self::new(config, Arc::new(MemoryBackend::new()))
    }

    fn spawn_watchdog(
        runtime: &tokio::runtime::Handle,
        inner: Arc<ManagerInner>,
    ) -> oneshot::Sender<()> {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let period = inner.config.sweep_interval();

        runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        inner.sweep_expired_locks();
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Lock watchdog stopped");
                        break;
                    }
                }
            }
        });

        shutdown_tx
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn strategy(&self) -> ConcurrencyStrategy {
        self.inner.config.strategy
    }

    /// Open a handle on a session
    ///
    /// Under `Locking`, a ReadWrite acquisition waits up to `lock_timeout_ms` for the
    /// session lock and fails with `LockTimeout`. ReadOnly acquisitions never wait.
    pub async fn acquire(
        &self,
        session_id: &SessionId,
        mode: AccessMode,
    ) -> SessionResult<SessionHandle> {
        let result = self.open_handle(session_id, mode).await;
        self.observed(result)
    }

    /// Open a ReadOnly handle
    pub async fn read(&self, session_id: &SessionId) -> SessionResult<SessionHandle> {
        self.acquire(session_id, AccessMode::ReadOnly).await
    }

    async fn open_handle(
        &self,
        session_id: &SessionId,
        mode: AccessMode,
    ) -> SessionResult<SessionHandle> {
        let holder = Uuid::new_v4();
        let takes_lock =
            self.inner.config.strategy == ConcurrencyStrategy::Locking && mode == AccessMode::ReadWrite;

        // Dropped on any early return, including cancellation of this future
        let guard = if takes_lock {
            Some(self.lock(session_id, holder).await?)
        } else {
            None
        };

        let (data, revision) = self.load_for_handle(session_id).await?;

        self.inner.metrics.record_acquire(mode);
        debug!(
            session_id = %session_id,
            holder = %holder,
            mode = ?mode,
            revision = ?revision,
            "Acquired session handle"
        );

        Ok(SessionHandle::new(
            Arc::clone(&self.inner),
            session_id.clone(),
            holder,
            mode,
            data,
            revision,
            guard,
        ))
    }

    async fn load_for_handle(
        &self,
        session_id: &SessionId,
    ) -> SessionResult<(SessionData, Option<Revision>)> {
        match self.inner.clock.reserve(session_id).await? {
            Some(stored) => Ok((stored.data, Some(stored.revision))),
            None => match self.inner.config.missing_session {
                MissingSessionPolicy::Reject => Err(SessionError::NotFound {
                    session_id: session_id.clone(),
                }),
                MissingSessionPolicy::StartEmpty => Ok((SessionData::new(), None)),
            },
        }
    }

    /// Apply one granular operation and return its result value
    pub async fn apply(
        &self,
        session_id: &SessionId,
        operation: &GranularOperation,
    ) -> SessionResult<SessionValue> {
        let mut results = self
            .apply_all(session_id, std::slice::from_ref(operation))
            .await?;
        results.pop().ok_or_else(|| SessionError::InvalidOperation {
            session_id: session_id.clone(),
            reason: format!("{} produced no result", operation.name()),
        })
    }

    /// Apply granular operations in order, stopping at the first failure
    ///
    /// Under `Locking` the session lock is held for the duration, so the operations
    /// never land inside an open ReadWrite handle's lifetime.
    pub async fn apply_all(
        &self,
        session_id: &SessionId,
        operations: &[GranularOperation],
    ) -> SessionResult<Vec<SessionValue>> {
        let result = self.apply_guarded(session_id, operations).await;
        self.observed(result)
    }

    async fn apply_guarded(
        &self,
        session_id: &SessionId,
        operations: &[GranularOperation],
    ) -> SessionResult<Vec<SessionValue>> {
        let _guard = self.lock_for_write(session_id).await?;
        self.apply_unguarded(session_id, operations).await
    }

    async fn apply_unguarded(
        &self,
        session_id: &SessionId,
        operations: &[GranularOperation],
    ) -> SessionResult<Vec<SessionValue>> {
        if self.inner.config.missing_session == MissingSessionPolicy::StartEmpty {
            self.inner.clock.ensure_exists(session_id).await?;
        }

        let applied = self
            .inner
            .operations
            .apply_all(session_id, operations)
            .await?;
        Ok(applied.into_iter().map(|a| a.result).collect())
    }

    /// Delete a session; deleting an unknown session succeeds
    pub async fn destroy(&self, session_id: &SessionId) -> SessionResult<()> {
        let result = self.destroy_guarded(session_id).await;
        self.observed(result)
    }

    async fn destroy_guarded(&self, session_id: &SessionId) -> SessionResult<()> {
        let _guard = self.lock_for_write(session_id).await?;
        self.inner
            .backend
            .delete(session_id)
            .await
            .map_err(|e| SessionError::from_core(session_id, e))?;

        info!(session_id = %session_id, "Destroyed session");
        Ok(())
    }

    /// Break locks held past `max_hold_ms` now, returning how many were broken
    pub fn sweep_expired_locks(&self) -> usize {
        self.inner.sweep_expired_locks()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of handles acquired and not yet closed
    pub fn open_handles(&self) -> u64 {
        self.metrics().open_handles
    }

    /// Number of sessions whose lock is currently held
    pub fn locked_sessions(&self) -> usize {
        self.inner.locks.locked_count()
    }

    /// The most recently applied granular operations, oldest first
    pub fn recent_operations(&self, count: usize) -> Vec<OperationRecord> {
        self.inner.operations.recent(count)
    }

    pub async fn health_check(&self) -> SessionResult<()> {
        self.inner
            .backend
            .health_check()
            .await
            .map_err(SessionError::Core)
    }

    /// Stop the lock watchdog; idempotent
    pub fn shutdown(&self) {
        let shutdown_tx = self
            .watchdog_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(());
            info!("Session manager shut down");
        }
    }

    async fn lock(&self, session_id: &SessionId, holder: HolderId) -> SessionResult<LockGuard> {
        let timeout = self.inner.config.lock_timeout();
        match self.inner.locks.lock_owned(session_id, holder, timeout).await {
            Ok((guard, waited)) => {
                self.inner.metrics.record_lock_wait(waited);
                Ok(guard)
            }
            Err(waited) => {
                warn!(
                    session_id = %session_id,
                    waited_ms = waited.as_millis() as u64,
                    "Timed out waiting for session lock"
                );
                Err(SessionError::LockTimeout {
                    session_id: session_id.clone(),
                    waited,
                })
            }
        }
    }

    /// The session lock for a one-shot write, taken only under `Locking`
    async fn lock_for_write(&self, session_id: &SessionId) -> SessionResult<Option<LockGuard>> {
        if self.inner.config.strategy != ConcurrencyStrategy::Locking {
            return Ok(None);
        }
        self.lock(session_id, Uuid::new_v4()).await.map(Some)
    }

    fn observed<T>(&self, result: SessionResult<T>) -> SessionResult<T> {
        if let Err(error) = &result {
            self.inner.metrics.record_error(error.category());
        }
        result
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
