//! Lock Table - per-session exclusive locks
//!
//! Maps a session id to its current holder and a FIFO queue of waiters. Release hands
//! the lock directly to the oldest live waiter, so a newcomer can never overtake a
//! queued request. All bookkeeping happens under one short synchronous mutex; only the
//! wait itself is async.
//!
//! A wait that is cancelled leaves the queue, and passes the lock on if it had already
//! been granted. A held lock is owned by a [`LockGuard`], which releases it on drop.

use chrono::{DateTime, Utc};
use stasis_core::{with_timeout, SessionId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::{SessionError, SessionResult};

/// Identity of a lock holder; one per handle
pub type HolderId = Uuid;

/// An active lock
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub session_id: SessionId,
    pub holder: HolderId,
    pub acquired_at: Instant,
    pub acquired_wall: DateTime<Utc>,
}

impl LockEntry {
    fn new(session_id: &SessionId, holder: HolderId) -> Self {
        Self {
            session_id: session_id.clone(),
            holder,
            acquired_at: Instant::now(),
            acquired_wall: Utc::now(),
        }
    }

    /// How long the lock has been held
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Outcome of [`LockTable::try_lock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired { waited: Duration },
    TimedOut { waited: Duration },
}

struct Waiter {
    holder: HolderId,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockSlot {
    entry: Option<LockEntry>,
    waiters: VecDeque<Waiter>,
}

impl LockSlot {
    fn is_idle(&self) -> bool {
        self.entry.is_none() && self.waiters.is_empty()
    }

    fn is_held_by(&self, holder: HolderId) -> bool {
        self.entry.as_ref().map(|entry| entry.holder) == Some(holder)
    }

    /// Pass the lock to the oldest waiter that is still listening
    fn hand_off(&mut self, session_id: &SessionId) {
        self.entry = None;
        while let Some(waiter) = self.waiters.pop_front() {
            self.entry = Some(LockEntry::new(session_id, waiter.holder));
            if waiter.grant.send(()).is_ok() {
                debug!(session_id = %session_id, holder = %waiter.holder, "Lock handed to next waiter");
                return;
            }
            self.entry = None;
        }
    }
}

/// A queued request that has not yet seen its outcome
///
/// Dropping it unsettled means the waiting future was cancelled.
struct PendingWait<'a> {
    table: &'a LockTable,
    session_id: &'a SessionId,
    holder: HolderId,
    settled: bool,
}

impl PendingWait<'_> {
    /// Settle a wait whose grant did not arrive in time; the table has the final say
    fn settle_late(&mut self) -> bool {
        self.settled = true;
        let mut slots = self.table.slots();
        let Some(slot) = slots.get_mut(self.session_id) else {
            return false;
        };
        if slot.is_held_by(self.holder) {
            return true;
        }
        slot.waiters.retain(|waiter| waiter.holder != self.holder);
        if slot.is_idle() {
            slots.remove(self.session_id);
        }
        false
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let mut slots = self.table.slots();
        let Some(slot) = slots.get_mut(self.session_id) else {
            return;
        };
        if slot.is_held_by(self.holder) {
            debug!(
                session_id = %self.session_id,
                holder = %self.holder,
                "Lock granted to a cancelled wait, passing it on"
            );
            slot.hand_off(self.session_id);
        } else {
            slot.waiters.retain(|waiter| waiter.holder != self.holder);
        }
        if slot.is_idle() {
            slots.remove(self.session_id);
        }
    }
}

/// Ownership of one held lock; dropping it releases the lock
pub struct LockGuard {
    table: Arc<LockTable>,
    session_id: SessionId,
    holder: HolderId,
    armed: bool,
}

impl LockGuard {
    pub(crate) fn new(table: Arc<LockTable>, session_id: SessionId, holder: HolderId) -> Self {
        Self {
            table,
            session_id,
            holder,
            armed: true,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// False once the watchdog has broken the lock
    pub fn is_held(&self) -> bool {
        self.table.is_held_by(&self.session_id, self.holder)
    }

    /// Release now; `NotHeld` means the lock was already broken
    pub fn release(mut self) -> SessionResult<()> {
        self.armed = false;
        self.table.unlock(&self.session_id, self.holder)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(error) = self.table.unlock(&self.session_id, self.holder) {
            debug!(session_id = %self.session_id, error = %error, "Lock already released");
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("session_id", &self.session_id)
            .field("holder", &self.holder)
            .finish()
    }
}

/// Process-wide registry of session locks
#[derive(Default)]
pub struct LockTable {
    slots: Mutex<HashMap<SessionId, LockSlot>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while the mutex is held cannot leave a slot half-updated, so the
    // contents of a poisoned mutex are still usable.
    fn slots(&self) -> MutexGuard<'_, HashMap<SessionId, LockSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock on `session_id` for `holder`, waiting in FIFO order up to `timeout`
    ///
    /// Dropping the returned future before it completes gives up the place in the queue.
    pub async fn try_lock(
        &self,
        session_id: &SessionId,
        holder: HolderId,
        timeout: Duration,
    ) -> LockAcquisition {
        let started = Instant::now();

        let granted = {
            let mut slots = self.slots();
            let slot = slots.entry(session_id.clone()).or_default();
            if slot.is_idle() {
                slot.entry = Some(LockEntry::new(session_id, holder));
                return LockAcquisition::Acquired {
                    waited: Duration::ZERO,
                };
            }

            let (grant, granted) = oneshot::channel();
            slot.waiters.push_back(Waiter { holder, grant });
            debug!(
                session_id = %session_id,
                holder = %holder,
                queue_len = slot.waiters.len(),
                "Waiting for session lock"
            );
            granted
        };

        let mut pending = PendingWait {
            table: self,
            session_id,
            holder,
            settled: false,
        };

        let timeout_ms = timeout.as_millis().max(1) as u64;
        if let Ok(Ok(())) = with_timeout(granted, timeout_ms, "session_lock_wait").await {
            pending.settled = true;
            return LockAcquisition::Acquired {
                waited: started.elapsed(),
            };
        }

        // The grant may have raced the deadline
        let acquired = pending.settle_late();
        let waited = started.elapsed();
        if acquired {
            LockAcquisition::Acquired { waited }
        } else {
            LockAcquisition::TimedOut { waited }
        }
    }

    /// [`try_lock`](Self::try_lock) returning a guard that owns the acquired lock
    pub async fn lock_owned(
        self: &Arc<Self>,
        session_id: &SessionId,
        holder: HolderId,
        timeout: Duration,
    ) -> Result<(LockGuard, Duration), Duration> {
        match self.try_lock(session_id, holder, timeout).await {
            LockAcquisition::Acquired { waited } => Ok((
                LockGuard::new(Arc::clone(self), session_id.clone(), holder),
                waited,
            )),
            LockAcquisition::TimedOut { waited } => Err(waited),
        }
    }

    /// Release a lock; fails with `NotHeld` unless `holder` currently owns it
    pub fn unlock(&self, session_id: &SessionId, holder: HolderId) -> SessionResult<()> {
        let mut slots = self.slots();
        let slot = match slots.get_mut(session_id) {
            Some(slot) if slot.is_held_by(holder) => slot,
            _ => {
                return Err(SessionError::NotHeld {
                    session_id: session_id.clone(),
                    holder: holder.to_string(),
                })
            }
        };

        slot.hand_off(session_id);
        if slot.is_idle() {
            slots.remove(session_id);
        }
        Ok(())
    }

    /// Whether `holder` currently owns the lock on `session_id`
    pub fn is_held_by(&self, session_id: &SessionId, holder: HolderId) -> bool {
        self.slots()
            .get(session_id)
            .is_some_and(|slot| slot.is_held_by(holder))
    }

    /// Current holder of a session's lock
    pub fn holder(&self, session_id: &SessionId) -> Option<LockEntry> {
        self.slots()
            .get(session_id)
            .and_then(|slot| slot.entry.clone())
    }

    /// Number of sessions currently locked
    pub fn locked_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    /// Break every lock held longer than `max_hold`, handing each to its next waiter
    ///
    /// Returns the broken entries. Each one is an operational fault: its holder stopped
    /// making progress or forgot to close its handle.
    pub fn sweep_expired(&self, max_hold: Duration) -> Vec<LockEntry> {
        let mut slots = self.slots();
        let mut broken = Vec::new();

        for (session_id, slot) in slots.iter_mut() {
            let expired = slot
                .entry
                .as_ref()
                .is_some_and(|entry| entry.held_for() > max_hold);
            if !expired {
                continue;
            }

            if let Some(entry) = slot.entry.take() {
                error!(
                    session_id = %session_id,
                    holder = %entry.holder,
                    held_ms = entry.held_for().as_millis() as u64,
                    acquired_at = %entry.acquired_wall,
                    max_hold_ms = max_hold.as_millis() as u64,
                    "Forcibly releasing session lock held past its maximum hold time"
                );
                broken.push(entry);
            }
            slot.hand_off(session_id);
        }

        slots.retain(|_, slot| !slot.is_idle());
        broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let table = LockTable::new();
        let id = sid("S1");
        let holder = Uuid::new_v4();

        let acquired = table.try_lock(&id, holder, LONG).await;
        assert!(matches!(acquired, LockAcquisition::Acquired { .. }));
        assert!(table.is_held_by(&id, holder));
        assert_eq!(table.locked_count(), 1);

        table.unlock(&id, holder).unwrap();
        assert!(!table.is_held_by(&id, holder));
        assert_eq!(table.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_unlock_by_stranger_is_not_held() {
        let table = LockTable::new();
        let id = sid("S1");
        let owner = Uuid::new_v4();
        table.try_lock(&id, owner, LONG).await;

        let err = table.unlock(&id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, SessionError::NotHeld { .. }));
        assert!(table.is_held_by(&id, owner));

        let err = table.unlock(&sid("other"), owner).unwrap_err();
        assert!(matches!(err, SessionError::NotHeld { .. }));
    }

    #[tokio::test]
    async fn test_wait_times_out_and_leaves_queue() {
        let table = LockTable::new();
        let id = sid("S1");
        let owner = Uuid::new_v4();
        table.try_lock(&id, owner, LONG).await;

        let late = Uuid::new_v4();
        let outcome = table.try_lock(&id, late, Duration::from_millis(30)).await;
        assert!(matches!(outcome, LockAcquisition::TimedOut { .. }));

        // The timed-out waiter must not be granted the lock afterwards
        table.unlock(&id, owner).unwrap();
        assert!(table.holder(&id).is_none());
    }

    #[tokio::test]
    async fn test_unrelated_sessions_do_not_block() {
        let table = LockTable::new();
        table.try_lock(&sid("A"), Uuid::new_v4(), LONG).await;

        let outcome = table
            .try_lock(&sid("B"), Uuid::new_v4(), Duration::from_millis(10))
            .await;
        assert_eq!(
            outcome,
            LockAcquisition::Acquired {
                waited: Duration::ZERO
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_are_served_in_arrival_order() {
        let table = Arc::new(LockTable::new());
        let id = sid("S1");
        let first = Uuid::new_v4();
        table.try_lock(&id, first, LONG).await;

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for label in ["second", "third", "fourth"] {
            let table = Arc::clone(&table);
            let id = id.clone();
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                let holder = Uuid::new_v4();
                let outcome = table.try_lock(&id, holder, LONG).await;
                assert!(matches!(outcome, LockAcquisition::Acquired { .. }));
                order_tx.send(label).unwrap();
                table.unlock(&id, holder).unwrap();
            }));
            // Let each waiter enqueue before the next arrives
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        table.unlock(&id, first).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        drop(order_tx);

        let mut order = Vec::new();
        while let Some(label) = order_rx.recv().await {
            order.push(label);
        }
        assert_eq!(order, vec!["second", "third", "fourth"]);
    }

    #[tokio::test]
    async fn test_sweep_breaks_overdue_lock_and_hands_off() {
        let table = Arc::new(LockTable::new());
        let id = sid("S1");
        let stuck = Uuid::new_v4();
        table.try_lock(&id, stuck, LONG).await;

        let next = Uuid::new_v4();
        let waiter = {
            let table = Arc::clone(&table);
            let id = id.clone();
            tokio::spawn(async move { table.try_lock(&id, next, LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(table.sweep_expired(Duration::from_secs(60)).is_empty());
        let broken = table.sweep_expired(Duration::from_millis(10));
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].holder, stuck);

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, LockAcquisition::Acquired { .. }));
        assert!(table.is_held_by(&id, next));
        assert!(matches!(
            table.unlock(&id, stuck),
            Err(SessionError::NotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_the_queue() {
        let table = LockTable::new();
        let id = sid("S1");
        let owner = Uuid::new_v4();
        table.try_lock(&id, owner, LONG).await;

        let gone = Uuid::new_v4();
        let waiting = tokio::time::timeout(
            Duration::from_millis(20),
            table.try_lock(&id, gone, LONG),
        )
        .await;
        assert!(waiting.is_err());

        table.unlock(&id, owner).unwrap();
        assert!(table.holder(&id).is_none());
        assert_eq!(table.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_grant_to_cancelled_wait_is_passed_on() {
        let table = LockTable::new();
        let id = sid("S1");
        let owner = Uuid::new_v4();
        let granted = Uuid::new_v4();
        table.try_lock(&id, owner, LONG).await;

        {
            let waiting = table.try_lock(&id, granted, LONG);
            tokio::pin!(waiting);
            assert!(tokio::time::timeout(Duration::from_millis(20), &mut waiting)
                .await
                .is_err());

            // Hand the lock over, then drop the wait before it observes the grant
            table.unlock(&id, owner).unwrap();
            assert!(table.is_held_by(&id, granted));
        }

        assert!(table.holder(&id).is_none());
        let next = Uuid::new_v4();
        assert_eq!(
            table.try_lock(&id, next, Duration::from_millis(10)).await,
            LockAcquisition::Acquired {
                waited: Duration::ZERO
            }
        );
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let table = Arc::new(LockTable::new());
        let id = sid("S1");

        let (guard, waited) = table.lock_owned(&id, Uuid::new_v4(), LONG).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
        assert!(guard.is_held());
        assert!(table
            .lock_owned(&id, Uuid::new_v4(), Duration::from_millis(10))
            .await
            .is_err());

        drop(guard);
        assert_eq!(table.locked_count(), 0);

        let (guard, _) = table.lock_owned(&id, Uuid::new_v4(), LONG).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(table.sweep_expired(Duration::from_millis(1)).len(), 1);
        assert!(!guard.is_held());
        assert!(matches!(guard.release(), Err(SessionError::NotHeld { .. })));
    }
}
