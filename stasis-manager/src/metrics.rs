//! Session manager metrics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stasis_core::AccessMode;

/// Counters maintained by the session manager
#[derive(Debug, Default)]
pub struct SessionMetrics {
    // Handle lifecycle
    pub read_only_acquisitions: AtomicU64,
    pub read_write_acquisitions: AtomicU64,
    pub open_handles: AtomicU64,
    pub commits: AtomicU64,
    pub discards: AtomicU64,
    pub leaked_handles: AtomicU64,

    // Granular operations
    pub operations_applied: AtomicU64,

    // Lock wait times (in milliseconds)
    pub last_lock_wait_ms: AtomicU64,
    pub max_lock_wait_ms: AtomicU64,

    // Faults
    pub forced_releases: AtomicU64,

    // Error counts
    pub not_found_errors: AtomicU64,
    pub lock_timeout_errors: AtomicU64,
    pub conflict_errors: AtomicU64,
    pub lock_lost_errors: AtomicU64,
    pub invalid_request_errors: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl SessionMetrics {
    /// Record a handle being handed out
    pub fn record_acquire(&self, mode: AccessMode) {
        match mode {
            AccessMode::ReadOnly => self.read_only_acquisitions.fetch_add(1, Ordering::Relaxed),
            AccessMode::ReadWrite => self.read_write_acquisitions.fetch_add(1, Ordering::Relaxed),
        };
        self.open_handles.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a ReadWrite acquisition waited for its lock
    pub fn record_lock_wait(&self, waited: Duration) {
        let waited_ms = waited.as_millis() as u64;
        self.last_lock_wait_ms.store(waited_ms, Ordering::Relaxed);
        self.max_lock_wait_ms.fetch_max(waited_ms, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.open_handles.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
        self.open_handles.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a handle that closed through a failed commit
    pub fn record_failed_close(&self) {
        self.open_handles.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_leak(&self) {
        self.leaked_handles.fetch_add(1, Ordering::Relaxed);
        self.open_handles.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_operation(&self) {
        self.operations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_releases(&self, count: usize) {
        self.forced_releases
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record an error by category
    pub fn record_error(&self, category: &str) {
        match category {
            "not_found" => self.not_found_errors.fetch_add(1, Ordering::Relaxed),
            "lock_timeout" => self.lock_timeout_errors.fetch_add(1, Ordering::Relaxed),
            "conflict" => self.conflict_errors.fetch_add(1, Ordering::Relaxed),
            "lock_lost" => self.lock_lost_errors.fetch_add(1, Ordering::Relaxed),
            "storage" => self.storage_errors.fetch_add(1, Ordering::Relaxed),
            _ => self.invalid_request_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_only_acquisitions: self.read_only_acquisitions.load(Ordering::Relaxed),
            read_write_acquisitions: self.read_write_acquisitions.load(Ordering::Relaxed),
            open_handles: self.open_handles.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            leaked_handles: self.leaked_handles.load(Ordering::Relaxed),
            operations_applied: self.operations_applied.load(Ordering::Relaxed),
            max_lock_wait_ms: self.max_lock_wait_ms.load(Ordering::Relaxed),
            forced_releases: self.forced_releases.load(Ordering::Relaxed),
            not_found_errors: self.not_found_errors.load(Ordering::Relaxed),
            lock_timeout_errors: self.lock_timeout_errors.load(Ordering::Relaxed),
            conflict_errors: self.conflict_errors.load(Ordering::Relaxed),
            lock_lost_errors: self.lock_lost_errors.load(Ordering::Relaxed),
            invalid_request_errors: self.invalid_request_errors.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`SessionMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub read_only_acquisitions: u64,
    pub read_write_acquisitions: u64,
    pub open_handles: u64,
    pub commits: u64,
    pub discards: u64,
    pub leaked_handles: u64,
    pub operations_applied: u64,
    pub max_lock_wait_ms: u64,
    pub forced_releases: u64,
    pub not_found_errors: u64,
    pub lock_timeout_errors: u64,
    pub conflict_errors: u64,
    pub lock_lost_errors: u64,
    pub invalid_request_errors: u64,
    pub storage_errors: u64,
}
