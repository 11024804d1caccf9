//! Stasis Manager - concurrency control for per-session state
//!
//! Request handlers that share a session read and write it through this crate instead
//! of touching storage directly. Three strategies are available:
//!
//! - **Locking**: one ReadWrite handle per session at a time, FIFO among waiters
//! - **Optimistic**: revision-checked commits, the loser of a race gets `Conflict`
//! - **Granular operations**: increments and set updates merged at the storage layer
//!
//! ```no_run
//! use stasis_core::{AccessMode, ManagerConfig, SessionId};
//! use stasis_manager::SessionManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SessionManager::with_memory(ManagerConfig::default())?;
//! let id = SessionId::new("S1")?;
//!
//! let mut handle = manager.acquire(&id, AccessMode::ReadWrite).await?;
//! handle.set("cart.mug", 1i64)?;
//! let revision = handle.commit().await?;
//! # let _ = revision;
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod handle;
pub mod lock_table;
pub mod manager;
pub mod metrics;
pub mod operation_log;
pub mod version_clock;

pub use errors::{SessionError, SessionResult};
pub use handle::{HandleState, SessionHandle};
pub use lock_table::{HolderId, LockAcquisition, LockEntry, LockGuard, LockTable};
pub use manager::SessionManager;
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use operation_log::{OperationLog, OperationRecord};
pub use version_clock::VersionClock;
