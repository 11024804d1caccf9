//! Stasis Storage - session storage backends
//!
//! Implementations of [`stasis_core::StorageBackend`]: an in-process backend that is
//! the default for tests and single-node deployments, and a SQLite backend behind the
//! `sqlite` feature.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use stasis_core::{StasisResult, StorageBackend, StorageConfig, StorageKind};

pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Build the backend named by a storage configuration
pub async fn connect(config: &StorageConfig) -> StasisResult<Arc<dyn StorageBackend>> {
    match config.backend {
        StorageKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "sqlite")]
        StorageKind::Sqlite => {
            let backend = SqliteBackend::from_url(&config.connection, config.max_connections).await?;
            if config.auto_migrate {
                backend.migrate().await?;
            }
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageKind::Sqlite => Err(stasis_core::config_error!(
            "the sqlite backend requires the `sqlite` feature",
            "storage"
        )),
    }
}
