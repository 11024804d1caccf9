//! SQLite session storage
//!
//! Compare-and-swap is a single conditional statement, so the revision check and the
//! write can never be split by another connection. Granular operations re-run a
//! read/conditional-update cycle until their write lands, which is safe because every
//! operation merges commutatively or idempotently.
//!
//! Deleting a session flags its row instead of removing it. The row keeps its last
//! revision, and recreating the session continues from there.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use stasis_core::{
    not_found_error, AppliedOperation, CasOutcome, ErrorContext, GranularOperation, Revision,
    SessionData, SessionId, StasisError, StasisResult, StorageBackend, StoredSession,
};
use tracing::{debug, info};

/// Upper bound on read/update cycles for one granular operation
const MAX_APPLY_ATTEMPTS: usize = 32;

fn db_error(operation: &str, error: sqlx::Error) -> StasisError {
    StasisError::Storage {
        message: format!("SQLite {} failed: {}", operation, error),
        source: Some(Box::new(error)),
        recoverable: true,
        context: ErrorContext::new("sqlite_backend").with_operation(operation),
    }
}

fn corrupt_row(message: String) -> StasisError {
    StasisError::Storage {
        message,
        source: None,
        recoverable: false,
        context: ErrorContext::new("sqlite_backend").with_operation("decode_row"),
    }
}

fn to_db_revision(revision: Revision) -> StasisResult<i64> {
    i64::try_from(revision.0).map_err(|_| corrupt_row(format!("revision {} exceeds i64", revision)))
}

fn from_db_revision(revision: i64) -> StasisResult<Revision> {
    u64::try_from(revision)
        .map(Revision)
        .map_err(|_| corrupt_row(format!("negative revision {} in storage", revision)))
}

/// SQLite session storage implementation
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create from database URL
    pub async fn from_url(database_url: &str, max_connections: u32) -> StasisResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| db_error("connect", e))?;

        Ok(Self::new(pool))
    }

    /// Run database migrations
    pub async fn migrate(&self) -> StasisResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StasisError::Storage {
                message: format!("Database migration failed: {}", e),
                source: Some(Box::new(e)),
                recoverable: false,
                context: ErrorContext::new("sqlite_backend").with_operation("migrate"),
            })?;

        info!("Session storage migrations completed");
        Ok(())
    }

    fn row_to_stored_session(row: &SqliteRow) -> StasisResult<StoredSession> {
        let data: String = row
            .try_get("data")
            .map_err(|e| corrupt_row(format!("Failed to get data column: {}", e)))?;
        let revision: i64 = row
            .try_get("revision")
            .map_err(|e| corrupt_row(format!("Failed to get revision column: {}", e)))?;
        let updated_at: String = row
            .try_get("updated_at")
            .map_err(|e| corrupt_row(format!("Failed to get updated_at column: {}", e)))?;

        let revision = from_db_revision(revision)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| corrupt_row(format!("Failed to parse updated_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(StoredSession {
            data: SessionData::from_bytes(data.as_bytes())?,
            revision,
            updated_at,
        })
    }

    async fn current_revision(&self, id: &SessionId) -> StasisResult<Option<Revision>> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM sessions WHERE id = ? AND deleted = 0")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("select_revision", e))?;

        revision.map(from_db_revision).transpose()
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn load(&self, id: &SessionId) -> StasisResult<Option<StoredSession>> {
        let row = sqlx::query(
            "SELECT data, revision, updated_at FROM sessions WHERE id = ? AND deleted = 0",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load", e))?;

        row.as_ref().map(Self::row_to_stored_session).transpose()
    }

    async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected: Option<Revision>,
        data: &SessionData,
    ) -> StasisResult<CasOutcome> {
        let json = serde_json::to_string(data)?;
        let now = Utc::now().to_rfc3339();

        let written: Option<i64> = match expected {
            // Create, or revive a deleted row one past its last revision
            None => sqlx::query_scalar::<_, i64>(
                "INSERT INTO sessions (id, data, revision, updated_at, deleted) \
                 VALUES (?, ?, 0, ?, 0) \
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data, \
                 revision = sessions.revision + 1, updated_at = excluded.updated_at, deleted = 0 \
                 WHERE sessions.deleted = 1 AND sessions.revision < ? \
                 RETURNING revision",
            )
            .bind(id.as_str())
            .bind(&json)
            .bind(&now)
            .bind(i64::MAX)
            .fetch_optional(&self.pool)
            .await,
            Some(revision) => {
                to_db_revision(revision.next()?)?;
                sqlx::query_scalar::<_, i64>(
                    "UPDATE sessions SET data = ?, revision = revision + 1, updated_at = ? \
                     WHERE id = ? AND revision = ? AND deleted = 0 \
                     RETURNING revision",
                )
                .bind(&json)
                .bind(&now)
                .bind(id.as_str())
                .bind(to_db_revision(revision)?)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| db_error("compare_and_swap", e))?;

        if let Some(revision) = written {
            let revision = from_db_revision(revision)?;
            debug!(session_id = %id, revision = %revision, "Saved session to SQLite storage");
            return Ok(CasOutcome::Committed(revision));
        }

        let current = self.current_revision(id).await?;
        debug!(
            session_id = %id,
            expected = ?expected,
            current = ?current,
            "Compare-and-swap rejected"
        );
        Ok(CasOutcome::Conflict { current })
    }

    async fn apply_atomic_op(
        &self,
        id: &SessionId,
        operation: &GranularOperation,
    ) -> StasisResult<AppliedOperation> {
        operation.validate()?;

        for attempt in 1..=MAX_APPLY_ATTEMPTS {
            let stored = self
                .load(id)
                .await?
                .ok_or_else(|| not_found_error!(id, "sqlite_backend"))?;

            let mut data = stored.data;
            let result = operation.apply_to(&mut data)?;

            match self
                .compare_and_swap(id, Some(stored.revision), &data)
                .await?
            {
                CasOutcome::Committed(revision) => {
                    return Ok(AppliedOperation { result, revision });
                }
                CasOutcome::Conflict { .. } => {
                    debug!(
                        session_id = %id,
                        operation = operation.name(),
                        attempt = attempt,
                        "Granular operation raced another write, re-applying"
                    );
                    tokio::task::yield_now().await;
                }
            }
        }

        Err(StasisError::Storage {
            message: format!(
                "{} on session {} did not land after {} attempts",
                operation.name(),
                id,
                MAX_APPLY_ATTEMPTS
            ),
            source: None,
            recoverable: true,
            context: ErrorContext::new("sqlite_backend")
                .with_operation("apply_atomic_op")
                .with_suggestion("Retry the operation; the session is under heavy write contention"),
        })
    }

    async fn delete(&self, id: &SessionId) -> StasisResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET data = '{}', deleted = 1, updated_at = ? \
             WHERE id = ? AND deleted = 0",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("delete", e))?;

        if result.rows_affected() > 0 {
            debug!(session_id = %id, "Deleted session from SQLite storage");
        }
        Ok(())
    }

    async fn health_check(&self) -> StasisResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("health_check", e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
