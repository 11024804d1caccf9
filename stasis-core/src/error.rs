//! Unified error handling for the storage and infrastructure layers
//!
//! Provides structured error types with context, recovery suggestions, and proper error chaining.
//! The caller-facing session taxonomy lives in `stasis-manager` and is built on top of this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type StasisResult<T> = Result<T, StasisError>;

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Additional metadata
    pub metadata: std::collections::HashMap<String, String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            metadata: std::collections::HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Main error type for the storage and infrastructure layers
#[derive(Error, Debug)]
pub enum StasisError {
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        recoverable: bool,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },

    #[error("Invalid operation: {message}")]
    InvalidOperation {
        message: String,
        context: ErrorContext,
    },

    #[error("Invalid path '{path}': {message}")]
    InvalidPath {
        path: String,
        message: String,
        context: ErrorContext,
    },

    #[error("Session not found: {session_id}")]
    NotFound {
        session_id: String,
        context: ErrorContext,
    },

    #[error("Operation timeout: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },
}

impl StasisError {
    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            StasisError::Storage { context, .. } => Some(context),
            StasisError::Config { context, .. } => Some(context),
            StasisError::Validation { context, .. } => Some(context),
            StasisError::InvalidOperation { context, .. } => Some(context),
            StasisError::InvalidPath { context, .. } => Some(context),
            StasisError::NotFound { context, .. } => Some(context),
            StasisError::Timeout { context, .. } => Some(context),
            StasisError::Internal { context, .. } => Some(context),
            StasisError::Io(_) | StasisError::Serialization(_) => None,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            StasisError::Storage { recoverable, .. } => *recoverable,
            StasisError::Timeout { .. } => true,
            StasisError::Io(_) => true,
            _ => false,
        }
    }

    /// Get retry delay in milliseconds for recoverable errors
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            StasisError::Storage {
                recoverable: true, ..
            } => Some(100),
            StasisError::Timeout { .. } => Some(500),
            StasisError::Io(_) => Some(100),
            _ => None,
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        match self {
            StasisError::Internal { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Internal error occurred"
                );
            }
            StasisError::Config { .. } | StasisError::Validation { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Configuration or validation error"
                );
            }
            StasisError::Storage { .. } | StasisError::Timeout { .. } => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    recoverable = self.is_recoverable(),
                    "Storage or timeout error"
                );
            }
            _ => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Error occurred"
                );
            }
        }
    }

    /// Shorthand for an invalid granular operation
    pub fn invalid_operation<S: Into<String>>(message: S, component: &str) -> Self {
        StasisError::InvalidOperation {
            message: message.into(),
            context: ErrorContext::new(component),
        }
    }

    /// Shorthand for a malformed or unreachable path
    pub fn invalid_path<P: Into<String>, S: Into<String>>(path: P, message: S) -> Self {
        StasisError::InvalidPath {
            path: path.into(),
            message: message.into(),
            context: ErrorContext::new("session_data")
                .with_suggestion("Use dot-separated, non-empty path segments"),
        }
    }
}

/// Convenience macros for creating errors with context
#[macro_export]
macro_rules! storage_error {
    ($msg:expr, $component:expr) => {
        $crate::StasisError::Storage {
            message: $msg.to_string(),
            source: None,
            recoverable: true,
            context: $crate::ErrorContext::new($component),
        }
    };
    ($msg:expr, $component:expr, $source:expr) => {
        $crate::StasisError::Storage {
            message: $msg.to_string(),
            source: Some(Box::new($source)),
            recoverable: true,
            context: $crate::ErrorContext::new($component),
        }
    };
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        $crate::StasisError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file"),
        }
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr, $field:expr, $component:expr) => {
        $crate::StasisError::Validation {
            message: $msg.to_string(),
            field: Some($field.to_string()),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check the field value and format"),
        }
    };
}

#[macro_export]
macro_rules! not_found_error {
    ($session_id:expr, $component:expr) => {
        $crate::StasisError::NotFound {
            session_id: $session_id.to_string(),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Treat the session as fresh or reject the request"),
        }
    };
}
