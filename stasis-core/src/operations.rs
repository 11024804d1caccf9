//! Granular operations
//!
//! Self-describing mutations that a backend can apply without the caller reading the
//! session first. Each variant merges commutatively (increment) or idempotently (set
//! insert/remove), so concurrent applications never lose one another's effect.

use crate::error::{StasisError, StasisResult};
use crate::types::{split_path, SessionData, SessionValue};
use serde::{Deserialize, Serialize};
use std::fmt;

const COMPONENT: &str = "granular_operation";

/// A named, parameterized mutation applied directly at the storage layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GranularOperation {
    /// Add `by` to the integer at `path` (missing counts as 0)
    Increment { path: String, by: i64 },
    /// Insert `value` into the set at `path` if absent
    AddToSet { path: String, value: SessionValue },
    /// Remove `value` from the set at `path` if present
    RemoveFromSet { path: String, value: SessionValue },
}

impl GranularOperation {
    pub fn increment<P: Into<String>>(path: P, by: i64) -> Self {
        GranularOperation::Increment {
            path: path.into(),
            by,
        }
    }

    pub fn add_to_set<P: Into<String>, V: Into<SessionValue>>(path: P, value: V) -> Self {
        GranularOperation::AddToSet {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn remove_from_set<P: Into<String>, V: Into<SessionValue>>(path: P, value: V) -> Self {
        GranularOperation::RemoveFromSet {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Operation name as it appears in logs and the journal
    pub fn name(&self) -> &'static str {
        match self {
            GranularOperation::Increment { .. } => "increment",
            GranularOperation::AddToSet { .. } => "add_to_set",
            GranularOperation::RemoveFromSet { .. } => "remove_from_set",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            GranularOperation::Increment { path, .. }
            | GranularOperation::AddToSet { path, .. }
            | GranularOperation::RemoveFromSet { path, .. } => path,
        }
    }

    /// Check the operation is well-formed without touching any state
    pub fn validate(&self) -> StasisResult<()> {
        split_path(self.path()).map_err(|e| {
            StasisError::invalid_operation(format!("{} rejected: {}", self.name(), e), COMPONENT)
        })?;
        match self {
            GranularOperation::AddToSet { value, .. }
            | GranularOperation::RemoveFromSet { value, .. } => {
                if matches!(value, SessionValue::Map(_) | SessionValue::List(_)) {
                    return Err(StasisError::invalid_operation(
                        format!("set members must be scalars, got a {}", value.kind()),
                        COMPONENT,
                    ));
                }
                if !value.is_finite() {
                    return Err(StasisError::invalid_operation(
                        format!("{} rejected: set members must be finite", self.name()),
                        COMPONENT,
                    ));
                }
                Ok(())
            }
            GranularOperation::Increment { .. } => Ok(()),
        }
    }

    /// Apply to `data` in place and return the resulting value at the target path
    ///
    /// On error `data` is left untouched.
    pub fn apply_to(&self, data: &mut SessionData) -> StasisResult<SessionValue> {
        self.validate()?;

        let path = self.path();
        let next = match self {
            GranularOperation::Increment { by, .. } => {
                let current = match data.get(path) {
                    None => 0,
                    Some(SessionValue::Int(n)) => *n,
                    Some(other) => {
                        return Err(StasisError::invalid_operation(
                            format!("cannot increment a {} at '{}'", other.kind(), path),
                            COMPONENT,
                        ))
                    }
                };
                let sum = current.checked_add(*by).ok_or_else(|| {
                    StasisError::invalid_operation(
                        format!("increment of '{}' by {} overflows", path, by),
                        COMPONENT,
                    )
                })?;
                SessionValue::Int(sum)
            }
            GranularOperation::AddToSet { value, .. } => {
                let mut members = Self::current_set(data, path)?;
                if !members.contains(value) {
                    members.push(value.clone());
                }
                SessionValue::List(members)
            }
            GranularOperation::RemoveFromSet { value, .. } => {
                let mut members = Self::current_set(data, path)?;
                members.retain(|member| member != value);
                SessionValue::List(members)
            }
        };

        data.set(path, next.clone()).map_err(|e| {
            StasisError::invalid_operation(format!("{} rejected: {}", self.name(), e), COMPONENT)
        })?;
        Ok(next)
    }

    fn current_set(data: &SessionData, path: &str) -> StasisResult<Vec<SessionValue>> {
        match data.get(path) {
            None => Ok(Vec::new()),
            Some(SessionValue::List(items)) => Ok(items.clone()),
            Some(other) => Err(StasisError::invalid_operation(
                format!("'{}' holds a {}, not a set", path, other.kind()),
                COMPONENT,
            )),
        }
    }
}

impl fmt::Display for GranularOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GranularOperation::Increment { path, by } => write!(f, "increment({path}, {by})"),
            GranularOperation::AddToSet { path, value } => {
                write!(f, "add_to_set({path}, {value:?})")
            }
            GranularOperation::RemoveFromSet { path, value } => {
                write!(f, "remove_from_set({path}, {value:?})")
            }
        }
    }
}
