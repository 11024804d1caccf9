//! Core data type definitions

use crate::error::{ErrorContext, StasisError, StasisResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Longest session identifier accepted, in bytes
pub const MAX_SESSION_ID_LEN: usize = 256;

/// Opaque identifier of one logical client session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a caller-supplied identifier, rejecting empty or oversized values
    pub fn new<S: Into<String>>(id: S) -> StasisResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::validation_error!(
                "Session id must not be empty",
                "session_id",
                "session_id"
            ));
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(crate::validation_error!(
                format!(
                    "Session id is {} bytes, limit is {}",
                    id.len(),
                    MAX_SESSION_ID_LEN
                ),
                "session_id",
                "session_id"
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = StasisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Monotonic revision of a stored snapshot
///
/// The first successful save of a session is `Revision(0)`; every later write is `+1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const INITIAL: Revision = Revision(0);

    /// Revision following this one
    pub fn next(self) -> StasisResult<Revision> {
        self.0.checked_add(1).map(Revision).ok_or_else(|| StasisError::Storage {
            message: format!("revision {} cannot be advanced any further", self),
            source: None,
            recoverable: false,
            context: ErrorContext::new("revision").with_operation("next"),
        })
    }

    /// Revision produced by a write whose expected base was `base`
    pub fn after(base: Option<Revision>) -> StasisResult<Revision> {
        base.map_or(Ok(Revision::INITIAL), Revision::next)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A value stored in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<SessionValue>),
    Map(BTreeMap<String, SessionValue>),
}

impl SessionValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SessionValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SessionValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[SessionValue]> {
        match self {
            SessionValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, SessionValue>> {
        match self {
            SessionValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Whether every float inside this value is finite; NaN and infinities have no JSON form
    pub fn is_finite(&self) -> bool {
        match self {
            SessionValue::Float(f) => f.is_finite(),
            SessionValue::List(items) => items.iter().all(SessionValue::is_finite),
            SessionValue::Map(map) => map.values().all(SessionValue::is_finite),
            _ => true,
        }
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            SessionValue::Null => "null",
            SessionValue::Bool(_) => "bool",
            SessionValue::Int(_) => "int",
            SessionValue::Float(_) => "float",
            SessionValue::String(_) => "string",
            SessionValue::List(_) => "list",
            SessionValue::Map(_) => "map",
        }
    }
}

impl From<bool> for SessionValue {
    fn from(value: bool) -> Self {
        SessionValue::Bool(value)
    }
}

impl From<i64> for SessionValue {
    fn from(value: i64) -> Self {
        SessionValue::Int(value)
    }
}

impl From<f64> for SessionValue {
    fn from(value: f64) -> Self {
        SessionValue::Float(value)
    }
}

impl From<&str> for SessionValue {
    fn from(value: &str) -> Self {
        SessionValue::String(value.to_string())
    }
}

impl From<String> for SessionValue {
    fn from(value: String) -> Self {
        SessionValue::String(value)
    }
}

impl From<Vec<SessionValue>> for SessionValue {
    fn from(value: Vec<SessionValue>) -> Self {
        SessionValue::List(value)
    }
}

/// Split a dotted path into its segments
pub fn split_path(path: &str) -> StasisResult<Vec<&str>> {
    if path.is_empty() {
        return Err(StasisError::invalid_path(path, "path is empty"));
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(StasisError::invalid_path(path, "path has an empty segment"));
    }
    Ok(segments)
}

/// The full state blob of one session, addressed by dotted paths such as `cart.mug`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionData {
    entries: BTreeMap<String, SessionValue>,
}

impl SessionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-level entries
    pub fn entries(&self) -> &BTreeMap<String, SessionValue> {
        &self.entries
    }

    /// Read the value at `path`; a missing segment or a non-map intermediate is `None`
    pub fn get(&self, path: &str) -> Option<&SessionValue> {
        let segments = split_path(path).ok()?;
        let (last, parents) = segments.split_last()?;

        let mut current = &self.entries;
        for segment in parents {
            match current.get(*segment)? {
                SessionValue::Map(map) => current = map,
                _ => return None,
            }
        }
        current.get(*last)
    }

    /// Write `value` at `path`, creating intermediate maps; returns the previous value
    pub fn set(&mut self, path: &str, value: SessionValue) -> StasisResult<Option<SessionValue>> {
        let segments = split_path(path)?;
        if !value.is_finite() {
            return Err(StasisError::invalid_operation(
                format!("value for '{}' contains a non-finite float", path),
                "session_data",
            ));
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| StasisError::invalid_path(path, "path is empty"))?;

        let mut current = &mut self.entries;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| SessionValue::Map(BTreeMap::new()));
            current = match entry {
                SessionValue::Map(map) => map,
                other => {
                    return Err(StasisError::invalid_path(
                        path,
                        format!("segment '{}' holds a {}, not a map", segment, other.kind()),
                    ))
                }
            };
        }
        Ok(current.insert(last.to_string(), value))
    }

    /// Remove and return the value at `path`
    pub fn remove(&mut self, path: &str) -> StasisResult<Option<SessionValue>> {
        let segments = split_path(path)?;
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| StasisError::invalid_path(path, "path is empty"))?;

        let mut current = &mut self.entries;
        for segment in parents {
            match current.get_mut(*segment) {
                Some(SessionValue::Map(map)) => current = map,
                _ => return Ok(None),
            }
        }
        Ok(current.remove(*last))
    }

    /// Serialize to the canonical JSON byte form
    pub fn to_bytes(&self) -> StasisResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StasisResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A snapshot as held by a storage backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub data: SessionData,
    pub revision: Revision,
    pub updated_at: DateTime<Utc>,
}

/// Result of a compare-and-swap against a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed and produced this revision
    Committed(Revision),
    /// The stored revision did not match the expected one; nothing was written
    Conflict { current: Option<Revision> },
}

/// Result of a granular operation applied at the storage layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub result: SessionValue,
    pub revision: Revision,
}

/// How a handle may access its snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Concurrency-control strategy enforced by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyStrategy {
    /// One ReadWrite handle per session at a time
    #[default]
    Locking,
    /// Concurrent handles, compare-and-swap on commit
    Optimistic,
}
