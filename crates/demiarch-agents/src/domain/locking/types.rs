//! Lock types and error definitions

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::execution::ExecutionId;

/// Default wait (and lease) for lock acquisition
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Lock acquisition timed out
    #[error("Lock timeout: resource '{resource}' is held by {holder} (waited {waited_ms}ms)")]
    Timeout {
        resource: String,
        holder: String,
        waited_ms: u64,
    },

    /// The holder already holds or waits for this key
    #[error("Resource '{resource}' is already held or requested by {holder}")]
    AlreadyHeld { resource: String, holder: ExecutionId },

    /// The lease expired and the lock was taken back from its holder
    #[error("Lock on '{resource}' was forcibly reclaimed from {holder}")]
    ForcedReclaim { resource: String, holder: ExecutionId },

    /// Resource key could not be parsed
    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    /// Invalid lock state
    #[error("Invalid lock state: {0}")]
    InvalidState(String),
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "E300",
            Self::AlreadyHeld { .. } => "E301",
            Self::InvalidKey(_) => "E302",
            Self::InvalidState(_) => "E305",
            Self::ForcedReclaim { .. } => "E308",
        }
    }
}

/// Kind of resource being locked
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Database partition
    Database,
    /// Project configuration
    Config,
    /// Feature record
    Feature,
    /// External model API channel
    ModelApi,
    /// File path within the project
    File,
    /// Anything else, named by the caller
    Custom(String),
}

impl ResourceKind {
    /// Marks caller-named kinds in the canonical `project/kind/name` form
    pub const CUSTOM_PREFIX: &'static str = "custom:";

    /// Caller-named kind
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => f.write_str("database"),
            Self::Config => f.write_str("config"),
            Self::Feature => f.write_str("feature"),
            Self::ModelApi => f.write_str("model_api"),
            Self::File => f.write_str("file"),
            Self::Custom(name) => write!(f, "{}{}", Self::CUSTOM_PREFIX, name),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = LockError;

    /// Built-in names map to their variants; any other name, or a name
    /// carrying the `custom:` prefix, is a custom kind
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = |s: &str| LockError::InvalidKey(format!("bad resource kind '{}'", s));
        if let Some(name) = s.strip_prefix(Self::CUSTOM_PREFIX) {
            if name.is_empty() || name.contains('/') {
                return Err(bad(s));
            }
            return Ok(Self::Custom(name.to_string()));
        }
        if s.is_empty() || s.contains('/') {
            return Err(bad(s));
        }
        Ok(match s {
            "database" => Self::Database,
            "config" => Self::Config,
            "feature" => Self::Feature,
            "model_api" => Self::ModelApi,
            "file" => Self::File,
            other => Self::Custom(other.to_string()),
        })
    }
}

/// Composite identifier naming a lockable resource: `project/kind/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub project_id: String,
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(project_id: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            kind,
            name: name.into(),
        }
    }

    pub fn file(project_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(project_id, ResourceKind::File, path)
    }

    pub fn feature(project_id: impl Into<String>, feature_id: impl Into<String>) -> Self {
        Self::new(project_id, ResourceKind::Feature, feature_id)
    }

    pub fn database(project_id: impl Into<String>, partition: impl Into<String>) -> Self {
        Self::new(project_id, ResourceKind::Database, partition)
    }

    pub fn model_api(project_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::new(project_id, ResourceKind::ModelApi, channel)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project_id, self.kind, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = LockError;

    /// Parses `project/kind/name`; the name may itself contain `/`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(kind), Some(name))
                if !project.trim().is_empty() && !name.trim().is_empty() =>
            {
                Ok(Self::new(project.trim(), kind.parse()?, name.trim()))
            }
            _ => Err(LockError::InvalidKey(format!(
                "expected project/kind/name, got '{}'",
                s
            ))),
        }
    }
}

/// Lock mode requested by a holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
        }
    }

    /// The stronger of two modes requested for the same key
    pub fn strongest(self, other: LockMode) -> LockMode {
        if self == Self::Exclusive || other == Self::Exclusive {
            Self::Exclusive
        } else {
            Self::Shared
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" | "write" => Ok(Self::Exclusive),
            "shared" | "read" => Ok(Self::Shared),
            other => Err(LockError::InvalidKey(format!("unknown lock mode '{}'", other))),
        }
    }
}

/// Where a lock request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Queued behind incompatible holders
    Waiting,
    /// Granted and not yet released
    Held,
    /// Released by its holder
    Released,
    /// Forcibly released by the sweep
    Reclaimed,
    /// Gave up waiting
    TimedOut,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Held => "held",
            Self::Released => "released",
            Self::Reclaimed => "reclaimed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockState {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "held" => Ok(Self::Held),
            "released" => Ok(Self::Released),
            "reclaimed" => Ok(Self::Reclaimed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(LockError::InvalidKey(format!("unknown lock state '{}'", other))),
        }
    }
}

/// A granted or pending claim on a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock ID, assigned when the request is made
    pub id: Uuid,
    pub key: ResourceKey,
    pub mode: LockMode,
    /// Execution that requested (and, once granted, holds) the lock
    pub requester: ExecutionId,
    /// Hostname of the process that owns the lock table
    pub holder_host: String,
    pub state: LockState,
    pub requested_at: DateTime<Utc>,
    pub acquired_at: Option<DateTime<Utc>>,
    /// Past this instant the lock is eligible for forced reclamation
    pub deadline: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    pub(crate) fn requested(
        key: ResourceKey,
        mode: LockMode,
        requester: ExecutionId,
        holder_host: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            mode,
            requester,
            holder_host: holder_host.to_string(),
            state: LockState::Waiting,
            requested_at: Utc::now(),
            acquired_at: None,
            deadline: None,
            released_at: None,
        }
    }

    /// Holder, if the lock is currently granted
    pub fn holder(&self) -> Option<ExecutionId> {
        (self.state == LockState::Held).then_some(self.requester)
    }

    pub(crate) fn grant(&mut self, lease: Duration) {
        let now = Utc::now();
        self.state = LockState::Held;
        self.acquired_at = Some(now);
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.deadline = now.checked_add_signed(lease);
    }

    pub(crate) fn finish(&mut self, state: LockState) {
        self.state = state;
        self.released_at = Some(Utc::now());
    }

    /// How long the lock was held, once released
    pub fn held_ms(&self) -> Option<i64> {
        match (self.acquired_at, self.released_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Configuration for the lock manager
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Default timeout for lock acquisition; also the lease of a granted lock
    pub default_timeout: Duration,

    /// Interval of the background reclamation sweep
    pub sweep_interval: Duration,

    /// Capacity of the lock event broadcast channel
    pub event_capacity: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_LOCK_TIMEOUT,
            sweep_interval: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

impl LockConfig {
    /// Set the default timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
