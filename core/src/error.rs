use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, SturdyRef};

/// The capability host could not persist a callback.
#[derive(Debug, Error)]
#[error("capability save failed: {0}")]
pub struct SaveError(pub String);

/// The capability host could not release a saved callback.
#[derive(Debug, Error)]
#[error("capability drop failed: {0}")]
pub struct DropError(pub String);

/// A sturdy ref could not be turned back into a live callback.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// Nothing is saved under this reference.
    #[error("no capability saved for {0}")]
    NotFound(SturdyRef),
    /// The host failed while looking the reference up.
    #[error("restore failed: {0}")]
    Backend(String),
}

/// Failure category reported by a callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job's own logic failed.
    Failed,
    /// The target refused work because it is busy.
    Overloaded,
    /// The target became unreachable mid-call. Retried.
    Disconnected,
    /// The target does not implement the callback.
    Unimplemented,
}

impl FailureKind {
    /// Name written into `previous_error.kind`.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Failed => "failed",
            FailureKind::Overloaded => "overloaded",
            FailureKind::Disconnected => "disconnected",
            FailureKind::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a callback's `run`.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    /// Failure category.
    pub kind: FailureKind,
    /// Free-form detail from the target.
    pub message: String,
}

impl CallError {
    /// Generic job failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Failed, message: message.into() }
    }

    /// Transient loss of the remote target.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Disconnected, message: message.into() }
    }

    /// Target too busy to take the call.
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Overloaded, message: message.into() }
    }

    /// True when the scheduler should retry rather than record a failure.
    pub fn is_disconnect(&self) -> bool {
        self.kind == FailureKind::Disconnected
    }
}

/// The grain did not answer a keep-alive ping.
#[derive(Debug, Error)]
#[error("keep-alive for grain {grain_id} failed: {reason}")]
pub struct PingError {
    /// Grain that was pinged.
    pub grain_id: String,
    /// Why the ping failed.
    pub reason: String,
}

/// Job store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record for this id.
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Underlying KV or codec failure.
    #[error(transparent)]
    Kv(#[from] anyhow::Error),
}

/// Errors surfaced by the Registrar and the sweep.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Callback could not be saved; no job was created.
    #[error("registration failed: {0}")]
    Registration(#[from] SaveError),
    /// Schedule parameters rejected at the boundary.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    /// The job store is unusable.
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_display_carries_kind() {
        let e = CallError::disconnected("peer went away");
        assert!(e.is_disconnect());
        assert_eq!(e.to_string(), "disconnected: peer went away");
        assert!(!CallError::failed("x").is_disconnect());
    }

    #[test]
    fn save_error_converts_into_registration_error() {
        let err: SchedulerError = SaveError("no space".into()).into();
        assert!(matches!(err, SchedulerError::Registration(_)));
        assert_eq!(err.to_string(), "registration failed: capability save failed: no space");
    }
}
