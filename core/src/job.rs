use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque job identifier assigned by the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable reference that a capability host can exchange for a live callback.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SturdyRef(pub String);

impl fmt::Display for SturdyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// When a job runs. Fixed at creation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Run once, no earlier than `when_ms` and no later than `when_ms + slack_ms`.
    OneShot {
        /// Earliest start (ms since epoch).
        when_ms: u64,
        /// Allowed lateness (ms).
        slack_ms: u64,
    },
    /// Run every `period_ms` until the callback cancels.
    Periodic {
        /// Fixed interval (ms), always positive.
        period_ms: u64,
    },
}

/// Summary of the last non-successful run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JobError {
    /// Failure type, e.g. `"failed"` or `"disconnected"`.
    pub kind: String,
    /// Failure message, truncated before it reaches the store.
    pub message: String,
    /// When the failed run ended (ms since epoch).
    pub finished_ms: u64,
}

impl JobError {
    /// Build an error record, cutting `message` down to `limit` characters.
    pub fn new(kind: impl Into<String>, message: &str, limit: usize, finished_ms: u64) -> Self {
        Self {
            kind: kind.into(),
            message: truncate_chars(message, limit),
            finished_ms,
        }
    }
}

/// Cut `s` to at most `limit` characters without splitting a code point.
pub fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Persistent record of a unit of deferred work.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ScheduledJob {
    /// Store-assigned id.
    pub id: JobId,
    /// Grain that owns the job and is pinged while it runs.
    pub grain_id: String,
    /// Human-readable description.
    pub name: String,
    /// Durable reference to the callback.
    pub callback: SturdyRef,
    /// One-shot window or period.
    pub schedule: Schedule,
    /// Next due time for periodic jobs (ms since epoch).
    pub next_period_start_ms: Option<u64>,
    /// Creation time (ms since epoch).
    pub created_ms: u64,
    /// Last keep-alive of the in-flight run, `None` when nothing is running.
    pub last_keep_alive_ms: Option<u64>,
    /// Consecutive disconnection retries for the current run attempt.
    pub retries: u32,
    /// The last attempt dropped its connection and the current due time still
    /// owes a retry. Cleared once an outcome is recorded.
    pub retry_pending: bool,
    /// Last terminal failure, cleared by a successful run.
    pub previous_error: Option<JobError>,
}

impl ScheduledJob {
    /// New one-shot record.
    pub fn one_shot(
        id: JobId,
        grain_id: String,
        name: String,
        callback: SturdyRef,
        when_ms: u64,
        slack_ms: u64,
        created_ms: u64,
    ) -> Self {
        Self {
            id,
            grain_id,
            name,
            callback,
            schedule: Schedule::OneShot { when_ms, slack_ms },
            next_period_start_ms: None,
            created_ms,
            last_keep_alive_ms: None,
            retries: 0,
            retry_pending: false,
            previous_error: None,
        }
    }

    /// New periodic record; the first run is due one period after creation.
    pub fn periodic(
        id: JobId,
        grain_id: String,
        name: String,
        callback: SturdyRef,
        period_ms: u64,
        created_ms: u64,
    ) -> Self {
        Self {
            id,
            grain_id,
            name,
            callback,
            schedule: Schedule::Periodic { period_ms },
            next_period_start_ms: Some(created_ms.saturating_add(period_ms)),
            created_ms,
            last_keep_alive_ms: None,
            retries: 0,
            retry_pending: false,
            previous_error: None,
        }
    }

    /// Period of a periodic job.
    pub fn period_ms(&self) -> Option<u64> {
        match self.schedule {
            Schedule::Periodic { period_ms } => Some(period_ms),
            Schedule::OneShot { .. } => None,
        }
    }

    /// True for one-shot jobs.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.schedule, Schedule::OneShot { .. })
    }

    /// Earliest time the job may run (ms since epoch).
    pub fn due_at_ms(&self) -> u64 {
        match self.schedule {
            Schedule::OneShot { when_ms, .. } => when_ms,
            Schedule::Periodic { period_ms } => self
                .next_period_start_ms
                .unwrap_or_else(|| self.created_ms.saturating_add(period_ms)),
        }
    }
}
