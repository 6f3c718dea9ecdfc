//! Eligibility of a job at sweep time. The store only pre-filters on due time;
//! every decision the sweep acts on comes from [`EligibilityPolicy::classify`].

use crate::cfg::SchedulerConfig;
use crate::job::{Schedule, ScheduledJob};

/// What the sweep should do with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not due yet.
    NotDue,
    /// A previous run is still heartbeating; leave it alone.
    InFlight,
    /// One-shot job missed its window and never started. Drop it.
    Abandon,
    /// Disconnection retries used up. Record the failure without running.
    Exhausted,
    /// Restore and invoke.
    Run {
        /// Why this invocation happens.
        attempt: Attempt,
    },
}

/// Why a job is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// First attempt for the current due time.
    Fresh,
    /// The previous attempt dropped its connection and was already counted.
    AfterDisconnect,
    /// The previous attempt stopped heartbeating; the sweep counts this retry.
    AfterStale,
}

impl Attempt {
    /// Anything but a first attempt.
    pub fn is_retry(self) -> bool {
        !matches!(self, Attempt::Fresh)
    }
}

/// Due-time, slack-window and stale keep-alive rules.
#[derive(Debug, Clone, Copy)]
pub struct EligibilityPolicy {
    stale_threshold_ms: u64,
    max_retries: u32,
}

impl EligibilityPolicy {
    /// Build from explicit values.
    pub fn new(stale_threshold_ms: u64, max_retries: u32) -> Self {
        Self { stale_threshold_ms, max_retries }
    }

    /// Build from scheduler configuration.
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self::new(cfg.stale_threshold_ms(), cfg.max_retries)
    }

    /// Keep-alives strictly older than this are stale at `now_ms`.
    pub fn stale_before(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stale_threshold_ms)
    }

    /// Whether a keep-alive recorded at `keep_alive_ms` is stale at `now_ms`.
    pub fn is_stale(&self, keep_alive_ms: u64, now_ms: u64) -> bool {
        keep_alive_ms < self.stale_before(now_ms)
    }

    /// Retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide what to do with `job` at `now_ms`.
    pub fn classify(&self, job: &ScheduledJob, now_ms: u64) -> Disposition {
        if let Some(keep_alive) = job.last_keep_alive_ms {
            // A run was dispatched inside its window; only liveness matters now.
            if !self.is_stale(keep_alive, now_ms) {
                return Disposition::InFlight;
            }
            if job.retries >= self.max_retries {
                return Disposition::Exhausted;
            }
            return Disposition::Run { attempt: Attempt::AfterStale };
        }

        if now_ms < job.due_at_ms() {
            return Disposition::NotDue;
        }
        // Started inside its window, so a one-shot retry ignores the slack.
        if job.retry_pending {
            return Disposition::Run { attempt: Attempt::AfterDisconnect };
        }
        match job.schedule {
            Schedule::OneShot { when_ms, slack_ms } if now_ms > when_ms.saturating_add(slack_ms) => {
                Disposition::Abandon
            }
            _ => Disposition::Run { attempt: Attempt::Fresh },
        }
    }
}
