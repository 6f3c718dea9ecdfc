use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cfg::SchedulerConfig;
use crate::clock::Clock;
use crate::error::SchedulerError;
use crate::host::CapabilityHost;
use crate::job::JobId;
use crate::jobstore::JobStore;

/// Owner tag attached to every callback the scheduler saves.
pub const OWNER_TAG: &str = "scheduler";

/// Registration entry points: save the callback, then create the record.
pub struct Registrar<H: CapabilityHost> {
    host: Arc<H>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    min_slack_ms: u64,
}

impl<H: CapabilityHost> Registrar<H> {
    /// Registrar saving callbacks through `host` into `store`.
    pub fn new(
        cfg: &SchedulerConfig,
        host: Arc<H>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { host, store, clock, min_slack_ms: cfg.min_slack_ms }
    }

    /// Schedule `callback` to run once between `when_ms` and `when_ms + slack`.
    /// Slack below the configured minimum is raised to it.
    pub async fn schedule_one_shot(
        &self,
        grain_id: &str,
        name: &str,
        callback: &H::Live,
        when_ms: u64,
        slack: Duration,
    ) -> Result<JobId, SchedulerError> {
        let requested = duration_ms(slack);
        let slack_ms = requested.max(self.min_slack_ms);
        if slack_ms != requested {
            debug!(grain_id, requested, slack_ms, "slack raised to minimum");
        }

        let sturdy = self.host.save(callback, OWNER_TAG).await?;
        let id = self
            .store
            .create_one_shot_job(grain_id, name, sturdy, when_ms, slack_ms, self.clock.now_ms())
            .await
            .map_err(|e| {
                warn!(grain_id, name, error = %e, "callback saved but job not created");
                e
            })?;
        info!(job_id = %id, grain_id, name, when_ms, slack_ms, "one-shot job scheduled");
        Ok(id)
    }

    /// Schedule `callback` to run every `period` until it cancels itself.
    pub async fn schedule_periodic(
        &self,
        grain_id: &str,
        name: &str,
        callback: &H::Live,
        period: Duration,
    ) -> Result<JobId, SchedulerError> {
        let period_ms = duration_ms(period);
        if period_ms == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "period must be at least one millisecond".to_string(),
            ));
        }

        let sturdy = self.host.save(callback, OWNER_TAG).await?;
        let id = self
            .store
            .create_periodic_job(grain_id, name, sturdy, period_ms, self.clock.now_ms())
            .await
            .map_err(|e| {
                warn!(grain_id, name, error = %e, "callback saved but job not created");
                e
            })?;
        info!(job_id = %id, grain_id, name, period_ms, "periodic job scheduled");
        Ok(id)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
