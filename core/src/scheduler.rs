use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cfg::SchedulerConfig;
use crate::clock::Clock;
use crate::error::{FailureKind, SchedulerError};
use crate::host::{CapabilityHost, GrainAccessor};
use crate::job::{JobError, JobId, ScheduledJob};
use crate::jobstore::JobStore;
use crate::liveness::LivenessMonitor;
use crate::policy::{Attempt, Disposition, EligibilityPolicy};
use crate::runner::{JobRunner, RunState};

/// What one sweep did.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    /// Runs whose previous attempt is still heartbeating.
    pub in_flight: Vec<JobId>,
    /// One-shot jobs dropped for missing their window.
    pub abandoned: Vec<JobId>,
    /// Jobs recorded as failed after running out of disconnection retries.
    pub exhausted: Vec<JobId>,
    /// Invoked jobs and how each run ended.
    pub ran: Vec<(JobId, RunState)>,
    /// Jobs whose callback could not be restored. Their records are kept.
    pub restore_failures: Vec<(JobId, String)>,
    /// Job tasks that panicked.
    pub panicked: usize,
}

enum Dispatched {
    Ran(RunState),
    RestoreFailed(String),
}

/// Finds due jobs, runs them concurrently and applies the retry policy.
pub struct Scheduler<H: CapabilityHost> {
    store: Arc<dyn JobStore>,
    host: Arc<H>,
    runner: Arc<JobRunner<H>>,
    policy: EligibilityPolicy,
    message_limit: usize,
}

impl<H: CapabilityHost> Scheduler<H> {
    /// Wire a scheduler from its collaborators.
    pub fn new(
        cfg: &SchedulerConfig,
        store: Arc<dyn JobStore>,
        host: Arc<H>,
        grains: Arc<dyn GrainAccessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let monitor = LivenessMonitor::new(
            store.clone(),
            grains,
            clock.clone(),
            cfg.keep_alive_interval(),
        );
        let runner = JobRunner::new(cfg, store.clone(), host.clone(), monitor, clock);
        Self {
            store,
            host,
            runner: Arc::new(runner),
            policy: EligibilityPolicy::from_config(cfg),
            message_limit: cfg.error_message_limit,
        }
    }

    /// Run every job due at `now_ms` and wait for all of them to settle.
    /// Only a failed store query aborts the sweep; per-job trouble lands in the report.
    pub async fn run_due_jobs(&self, now_ms: u64) -> Result<SweepReport, SchedulerError> {
        let jobs = self
            .store
            .query_ready_jobs(now_ms, self.policy.stale_before(now_ms))
            .await?;

        let mut report = SweepReport::default();
        let mut tasks = JoinSet::new();

        for mut job in jobs {
            match self.policy.classify(&job, now_ms) {
                Disposition::NotDue => continue,
                Disposition::InFlight => {
                    debug!(job_id = %job.id, "job still in flight");
                    report.in_flight.push(job.id);
                }
                Disposition::Abandon => {
                    self.abandon(&job).await;
                    report.abandoned.push(job.id);
                }
                Disposition::Exhausted => {
                    let finished = job.last_keep_alive_ms.unwrap_or(now_ms);
                    let err = JobError::new(
                        FailureKind::Disconnected.as_str(),
                        "disconnected: retries exhausted",
                        self.message_limit,
                        finished,
                    );
                    self.runner.record_terminal(&job, err).await;
                    report.exhausted.push(job.id);
                }
                Disposition::Run { attempt } => {
                    if attempt == Attempt::AfterStale {
                        match self.store.increment_retries(&job.id).await {
                            Ok(n) => {
                                info!(job_id = %job.id, retries = n, "keep-alive went stale, retrying");
                                job.retries = n;
                            }
                            Err(e) => {
                                // Running without counting could retry forever.
                                error!(job_id = %job.id, error = %e, "could not count retry, skipping");
                                continue;
                            }
                        }
                    }
                    self.dispatch(&mut tasks, job, attempt);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Dispatched::Ran(state))) => report.ran.push((id, state)),
                Ok((id, Dispatched::RestoreFailed(msg))) => report.restore_failures.push((id, msg)),
                Err(e) => {
                    error!(error = %e, "job task panicked");
                    report.panicked += 1;
                }
            }
        }

        Ok(report)
    }

    fn dispatch(&self, tasks: &mut JoinSet<(JobId, Dispatched)>, job: ScheduledJob, attempt: Attempt) {
        let host = self.host.clone();
        let runner = self.runner.clone();
        tasks.spawn(async move {
            let id = job.id.clone();
            match host.restore(&job.callback).await {
                Ok(callback) => (id, Dispatched::Ran(runner.run(job, callback, attempt).await)),
                Err(e) => {
                    // Record stays for inspection.
                    error!(job_id = %id, callback = %job.callback, error = %e, "could not restore job callback");
                    (id, Dispatched::RestoreFailed(e.to_string()))
                }
            }
        });
    }

    async fn abandon(&self, job: &ScheduledJob) {
        warn!(job_id = %job.id, name = %job.name, "one-shot job missed its window, dropping");
        self.runner.discard(job).await;
    }
}
