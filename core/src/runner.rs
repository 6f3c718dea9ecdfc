use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cfg::{RetryReset, SchedulerConfig};
use crate::clock::Clock;
use crate::error::{CallError, FailureKind};
use crate::host::{CapabilityHost, JobCallback, RunResult};
use crate::job::{JobError, ScheduledJob};
use crate::jobstore::{JobStore, RunRecord};
use crate::liveness::LivenessMonitor;
use crate::policy::Attempt;

/// How one run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    /// The callback succeeded. One-shot records are gone, periodic ones advanced.
    Completed,
    /// The callback asked not to be run again; the record is gone.
    CancelledByCallback,
    /// The target went away; the job will be retried by a later sweep.
    TransientDisconnect,
    /// The run failed for good and the failure was recorded.
    TerminalFailure {
        /// Failure category.
        kind: FailureKind,
    },
}

/// Executes a restored job end to end and turns the result into store updates.
/// Deleting a record also releases its saved callback from `H`.
pub struct JobRunner<H: CapabilityHost> {
    store: Arc<dyn JobStore>,
    host: Arc<H>,
    monitor: LivenessMonitor,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    message_limit: usize,
    retry_reset: RetryReset,
}

impl<H: CapabilityHost> JobRunner<H> {
    /// Runner with keep-alive pings driven by `monitor`.
    pub fn new(
        cfg: &SchedulerConfig,
        store: Arc<dyn JobStore>,
        host: Arc<H>,
        monitor: LivenessMonitor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            host,
            monitor,
            clock,
            max_retries: cfg.max_retries,
            message_limit: cfg.error_message_limit,
            retry_reset: cfg.retry_reset,
        }
    }

    /// Invoke `callback` for `job` while pinging its grain, then settle the record.
    /// Store failures after the call are logged, never returned.
    pub async fn run(
        &self,
        job: ScheduledJob,
        callback: Box<dyn JobCallback>,
        attempt: Attempt,
    ) -> RunState {
        if let Err(e) = self.store.mark_started(&job.id, self.clock.now_ms()).await {
            warn!(job_id = %job.id, error = %e, "could not mark job as started");
        }

        let keep_alive = self.monitor.start(job.id.clone(), job.grain_id.clone());
        let result = callback.run().await;
        let heartbeat_seen = keep_alive.stop().await;

        self.settle(&job, result, attempt, heartbeat_seen).await
    }

    async fn settle(
        &self,
        job: &ScheduledJob,
        result: Result<RunResult, CallError>,
        attempt: Attempt,
        heartbeat_seen: bool,
    ) -> RunState {
        match result {
            Ok(RunResult { cancel_future_runs }) if cancel_future_runs || job.is_one_shot() => {
                self.discard(job).await;
                if cancel_future_runs {
                    info!(job_id = %job.id, name = %job.name, "job cancelled future runs");
                    RunState::CancelledByCallback
                } else {
                    info!(job_id = %job.id, name = %job.name, "one-shot job completed");
                    RunState::Completed
                }
            }
            Ok(_) => {
                let reset = match self.retry_reset {
                    RetryReset::AfterSuccess => true,
                    RetryReset::AfterNextScheduledRun => !attempt.is_retry(),
                };
                if let Err(e) = self.store.record_outcome(&job.id, RunRecord::success(reset)).await {
                    error!(job_id = %job.id, error = %e, "failed to record successful run");
                }
                info!(job_id = %job.id, name = %job.name, ?attempt, "periodic job ran");
                RunState::Completed
            }
            Err(e) if e.is_disconnect() => {
                // Heartbeats during the run reset the counter, so the dispatch snapshot may be stale.
                let retries = match self.store.get_job(&job.id).await {
                    Ok(current) => current.map_or(job.retries, |j| j.retries),
                    Err(se) => {
                        warn!(job_id = %job.id, error = %se, "could not re-read job, using dispatch snapshot");
                        job.retries
                    }
                };
                if retries >= self.max_retries {
                    let err = JobError::new(
                        FailureKind::Disconnected.as_str(),
                        "disconnected: retries exhausted",
                        self.message_limit,
                        self.clock.now_ms(),
                    );
                    self.record_terminal(job, err).await;
                    return RunState::TerminalFailure { kind: FailureKind::Disconnected };
                }
                // Without a heartbeat only the dispatch marker holds the job back; release it.
                match self.store.record_disconnect(&job.id, !heartbeat_seen).await {
                    Ok(n) => warn!(
                        job_id = %job.id,
                        retries = n,
                        immediate = !heartbeat_seen,
                        error = %e,
                        "job disconnected, will retry"
                    ),
                    Err(se) => error!(job_id = %job.id, error = %se, "failed to count retry"),
                }
                RunState::TransientDisconnect
            }
            Err(e) => {
                let err = JobError::new(
                    e.kind.as_str(),
                    &e.message,
                    self.message_limit,
                    self.clock.now_ms(),
                );
                self.record_terminal(job, err).await;
                RunState::TerminalFailure { kind: e.kind }
            }
        }
    }

    /// Close out a job with a terminal failure: one-shot records are deleted,
    /// periodic ones keep the error and move on to the next period.
    pub async fn record_terminal(&self, job: &ScheduledJob, err: JobError) {
        warn!(
            job_id = %job.id,
            name = %job.name,
            kind = %err.kind,
            message = %err.message,
            "job failed"
        );
        if job.is_one_shot() {
            self.discard(job).await;
            return;
        }
        if let Err(e) = self.store.record_outcome(&job.id, RunRecord::failure(err)).await {
            error!(job_id = %job.id, error = %e, "failed to record job failure");
        }
    }

    /// Delete the record, then release its callback. A record someone else
    /// already removed leaves the callback to them.
    pub async fn discard(&self, job: &ScheduledJob) {
        match self.store.delete_job(&job.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "job already deleted");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to delete job");
                return;
            }
        }
        match self.host.drop_ref(&job.callback).await {
            Ok(true) => debug!(job_id = %job.id, callback = %job.callback, "callback released"),
            Ok(false) => warn!(job_id = %job.id, callback = %job.callback, "callback was already gone"),
            Err(e) => error!(job_id = %job.id, callback = %job.callback, error = %e, "failed to release callback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use crate::jobstore::KvJobStore;
    use crate::store::MemKv;
    use crate::testkit::{FakeCallback, FakeGrains, FakeHost, ManualClock, Step};
    use std::time::Duration;

    struct Harness {
        store: Arc<KvJobStore<MemKv>>,
        grains: Arc<FakeGrains>,
        host: Arc<FakeHost>,
        runner: JobRunner<FakeHost>,
    }

    fn harness(cfg: SchedulerConfig) -> Harness {
        let store = Arc::new(KvJobStore::new(MemKv::new()));
        let grains = FakeGrains::new();
        let host = FakeHost::new();
        let clock = ManualClock::new(5_000);
        let monitor = LivenessMonitor::new(
            store.clone(),
            grains.clone(),
            clock.clone(),
            cfg.keep_alive_interval(),
        );
        let runner = JobRunner::new(&cfg, store.clone(), host.clone(), monitor, clock);
        Harness { store, grains, host, runner }
    }

    impl Harness {
        async fn periodic(&self, cb: &Arc<FakeCallback>) -> ScheduledJob {
            let sturdy = self.host.save(cb, "test").await.unwrap();
            let id = self.store.create_periodic_job("g", "p", sturdy, 1_000, 0).await.unwrap();
            self.store.get_job(&id).await.unwrap().unwrap()
        }

        async fn one_shot(&self, cb: &Arc<FakeCallback>) -> ScheduledJob {
            let sturdy = self.host.save(cb, "test").await.unwrap();
            let id = self.store.create_one_shot_job("g", "o", sturdy, 0, 1_000, 0).await.unwrap();
            self.store.get_job(&id).await.unwrap().unwrap()
        }

        async fn run(&self, job: &ScheduledJob) -> RunState {
            self.run_as(job, Attempt::Fresh).await
        }

        async fn run_as(&self, job: &ScheduledJob, attempt: Attempt) -> RunState {
            let live = self.host.restore(&job.callback).await.unwrap();
            self.runner.run(job.clone(), live, attempt).await
        }

        async fn reload(&self, id: &JobId) -> Option<ScheduledJob> {
            self.store.get_job(id).await.unwrap()
        }

        async fn spend_retries(&self, id: &JobId, n: u32) {
            for _ in 0..n {
                self.store.increment_retries(id).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn one_shot_success_deletes_record_and_callback() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::Succeed { cancel: false });
        let job = h.one_shot(&cb).await;

        assert_eq!(h.run(&job).await, RunState::Completed);
        assert!(h.reload(&job.id).await.is_none());
        assert!(!h.host.holds(&job.callback));
        assert_eq!(cb.calls(), 1);
    }

    #[tokio::test]
    async fn periodic_success_advances_and_clears_state() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::Succeed { cancel: false });
        let job = h.periodic(&cb).await;
        h.store.increment_retries(&job.id).await.unwrap();

        assert_eq!(h.run(&job).await, RunState::Completed);
        let after = h.reload(&job.id).await.unwrap();
        assert_eq!(after.next_period_start_ms, Some(2_000));
        assert_eq!(after.retries, 0);
        assert_eq!(after.last_keep_alive_ms, None);
        assert!(after.previous_error.is_none());
        assert!(h.host.holds(&job.callback));
    }

    #[tokio::test]
    async fn cancel_future_runs_deletes_periodic_job() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::Succeed { cancel: true });
        let job = h.periodic(&cb).await;

        assert_eq!(h.run(&job).await, RunState::CancelledByCallback);
        assert!(h.reload(&job.id).await.is_none());
        assert!(!h.host.holds(&job.callback));
    }

    #[tokio::test]
    async fn failure_is_recorded_with_truncated_message() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::Fail(CallError::failed("e".repeat(1_000))));
        let job = h.periodic(&cb).await;

        assert_eq!(
            h.run(&job).await,
            RunState::TerminalFailure { kind: FailureKind::Failed }
        );
        let after = h.reload(&job.id).await.unwrap();
        let err = after.previous_error.unwrap();
        assert_eq!(err.kind, "failed");
        assert_eq!(err.message.len(), 200);
        assert_eq!(err.finished_ms, 5_000);
        assert_eq!(after.next_period_start_ms, Some(2_000));
    }

    #[tokio::test]
    async fn early_disconnect_counts_a_retry_and_releases_the_job() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::Fail(CallError::disconnected("gone")));
        let job = h.periodic(&cb).await;

        assert_eq!(h.run(&job).await, RunState::TransientDisconnect);
        let after = h.reload(&job.id).await.unwrap();
        assert_eq!(after.retries, 1);
        assert!(after.retry_pending);
        assert_eq!(after.last_keep_alive_ms, None);
        assert!(after.previous_error.is_none());
        assert_eq!(after.next_period_start_ms, job.next_period_start_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_after_a_heartbeat_keeps_the_keep_alive() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::SleepThen(
            Duration::from_secs(90),
            Box::new(Step::Fail(CallError::disconnected("gone"))),
        ));
        let job = h.periodic(&cb).await;

        assert_eq!(h.run(&job).await, RunState::TransientDisconnect);
        assert_eq!(h.grains.pings(), 1);
        let after = h.reload(&job.id).await.unwrap();
        assert_eq!(after.last_keep_alive_ms, Some(5_000));
        assert_eq!(after.retries, 1);
    }

    #[tokio::test]
    async fn disconnect_with_spent_budget_is_terminal() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::Fail(CallError::disconnected("gone")));
        let job = h.one_shot(&cb).await;
        h.spend_retries(&job.id, 5).await;
        let job = h.reload(&job.id).await.unwrap();

        assert_eq!(
            h.run_as(&job, Attempt::AfterStale).await,
            RunState::TerminalFailure { kind: FailureKind::Disconnected }
        );
        assert!(h.reload(&job.id).await.is_none());
        assert!(!h.host.holds(&job.callback));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_during_the_run_restores_the_budget() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::SleepThen(
            Duration::from_secs(90),
            Box::new(Step::Fail(CallError::disconnected("gone"))),
        ));
        let job = h.periodic(&cb).await;
        h.spend_retries(&job.id, 5).await;
        let job = h.reload(&job.id).await.unwrap();
        assert_eq!(job.retries, 5);

        assert_eq!(h.run_as(&job, Attempt::AfterStale).await, RunState::TransientDisconnect);
        let after = h.reload(&job.id).await.unwrap();
        assert_eq!(after.retries, 1);
        assert!(after.previous_error.is_none());
    }

    #[tokio::test]
    async fn retry_reset_can_wait_for_next_scheduled_run() {
        let cfg = SchedulerConfig {
            retry_reset: RetryReset::AfterNextScheduledRun,
            ..SchedulerConfig::default()
        };
        let h = harness(cfg);
        let cb = FakeCallback::always(Step::Succeed { cancel: false });
        let job = h.periodic(&cb).await;
        h.store.record_disconnect(&job.id, true).await.unwrap();
        let retried = h.reload(&job.id).await.unwrap();

        h.run_as(&retried, Attempt::AfterDisconnect).await;
        let after = h.reload(&job.id).await.unwrap();
        assert_eq!(after.retries, 1);
        assert!(!after.retry_pending);

        h.run(&after).await;
        assert_eq!(h.reload(&job.id).await.unwrap().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pings_stop_when_the_run_settles() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::SleepThen(
            Duration::from_secs(150),
            Box::new(Step::Fail(CallError::failed("late failure"))),
        ));
        let job = h.periodic(&cb).await;

        h.run(&job).await;
        assert_eq!(h.grains.pings(), 2);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.grains.pings(), 2);
    }

    #[tokio::test]
    async fn bookkeeping_failure_does_not_escape() {
        let h = harness(SchedulerConfig::default());
        let cb = FakeCallback::always(Step::Succeed { cancel: false });
        let job = h.periodic(&cb).await;
        h.store.delete_job(&job.id).await.unwrap();

        // The record vanished mid-run; settling logs and returns normally.
        assert_eq!(h.run(&job).await, RunState::Completed);
        assert_eq!(h.grains.pings(), 0);
    }
}
