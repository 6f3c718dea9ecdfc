use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::host::GrainAccessor;
use crate::job::JobId;
use crate::jobstore::JobStore;

/// Pings the owning grain while a job runs and records each answered ping as
/// the job's keep-alive.
#[derive(Clone)]
pub struct LivenessMonitor {
    store: Arc<dyn JobStore>,
    grains: Arc<dyn GrainAccessor>,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl LivenessMonitor {
    /// Monitor pinging every `period`.
    pub fn new(
        store: Arc<dyn JobStore>,
        grains: Arc<dyn GrainAccessor>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self { store, grains, clock, period }
    }

    /// Start pinging for one run. The first ping goes out one period from now.
    /// Pinging stops when the returned guard is stopped or dropped.
    pub fn start(&self, job_id: JobId, grain_id: String) -> KeepAliveGuard {
        let monitor = self.clone();
        let id = job_id.clone();
        let recorded = Arc::new(AtomicBool::new(false));
        let seen = recorded.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + monitor.period, monitor.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if monitor.beat(&id, &grain_id).await {
                    seen.store(true, Ordering::SeqCst);
                }
            }
        });
        KeepAliveGuard { job_id, recorded, handle: Some(handle) }
    }

    async fn beat(&self, job_id: &JobId, grain_id: &str) -> bool {
        if let Err(e) = self.grains.keep_alive(grain_id).await {
            // No heartbeat recorded: the keep-alive ages toward stale.
            warn!(job_id = %job_id, grain_id, error = %e, "keep-alive ping failed");
            return false;
        }
        match self.store.update_keep_alive(job_id, self.clock.now_ms()).await {
            Ok(()) => {
                debug!(job_id = %job_id, grain_id, "keep-alive recorded");
                true
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "keep-alive not recorded");
                false
            }
        }
    }
}

/// Owns the ping task of one run. Stopping is idempotent: [`KeepAliveGuard::stop`]
/// consumes the guard, and dropping an unstopped guard aborts the task.
pub struct KeepAliveGuard {
    job_id: JobId,
    recorded: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAliveGuard {
    /// Cancel the ping task and wait for it to wind down. Returns whether any
    /// heartbeat made it into the store during the run.
    pub async fn stop(mut self) -> bool {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            match handle.await {
                Err(e) if e.is_panic() => {
                    error!(job_id = %self.job_id, "keep-alive task panicked")
                }
                _ => debug!(job_id = %self.job_id, "keep-alive stopped"),
            }
        }
        self.recorded.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
