use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use jobs_core::host::CapabilityHost;
use jobs_core::scheduler::Scheduler;
use crate::module::{Module, ModuleCtx};

/// Drives `run_due_jobs` on a fixed cadence. A sweep always finishes before the
/// next tick is taken, so sweeps never overlap.
pub struct Sweeper<H: CapabilityHost> {
    scheduler: Arc<Scheduler<H>>,
    period: Duration,
}

impl<H: CapabilityHost> Sweeper<H> {
    pub fn new(scheduler: Arc<Scheduler<H>>, period: Duration) -> Self {
        Self { scheduler, period }
    }
}

impl<H: CapabilityHost> Module for Sweeper<H> {
    fn name(&self) -> &'static str { "sweeper" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweeps: u64 = 0;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        sweeps += 1;
                        let now = ctx.clock.now_ms();
                        match self.scheduler.run_due_jobs(now).await {
                            Ok(report) => {
                                if !report.restore_failures.is_empty() {
                                    warn!(sweep = sweeps, failures = report.restore_failures.len(), "callbacks could not be restored");
                                }
                                info!(
                                    sweep = sweeps,
                                    ran = report.ran.len(),
                                    in_flight = report.in_flight.len(),
                                    abandoned = report.abandoned.len(),
                                    exhausted = report.exhausted.len(),
                                    "sweep done"
                                );
                            }
                            // The store is unreachable; try again next tick.
                            Err(e) => error!(sweep = sweeps, error = %e, "sweep aborted"),
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!(sweeps, "sweeper stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs_core::cfg::SchedulerConfig;
    use jobs_core::clock::{Clock, SystemClock};
    use jobs_core::jobstore::{JobStore, KvJobStore};
    use jobs_core::local::{Action, LocalGrains, LocalHost};
    use jobs_core::registrar::Registrar;
    use jobs_core::store::MemKv;
    use tokio::sync::watch;

    #[tokio::test(start_paused = true)]
    async fn sweeps_due_jobs_until_shutdown() {
        let cfg = SchedulerConfig::default();
        let kv = MemKv::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(KvJobStore::new(kv.clone()));
        let host = Arc::new(LocalHost::new(kv.clone()));
        let grains = Arc::new(LocalGrains::new(kv, clock.clone()));

        let registrar = Registrar::new(&cfg, host.clone(), store.clone(), clock.clone());
        registrar
            .schedule_one_shot("grain", "noop", &Action::Noop, clock.now_ms(), Duration::from_secs(600))
            .await
            .unwrap();

        let scheduler = Arc::new(Scheduler::new(&cfg, store.clone(), host, grains, clock.clone()));
        let (tx, rx) = watch::channel(false);
        let sweeper = Box::new(Sweeper::new(scheduler, cfg.sweep_interval()));
        let handle = sweeper.spawn(ModuleCtx { clock, shutdown: rx });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.list_jobs().await.unwrap().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
