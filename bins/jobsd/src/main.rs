mod module;
mod sweeper;

use std::sync::Arc;

use anyhow::{Context, Result};
use jobs_core::cfg::{self, Config, JOBSD};
use jobs_core::clock::{Clock, SystemClock};
use jobs_core::jobstore::{JobStore, KvJobStore};
use jobs_core::local::{LocalGrains, LocalHost};
use jobs_core::scheduler::Scheduler;
use jobs_core::{logx, store};
use tokio::sync::watch;
use tracing::{error, info};

use crate::module::{Module, ModuleCtx};
use crate::sweeper::Sweeper;

fn main() -> Result<()> {
    let cfg = cfg::load_or_init(&JOBSD).context("config")?;
    logx::init(&cfg.log_level);
    info!("{} boot", JOBSD.application);

    build_runtime()?.block_on(run(cfg))
}

#[cfg(feature = "rt-single")]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

#[cfg(not(feature = "rt-single"))]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .build()?)
}

async fn run(cfg: Config) -> Result<()> {
    let dir = cfg.store_dir(&JOBSD)?;
    info!("job store at {}", dir.display());
    let kv = store::open_fs(&dir)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs: Arc<dyn JobStore> = Arc::new(KvJobStore::new(kv.clone()));
    let host = Arc::new(LocalHost::new(kv.clone()));
    let grains = Arc::new(LocalGrains::new(kv, clock.clone()));
    let scheduler = Arc::new(Scheduler::new(&cfg.scheduler, jobs, host, grains, clock.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ModuleCtx { clock, shutdown: shutdown_rx };

    let modules: Vec<Box<dyn Module>> = vec![
        Box::new(Sweeper::new(scheduler, cfg.scheduler.sweep_interval())),
    ];
    let mut running = Vec::new();
    for m in modules {
        let name = m.name();
        info!(module = name, "starting");
        running.push((name, m.spawn(ctx.clone())));
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested; letting the current sweep finish");
    let _ = shutdown_tx.send(true);

    for (name, handle) in running {
        match handle.await {
            Ok(Ok(())) => info!(module = name, "stopped"),
            Ok(Err(e)) => error!(module = name, error = %e, "module failed"),
            Err(e) => error!(module = name, error = %e, "module panicked"),
        }
    }
    Ok(())
}
