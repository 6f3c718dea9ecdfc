use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jobs_core::cfg::{self, Config, JOBSD};
use jobs_core::clock::{Clock, SystemClock};
use jobs_core::host::CapabilityHost;
use jobs_core::job::JobId;
use jobs_core::jobstore::{JobStore, KvJobStore};
use jobs_core::local::{Action, LocalGrains, LocalHost};
use jobs_core::registrar::Registrar;
use jobs_core::scheduler::Scheduler;
use jobs_core::store::{self, FsKv};
use jobs_core::logx;
use serde_json::json;
use tracing::debug;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Inspect and manage scheduled grain jobs")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Config file (defaults to the daemon's config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Job store directory (overrides the config)
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every job as one JSON line
    List,
    /// Print one job
    Show { id: String },
    /// Run a command once, `in_secs` from now
    Once {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 0)]
        in_secs: u64,
        /// Allowed lateness; raised to the configured minimum
        #[arg(long, default_value_t = 0)]
        slack_secs: u64,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Run a command every `period_secs`
    Every {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        period_secs: u64,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Delete a job and its saved callback
    Cancel { id: String },
    /// Run one sweep now and print the report
    Sweep,
}

#[derive(Args)]
struct Target {
    #[arg(long)]
    grain: String,
    #[arg(long)]
    name: String,
}

#[derive(Args)]
struct ExecArgs {
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Exit code that cancels future runs
    #[arg(long)]
    cancel_exit_code: Option<i32>,
    /// Command and arguments; a job without one does nothing
    #[arg(last = true)]
    command: Vec<String>,
}

impl ExecArgs {
    fn into_action(self) -> Action {
        let mut parts = self.command.into_iter();
        match parts.next() {
            None => Action::Noop,
            Some(cmd) => Action::Exec {
                cmd,
                args: parts.collect(),
                timeout_ms: self.timeout_ms,
                cancel_exit_code: self.cancel_exit_code,
            },
        }
    }
}

struct Ctx {
    cfg: Config,
    kv: FsKv,
    jobs: Arc<KvJobStore<FsKv>>,
    host: Arc<LocalHost<FsKv>>,
    clock: Arc<dyn Clock>,
}

impl Ctx {
    fn open(cli: &Cli) -> Result<Self> {
        let mut cfg = match &cli.config {
            Some(path) => cfg::load_or_init_at(path)?,
            None => cfg::load_or_init(&JOBSD)?,
        };
        if let Some(dir) = &cli.data_dir {
            cfg.data_dir = Some(dir.clone());
        }
        let dir = cfg.store_dir(&JOBSD)?;
        debug!("job store at {}", dir.display());
        let kv = store::open_fs(&dir)?;
        Ok(Self {
            jobs: Arc::new(KvJobStore::new(kv.clone())),
            host: Arc::new(LocalHost::new(kv.clone())),
            clock: Arc::new(SystemClock),
            kv,
            cfg,
        })
    }

    fn registrar(&self) -> Registrar<LocalHost<FsKv>> {
        Registrar::new(&self.cfg.scheduler, self.host.clone(), self.jobs.clone(), self.clock.clone())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose { 0 => "warn", 1 => "info", 2 => "debug", _ => "trace" };
    logx::init(level);

    let ctx = Ctx::open(&cli)?;
    match cli.cmd {
        Command::List => {
            for job in ctx.jobs.list_jobs().await? {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
        Command::Show { id } => {
            let Some(job) = ctx.jobs.get_job(&JobId(id.clone())).await? else {
                bail!("no job {id}");
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Once { target, in_secs, slack_secs, exec } => {
            let when = ctx.clock.now_ms().saturating_add(in_secs.saturating_mul(1_000));
            let id = ctx
                .registrar()
                .schedule_one_shot(
                    &target.grain,
                    &target.name,
                    &exec.into_action(),
                    when,
                    Duration::from_secs(slack_secs),
                )
                .await
                .context("schedule one-shot job")?;
            println!("{id}");
        }
        Command::Every { target, period_secs, exec } => {
            let id = ctx
                .registrar()
                .schedule_periodic(
                    &target.grain,
                    &target.name,
                    &exec.into_action(),
                    Duration::from_secs(period_secs),
                )
                .await
                .context("schedule periodic job")?;
            println!("{id}");
        }
        Command::Cancel { id } => {
            let id = JobId(id);
            let job = ctx.jobs.get_job(&id).await?;
            let deleted = ctx.jobs.delete_job(&id).await?;
            if let (true, Some(job)) = (deleted, job) {
                ctx.host
                    .drop_ref(&job.callback)
                    .await
                    .context("release job callback")?;
            }
            println!("{}", json!({ "id": id, "deleted": deleted }));
        }
        Command::Sweep => {
            let grains = Arc::new(LocalGrains::new(ctx.kv.clone(), ctx.clock.clone()));
            let scheduler = Scheduler::new(
                &ctx.cfg.scheduler,
                ctx.jobs.clone(),
                ctx.host.clone(),
                grains,
                ctx.clock.clone(),
            );
            let report = scheduler.run_due_jobs(ctx.clock.now_ms()).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
    }
    Ok(())
}
