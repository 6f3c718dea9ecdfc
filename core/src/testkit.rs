//! In-memory doubles for the engine's seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::error::{CallError, DropError, PingError, RestoreError, SaveError};
use crate::host::{CapabilityHost, GrainAccessor, JobCallback, RunResult};
use crate::job::SturdyRef;

pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(ms: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(ms)))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub enum Step {
    Succeed { cancel: bool },
    Fail(CallError),
    SleepThen(Duration, Box<Step>),
    Hang,
}

pub struct FakeCallback {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    pub started: Notify,
}

impl FakeCallback {
    pub fn always(step: Step) -> Arc<Self> {
        Self::script(Vec::new(), step)
    }

    pub fn script(steps: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
            started: Notify::new(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

async fn play(step: Step) -> Result<RunResult, CallError> {
    let mut step = step;
    loop {
        match step {
            Step::Succeed { cancel } => return Ok(RunResult { cancel_future_runs: cancel }),
            Step::Fail(e) => return Err(e),
            Step::SleepThen(d, next) => {
                tokio::time::sleep(d).await;
                step = *next;
            }
            Step::Hang => return std::future::pending().await,
        }
    }
}

struct Handle(Arc<FakeCallback>);

#[async_trait]
impl JobCallback for Handle {
    async fn run(&self) -> Result<RunResult, CallError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.0.next_step();
        self.0.started.notify_one();
        play(step).await
    }
}

#[derive(Default)]
pub struct FakeHost {
    saved: Mutex<HashMap<String, Arc<FakeCallback>>>,
    counter: AtomicUsize,
    pub refuse_saves: AtomicBool,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forget(&self, sturdy: &SturdyRef) {
        self.saved.lock().unwrap().remove(&sturdy.0);
    }

    pub fn holds(&self, sturdy: &SturdyRef) -> bool {
        self.saved.lock().unwrap().contains_key(&sturdy.0)
    }
}

#[async_trait]
impl CapabilityHost for FakeHost {
    type Live = Arc<FakeCallback>;

    async fn save(&self, live: &Self::Live, owner: &str) -> Result<SturdyRef, SaveError> {
        if self.refuse_saves.load(Ordering::SeqCst) {
            return Err(SaveError("host refused".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let token = format!("{owner}-{n}");
        self.saved.lock().unwrap().insert(token.clone(), live.clone());
        Ok(SturdyRef(token))
    }

    async fn restore(&self, sturdy: &SturdyRef) -> Result<Box<dyn JobCallback>, RestoreError> {
        let cb = self
            .saved
            .lock()
            .unwrap()
            .get(&sturdy.0)
            .cloned()
            .ok_or_else(|| RestoreError::NotFound(sturdy.clone()))?;
        Ok(Box::new(Handle(cb)))
    }

    async fn drop_ref(&self, sturdy: &SturdyRef) -> Result<bool, DropError> {
        Ok(self.saved.lock().unwrap().remove(&sturdy.0).is_some())
    }
}

#[derive(Default)]
pub struct FakeGrains {
    pings: AtomicUsize,
    pub unreachable: AtomicBool,
}

impl FakeGrains {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GrainAccessor for FakeGrains {
    async fn keep_alive(&self, grain_id: &str) -> Result<(), PingError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(PingError { grain_id: grain_id.to_string(), reason: "unreachable".into() });
        }
        Ok(())
    }
}
