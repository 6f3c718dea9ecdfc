//! Capability host and grain accessor for a single-node deployment. Callbacks
//! are [`Action`]s persisted in the KV store; grains are tracked by last-seen time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CallError, DropError, PingError, RestoreError, SaveError};
use crate::host::{CapabilityHost, GrainAccessor, JobCallback, RunResult};
use crate::job::SturdyRef;
use crate::store::{ns, Kv, KvSerde};

/// Work a local callback performs when run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Do nothing.
    Noop,
    /// Execute an OS command.
    Exec {
        /// Command/executable.
        cmd: String,
        /// Arguments.
        args: Vec<String>,
        /// Optional timeout (ms).
        timeout_ms: Option<u64>,
        /// Exit code meaning "succeeded, never run me again".
        cancel_exit_code: Option<i32>,
    },
}

#[derive(Serialize, Deserialize)]
struct SavedCap {
    owner: String,
    action: Action,
}

/// [`CapabilityHost`] storing [`Action`]s under `caps:<ref>`.
#[derive(Clone)]
pub struct LocalHost<K: Kv> {
    kv: K,
}

impl<K: Kv> LocalHost<K> {
    /// Host persisting into `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl<K: Kv> CapabilityHost for LocalHost<K> {
    type Live = Action;

    async fn save(&self, live: &Action, owner: &str) -> Result<SturdyRef, SaveError> {
        let token = Uuid::new_v4().simple().to_string();
        let saved = SavedCap { owner: owner.to_string(), action: live.clone() };
        self.kv
            .put_t(&ns("caps", &token), &saved)
            .map_err(|e| SaveError(format!("{e:#}")))?;
        Ok(SturdyRef(token))
    }

    async fn restore(&self, sturdy: &SturdyRef) -> Result<Box<dyn JobCallback>, RestoreError> {
        let saved: SavedCap = self
            .kv
            .get_t(&ns("caps", &sturdy.0))
            .map_err(|e| RestoreError::Backend(format!("{e:#}")))?
            .ok_or_else(|| RestoreError::NotFound(sturdy.clone()))?;
        Ok(Box::new(ActionCallback { action: saved.action }))
    }

    async fn drop_ref(&self, sturdy: &SturdyRef) -> Result<bool, DropError> {
        Ok(self.kv.delete(&ns("caps", &sturdy.0)))
    }
}

struct ActionCallback {
    action: Action,
}

#[async_trait]
impl JobCallback for ActionCallback {
    async fn run(&self) -> Result<RunResult, CallError> {
        execute(&self.action).await
    }
}

/// Run one action and classify the result.
pub async fn execute(action: &Action) -> Result<RunResult, CallError> {
    match action {
        Action::Noop => Ok(RunResult::default()),

        Action::Exec { cmd, args, timeout_ms, cancel_exit_code } => {
            let mut c = Command::new(cmd);
            c.args(args).kill_on_drop(true);
            let mut child = c
                .spawn()
                .map_err(|e| CallError::failed(format!("spawn {cmd}: {e}")))?;

            let status = match timeout_ms {
                Some(ms) => timeout(Duration::from_millis(*ms), child.wait())
                    .await
                    .map_err(|_| CallError::overloaded(format!("{cmd} timed out after {ms}ms")))?,
                None => child.wait().await,
            }
            .map_err(|e| CallError::failed(format!("wait {cmd}: {e}")))?;

            match status.code() {
                Some(0) => Ok(RunResult::default()),
                Some(code) if Some(code) == *cancel_exit_code => {
                    Ok(RunResult { cancel_future_runs: true })
                }
                Some(code) => Err(CallError::failed(format!("{cmd} exited with status {code}"))),
                None => Err(CallError::disconnected(format!("{cmd} terminated by signal"))),
            }
        }
    }
}

/// [`GrainAccessor`] for grains living on this node: a ping records the grain's
/// last-seen time under `grains:<id>`.
pub struct LocalGrains<K: Kv> {
    kv: K,
    clock: Arc<dyn Clock>,
}

impl<K: Kv> LocalGrains<K> {
    /// Accessor writing into `kv`.
    pub fn new(kv: K, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// When the grain last answered a keep-alive (ms since epoch).
    pub fn last_seen(&self, grain_id: &str) -> Option<u64> {
        self.kv.get_t(&ns("grains", grain_id)).ok().flatten()
    }
}

#[async_trait]
impl<K: Kv> GrainAccessor for LocalGrains<K> {
    async fn keep_alive(&self, grain_id: &str) -> Result<(), PingError> {
        self.kv
            .put_t(&ns("grains", grain_id), &self.clock.now_ms())
            .map_err(|e| PingError { grain_id: grain_id.to_string(), reason: format!("{e:#}") })
    }
}
