//! Seams to the outside world: the capability host that saves and restores
//! callbacks, the restored callbacks themselves, and the grains that own them.

use async_trait::async_trait;

use crate::error::{CallError, DropError, PingError, RestoreError, SaveError};
use crate::job::SturdyRef;

/// What a callback reports after a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    /// The job asks never to be run again.
    pub cancel_future_runs: bool,
}

/// A live, callable job handle obtained from a [`CapabilityHost`].
#[async_trait]
pub trait JobCallback: Send + Sync {
    /// Run the job once.
    async fn run(&self) -> Result<RunResult, CallError>;
}

/// Saves live callbacks as sturdy refs and restores them later.
#[async_trait]
pub trait CapabilityHost: Send + Sync + 'static {
    /// Live capability type accepted by [`CapabilityHost::save`].
    type Live: Send + Sync;

    /// Persist `live` and return a durable reference tagged with `owner`.
    async fn save(&self, live: &Self::Live, owner: &str) -> Result<SturdyRef, SaveError>;

    /// Exchange a durable reference for a live callback.
    async fn restore(&self, sturdy: &SturdyRef) -> Result<Box<dyn JobCallback>, RestoreError>;

    /// Release a saved callback once no job refers to it. Returns `false` if
    /// nothing was saved under `sturdy`.
    async fn drop_ref(&self, sturdy: &SturdyRef) -> Result<bool, DropError>;
}

/// Reaches the supervisor of a grain.
#[async_trait]
pub trait GrainAccessor: Send + Sync + 'static {
    /// Tell the grain's supervisor a job is still running on its behalf.
    async fn keep_alive(&self, grain_id: &str) -> Result<(), PingError>;
}
