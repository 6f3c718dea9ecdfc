use std::sync::Arc;

use jobs_core::clock::Clock;
use tokio::task::JoinHandle;

/// Shared handles every module receives at spawn time.
#[derive(Clone)]
pub struct ModuleCtx {
    pub clock: Arc<dyn Clock>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
