#![deny(missing_docs)]
//! jobs_core: durable job scheduling for grains (config, KV, logging, job engine).

/// Configuration helpers (AppId, dirs, load_or_init, scheduler tuning).
pub mod cfg;
/// Wall-clock abstraction shared by the engine.
pub mod clock;
/// Error taxonomy for registration, restoration, invocation and storage.
pub mod error;
/// Capability host, callback and grain seams.
pub mod host;
/// Persistent job model.
pub mod job;
/// JobStore seam and its KV-backed implementation.
pub mod jobstore;
/// Keep-alive pings for in-flight jobs.
pub mod liveness;
/// Local capability host and grain accessor backed by the KV store.
pub mod local;
/// Tracing/log initialization helpers.
pub mod logx;
/// Job eligibility rules evaluated on every sweep.
pub mod policy;
/// Turns live callbacks into durable job records.
pub mod registrar;
/// Executes one restored job.
pub mod runner;
/// The due-job sweep.
pub mod scheduler;
/// Simple file-backed KV store with serde helpers.
pub mod store;

#[cfg(test)]
pub(crate) mod testkit;
