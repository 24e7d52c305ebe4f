//! Critical CSS extraction engine.
//!
//! Drives headless-browser rendering across viewport profiles, merges the
//! per-viewport CSS coverage into one cascade-order-preserving critical
//! stylesheet, and composes the deferred-load instructions for the rest —
//! all behind an asynchronous job lifecycle with bounded concurrency and
//! retry/backoff semantics.

pub mod api;
pub mod config;
pub mod coverage;
pub mod css;
pub mod defer;
pub mod engine;
pub mod errors;
pub mod job;
pub mod merge;
pub mod session;
pub mod store;
pub mod vendor;
pub mod viewport;

pub use api::{GenerateAccepted, GenerateRequest, JobStatusResponse};
pub use config::{EngineConfig, RetryPolicy};
pub use engine::{CriticalCssEngine, EngineEvent, EngineHandle, EngineServices, EngineStats};
pub use errors::{EngineError, JobError, JobErrorKind, RenderFailure};
pub use job::{CssJob, JobId, JobStatus};
pub use viewport::{ViewportProfile, ViewportSet};
