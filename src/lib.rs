// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod ai;
pub mod api;
pub mod classify;
pub mod compile;
pub mod config;
pub mod delivery;
pub mod enrich;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod issue;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod select;
pub mod source_weights;
pub mod store;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::error::{ErrorKind, PipelineError, Result};
pub use crate::pipeline::{Pipeline, PipelineParts};
