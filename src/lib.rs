//! # forms2xml
//!
//! Converts Oracle Forms modules to XML and back through an external
//! converter, and migrates the XML to the target schema on the way.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            Job source (CLI, batch, HTTP)                 │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [pipeline]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Orchestrator: decode ─► rewrite ─► encode              │
//! │   streaming pipes, error-carrying close, atomic output   │
//! └─────────────────────────────────────────────────────────┘
//!            │                   │
//!            ▼ [convert]         ▼ [rewrite]
//! ┌──────────────────────┐  ┌──────────────────────────────┐
//! │ Converter            │  │ FormsXmlProcessor            │
//! │  WorkerPool (local)  │  │  single-pass token rewrite,  │
//! │  RemoteConverter     │  │  anchor-based synthesis      │
//! └──────────────────────┘  └──────────────────────────────┘
//!            │
//!            ▼ [worker]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Supervised converter processes (pipe or loopback HTTP) │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod convert;
pub mod logging;
pub mod pipeline;
pub mod rewrite;
pub mod worker;

#[cfg(feature = "server")]
pub mod server;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::convert::{Converter, MimeType, RemoteConverter, RetryPolicy};
    pub use crate::pipeline::{
        run_batch, BatchOptions, Direction, JobError, JobSpec, Orchestrator, PipelineJob,
    };
    pub use crate::rewrite::{FormsXmlProcessor, RewriteConfig, RewriteReport};
    pub use crate::worker::{PoolConfig, WorkerPool};
}
