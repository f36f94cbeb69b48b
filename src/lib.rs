//! Library crate for portflow: a bounded, cancellable TCP connect scanning
//! pipeline built from reusable stages.
pub mod cancel;
pub mod config;
pub mod dial;
pub mod error;
pub mod filter;
pub mod limiter;
pub mod merge;
pub mod pipeline;
pub mod ports;
pub mod sink;
pub mod types;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
