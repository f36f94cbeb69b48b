use thiserror::Error;

/// Pipeline-level failures. Per-task dial failures never show up here; they
/// travel as data inside `ScanResult`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid port range: {0}")]
    InvalidRange(String),
    #[error("failed to write record {record} (port {port}): {source}")]
    SinkWrite {
        record: u64,
        port: u16,
        #[source]
        source: csv::Error,
    },
    #[error("sink flush failed: {0}")]
    SinkFlush(#[source] std::io::Error),
    #[error("sink refused record after an earlier write failure")]
    SinkClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn invalid_range(msg: impl Into<String>) -> Self {
        PipelineError::InvalidRange(msg.into())
    }
}

/// The limiter stopped admitting work because cancellation fired while a
/// caller was waiting for capacity. Treated as shutdown, not failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("capacity acquisition aborted by cancellation")]
pub struct CapacityError;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
