use crate::error::{PipelineError, Result};
use crate::filter::Filter;
use crate::limiter::{Strategy, MAX_CONCURRENCY};
use crate::ports::PortSpec;
use crate::sink::SinkKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Everything one pipeline run needs, passed by value into [`crate::pipeline::Pipeline`].
///
/// Missing fields in a JSON config file fall back to [`Default`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub hosts: Vec<String>,
    pub ports: PortSpec,
    /// Worker count or semaphore weight.
    pub concurrency: usize,
    pub strategy: Strategy,
    pub per_attempt_timeout_ms: u64,
    /// Wall-clock budget for the whole run.
    pub overall_timeout_ms: Option<u64>,
    /// How long in-flight probes may keep running after cancellation.
    pub grace_ms: u64,
    pub filter: Filter,
    /// Fire an early stop once this many results passed the filter.
    pub stop_after: Option<usize>,
    pub sink: SinkKind,
    /// Queue depth between stages; defaults to the concurrency bound.
    pub channel_capacity: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".to_string()],
            ports: PortSpec::default(),
            concurrency: default_concurrency(),
            strategy: Strategy::WorkerPool,
            per_attempt_timeout_ms: 1_000,
            overall_timeout_ms: None,
            grace_ms: 500,
            filter: Filter::OpenOnly,
            stop_after: None,
            sink: SinkKind::Stream,
            channel_capacity: None,
        }
    }
}

/// Number of logical CPUs, or 4 when that cannot be determined.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl PipelineConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Check and normalize. Concurrency is clamped rather than rejected.
    pub fn validated(mut self) -> Result<Self> {
        self.hosts.retain(|h| !h.trim().is_empty());
        if self.hosts.is_empty() {
            return Err(PipelineError::Config("at least one host is required".into()));
        }
        if self.stop_after == Some(0) {
            return Err(PipelineError::Config("stop_after must be at least 1".into()));
        }
        if self.per_attempt_timeout_ms == 0 {
            return Err(PipelineError::Config("per-attempt timeout must be non-zero".into()));
        }
        self.concurrency = self.concurrency.clamp(1, MAX_CONCURRENCY);
        Ok(self)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        self.overall_timeout_ms.map(Duration::from_millis)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(self.concurrency).max(1)
    }

    pub fn multi_host(&self) -> bool {
        self.hosts.len() > 1
    }
}
