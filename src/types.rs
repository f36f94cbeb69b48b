use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One (host, port) unit of work. Consumed by exactly one probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanTask {
    pub host: String,
    pub port: u16,
}

impl ScanTask {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ScanTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Coarse classification of a failed connect attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Refused,
    Timeout,
    Unreachable,
    ResourceExhausted,
    Other,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Refused => "refused",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Unreachable => "unreachable",
            ErrorClass::ResourceExhausted => "resource_exhausted",
            ErrorClass::Other => "other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "refused" => Ok(ErrorClass::Refused),
            "timeout" => Ok(ErrorClass::Timeout),
            "unreachable" => Ok(ErrorClass::Unreachable),
            "resource_exhausted" | "exhausted" => Ok(ErrorClass::ResourceExhausted),
            "other" => Ok(ErrorClass::Other),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// Why a failed dial failed, kept as data rather than raised.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DialFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl fmt::Display for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Outcome of probing one task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub task: ScanTask,
    pub open: bool,
    pub error: Option<DialFailure>,
    pub elapsed: Duration,
}

impl ScanResult {
    pub fn open(task: ScanTask, elapsed: Duration) -> Self {
        Self {
            task,
            open: true,
            error: None,
            elapsed,
        }
    }

    pub fn failed(task: ScanTask, failure: DialFailure, elapsed: Duration) -> Self {
        Self {
            task,
            open: false,
            error: Some(failure),
            elapsed,
        }
    }

    pub fn port(&self) -> u16 {
        self.task.port
    }

    /// Rendered failure, empty for open ports.
    pub fn error_detail(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }
}

/// What fired the cancellation signal first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Timeout,
    Interrupt,
    EarlyStop,
    SinkFailure,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::Timeout => "timeout",
            CancelReason::Interrupt => "interrupt",
            CancelReason::EarlyStop => "early stop",
            CancelReason::SinkFailure => "sink failure",
        };
        f.write_str(s)
    }
}

/// Aggregate counters for one pipeline run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RunSummary {
    pub tasks_emitted: u64,
    pub probed: u64,
    pub matched: u64,
    pub peak_in_flight: usize,
    pub cancelled: Option<CancelReason>,
    pub elapsed: Duration,
    pub started_at: String,
}
