//! Stateless predicates applied after the merger, plus the optional
//! result-driven stop condition.
use crate::cancel::CancelController;
use crate::merge::MergedResults;
use crate::types::{CancelReason, ErrorClass, ScanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(try_from = "String", into = "String")]
pub enum Filter {
    /// Keep everything.
    All,
    /// Keep only successful connects.
    #[default]
    OpenOnly,
    /// Keep failures of one class, e.g. descriptor exhaustion.
    FailedWith(ErrorClass),
    /// Keep failures whose message contains the given text.
    ErrorContains(String),
}

impl Filter {
    pub fn matches(&self, r: &ScanResult) -> bool {
        match self {
            Filter::All => true,
            Filter::OpenOnly => r.open,
            Filter::FailedWith(class) => !r.open && r.error_class() == Some(*class),
            Filter::ErrorContains(needle) => {
                !r.open
                    && r.error
                        .as_ref()
                        .is_some_and(|e| e.message.contains(needle.as_str()))
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => f.write_str("all"),
            Filter::OpenOnly => f.write_str("open"),
            Filter::FailedWith(c) => write!(f, "class:{c}"),
            Filter::ErrorContains(s) => write!(f, "contains:{s}"),
        }
    }
}

impl FromStr for Filter {
    type Err = String;

    /// `all`, `open`, `class:<error class>` or `contains:<text>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(class) = s.strip_prefix("class:") {
            return class.parse().map(Filter::FailedWith);
        }
        if let Some(needle) = s.strip_prefix("contains:") {
            if needle.is_empty() {
                return Err("contains: filter needs some text".into());
            }
            return Ok(Filter::ErrorContains(needle.to_string()));
        }
        match s.trim() {
            "all" => Ok(Filter::All),
            "open" => Ok(Filter::OpenOnly),
            other => Err(format!("unknown filter: {other}")),
        }
    }
}

impl TryFrom<String> for Filter {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Filter> for String {
    fn from(f: Filter) -> String {
        f.to_string()
    }
}

/// Counters reported by the filter stage when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub seen: u64,
    pub matched: u64,
}

/// Spawn the filter stage between the merger and the sink.
///
/// Matching results are forwarded in arrival order. With `stop_after` set,
/// the controller is fired with [`CancelReason::EarlyStop`] as soon as that
/// many results have matched.
pub fn spawn_filter(
    mut input: MergedResults,
    filter: Filter,
    stop_after: Option<usize>,
    controller: CancelController,
    capacity: usize,
) -> (mpsc::Receiver<ScanResult>, JoinHandle<FilterStats>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut stats = FilterStats::default();
        while let Some(result) = input.recv().await {
            stats.seen += 1;
            if !filter.matches(&result) {
                continue;
            }
            stats.matched += 1;
            if tx.send(result).await.is_err() {
                debug!("sink went away, filter stopping");
                break;
            }
            if stop_after.is_some_and(|n| stats.matched >= n as u64) {
                info!(matched = stats.matched, %filter, "stop condition reached");
                controller.fire(CancelReason::EarlyStop);
                break;
            }
        }
        stats
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::FanIn;
    use crate::types::{DialFailure, ScanTask};
    use std::time::Duration;

    fn open(port: u16) -> ScanResult {
        ScanResult::open(ScanTask::new("127.0.0.1", port), Duration::ZERO)
    }

    fn failed(port: u16, class: ErrorClass, msg: &str) -> ScanResult {
        ScanResult::failed(
            ScanTask::new("127.0.0.1", port),
            DialFailure {
                class,
                message: msg.into(),
            },
            Duration::ZERO,
        )
    }

    #[test]
    fn predicates() {
        let emfile = failed(2, ErrorClass::ResourceExhausted, "Too many open files (os error 24)");
        let refused = failed(3, ErrorClass::Refused, "Connection refused (os error 111)");

        assert!(Filter::OpenOnly.matches(&open(1)));
        assert!(!Filter::OpenOnly.matches(&refused));
        assert!(Filter::FailedWith(ErrorClass::ResourceExhausted).matches(&emfile));
        assert!(!Filter::FailedWith(ErrorClass::ResourceExhausted).matches(&refused));
        assert!(Filter::ErrorContains("open files".into()).matches(&emfile));
        assert!(!Filter::ErrorContains("open files".into()).matches(&open(1)));
        assert!(Filter::All.matches(&refused));
    }

    #[test]
    fn parse_and_display() {
        for s in ["all", "open", "class:timeout", "contains:too many"] {
            assert_eq!(s.parse::<Filter>().unwrap().to_string(), s);
        }
        assert!("class:bogus".parse::<Filter>().is_err());
        assert!("contains:".parse::<Filter>().is_err());
    }

    async fn run_stage(
        results: Vec<ScanResult>,
        filter: Filter,
        stop_after: Option<usize>,
    ) -> (Vec<u16>, FilterStats, CancelController) {
        let controller = CancelController::new();
        let (fan_in, merged) = FanIn::new(16, controller.token(), Duration::ZERO);
        let sender = fan_in.sender();
        fan_in.spawn(async move {
            for r in results {
                if !sender.send(r).await {
                    break;
                }
            }
        });
        fan_in.seal();
        let (mut rx, handle) = spawn_filter(merged, filter, stop_after, controller.clone(), 4);
        let mut ports = Vec::new();
        while let Some(r) = rx.recv().await {
            ports.push(r.port());
        }
        (ports, handle.await.unwrap(), controller)
    }

    #[tokio::test]
    async fn stage_is_order_preserving() {
        let input = vec![open(5), failed(6, ErrorClass::Refused, "x"), open(1), open(9)];
        let (ports, stats, controller) = run_stage(input, Filter::OpenOnly, None).await;
        assert_eq!(ports, vec![5, 1, 9]);
        assert_eq!(stats, FilterStats { seen: 4, matched: 3 });
        assert!(!controller.is_fired());
    }

    #[tokio::test]
    async fn stop_after_fires_early_stop() {
        let input = vec![
            failed(1, ErrorClass::Refused, "refused"),
            failed(2, ErrorClass::ResourceExhausted, "too many open files"),
            failed(3, ErrorClass::ResourceExhausted, "too many open files"),
        ];
        let filter = Filter::FailedWith(ErrorClass::ResourceExhausted);
        let (ports, stats, controller) = run_stage(input, filter, Some(1)).await;
        assert_eq!(ports, vec![2]);
        assert_eq!(stats.matched, 1);
        assert_eq!(controller.reason(), Some(CancelReason::EarlyStop));
    }
}
