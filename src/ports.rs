//! Port range specifications and the task source built on top of them.
//!
//! A spec is either a single port (`80`), an inclusive range (`8000-8010`) or a
//! comma separated list mixing both (`22,80,8000-8010`). Ports files carry the
//! same entries one per line with `#` comments.
use crate::error::{PipelineError, Result};
use crate::types::ScanTask;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One entry of a port specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSegment {
    Single(u16),
    Range { low: u16, high: u16 },
}

impl PortSegment {
    fn bounds(self) -> (u16, u16) {
        match self {
            PortSegment::Single(p) => (p, p),
            PortSegment::Range { low, high } => (low, high),
        }
    }
}

/// Parsed, validated port specification. Iteration order is the order the
/// segments were written in, with later duplicates dropped.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    segments: Vec<PortSegment>,
}

impl PortSpec {
    pub fn single(port: u16) -> Result<Self> {
        if port == 0 {
            return Err(PipelineError::invalid_range("port numbers must be greater than 0"));
        }
        Ok(Self {
            segments: vec![PortSegment::Single(port)],
        })
    }

    pub fn range(low: u16, high: u16) -> Result<Self> {
        let seg = validate_range(i64::from(low), i64::from(high))?;
        Ok(Self {
            segments: vec![seg],
        })
    }

    pub fn segments(&self) -> &[PortSegment] {
        &self.segments
    }

    /// Lazily walk the ports in spec order.
    pub fn iter(&self) -> PortIter {
        PortIter {
            segments: self.segments.clone(),
            seg_idx: 0,
            next: None,
            seen: Box::new([0u64; 1024]),
        }
    }

    /// Number of distinct ports in the spec.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

impl Default for PortSpec {
    /// The well-known range, `1-1024`.
    fn default() -> Self {
        Self {
            segments: vec![PortSegment::Range { low: 1, high: 1024 }],
        }
    }
}

impl FromStr for PortSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        parse_port_spec(s)
    }
}

impl TryFrom<String> for PortSpec {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self> {
        parse_port_spec(&s)
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> String {
        spec.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match seg {
                PortSegment::Single(p) => write!(f, "{p}")?,
                PortSegment::Range { low, high } => write!(f, "{low}-{high}")?,
            }
        }
        Ok(())
    }
}

/// Iterator over the distinct ports of a [`PortSpec`].
pub struct PortIter {
    segments: Vec<PortSegment>,
    seg_idx: usize,
    next: Option<(u32, u32)>,
    seen: Box<[u64; 1024]>,
}

impl PortIter {
    fn mark(&mut self, port: u16) -> bool {
        let (word, bit) = (usize::from(port) / 64, port % 64);
        let fresh = self.seen[word] & (1u64 << bit) == 0;
        self.seen[word] |= 1u64 << bit;
        fresh
    }
}

impl Iterator for PortIter {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        loop {
            if let Some((cur, high)) = self.next {
                if cur <= high {
                    self.next = Some((cur + 1, high));
                    // cur is bounded by a u16 high
                    let port = cur as u16;
                    if self.mark(port) {
                        return Some(port);
                    }
                    continue;
                }
                self.next = None;
            }
            let (low, high) = self.segments.get(self.seg_idx)?.bounds();
            self.seg_idx += 1;
            self.next = Some((u32::from(low), u32::from(high)));
        }
    }
}

/// Parse a spec string: `80`, `22-100` or `22,80,8000-8010`.
pub fn parse_port_spec(s: &str) -> Result<PortSpec> {
    let s = s.trim();
    if s.is_empty() {
        return Err(PipelineError::invalid_range("empty port specification"));
    }
    let mut segments = Vec::new();
    for part in s.split(',') {
        segments.push(parse_segment(part.trim())?);
    }
    Ok(PortSpec { segments })
}

/// Parse a ports file content: one port or range per line, `#` starts a comment.
pub fn parse_ports_str(s: &str) -> Result<PortSpec> {
    let mut segments = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        let seg = parse_segment(line).map_err(|e| match e {
            PipelineError::InvalidRange(msg) => {
                PipelineError::InvalidRange(format!("line {line_no}: {msg}"))
            }
            other => other,
        })?;
        segments.push(seg);
    }
    if segments.is_empty() {
        return Err(PipelineError::invalid_range("ports file lists no ports"));
    }
    Ok(PortSpec { segments })
}

/// Load a ports file from disk.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> anyhow::Result<PortSpec> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    let spec = parse_ports_str(&content)
        .with_context(|| format!("failed to parse ports file: {}", path.as_ref().display()))?;
    Ok(spec)
}

fn parse_segment(part: &str) -> Result<PortSegment> {
    if part.is_empty() {
        return Err(PipelineError::invalid_range("empty entry in port list"));
    }
    // A leading '-' is a negative number, not a range separator.
    let sep = part.char_indices().skip(1).find(|&(_, c)| c == '-');
    if let Some((at, _)) = sep {
        let low = parse_bound(part[..at].trim())?;
        let high = parse_bound(part[at + 1..].trim())?;
        return validate_range(low, high);
    }
    let p = parse_bound(part)?;
    validate_range(p, p).map(|_| PortSegment::Single(p as u16))
}

fn parse_bound(s: &str) -> Result<i64> {
    s.parse::<i64>()
        .map_err(|_| PipelineError::invalid_range(format!("failed to convert {s:?} to a valid port number")))
}

fn validate_range(low: i64, high: i64) -> Result<PortSegment> {
    if low <= 0 || high <= 0 {
        return Err(PipelineError::invalid_range("port numbers must be greater than 0"));
    }
    if low > 65535 || high > 65535 {
        return Err(PipelineError::invalid_range(format!(
            "port out of range: {}",
            low.max(high)
        )));
    }
    if low > high {
        return Err(PipelineError::invalid_range(format!(
            "invalid range {low}-{high} (start > end)"
        )));
    }
    Ok(PortSegment::Range {
        low: low as u16,
        high: high as u16,
    })
}

/// Produces scan tasks host-major: every port of the first host, then the next.
#[derive(Debug, Clone)]
pub struct TaskSource {
    hosts: Vec<String>,
    ports: PortSpec,
}

impl TaskSource {
    pub fn new(hosts: Vec<String>, ports: PortSpec) -> Self {
        Self { hosts, ports }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Total number of tasks the source will emit.
    pub fn len(&self) -> u64 {
        self.hosts.len() as u64 * self.ports.count() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily yields tasks; nothing is materialized up front.
    pub fn tasks(&self) -> impl Iterator<Item = ScanTask> + '_ {
        self.hosts.iter().flat_map(move |host| {
            self.ports
                .iter()
                .map(move |port| ScanTask::new(host.clone(), port))
        })
    }

    /// Owned variant of [`tasks`](Self::tasks) for moving into a producer task.
    pub fn into_tasks(self) -> impl Iterator<Item = ScanTask> + Send + 'static {
        let Self { hosts, ports } = self;
        hosts.into_iter().flat_map(move |host| {
            ports
                .iter()
                .map(move |port| ScanTask::new(host.clone(), port))
        })
    }
}

impl TaskSource {
    /// Stream tasks into a bounded queue from a background task. The feed
    /// blocks while the queue is full and stops early on cancellation. The
    /// handle resolves to the number of tasks actually emitted.
    pub fn spawn_feed(
        self,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<ScanTask>, JoinHandle<u64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut emitted = 0u64;
            for task in self.into_tasks() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = tx.send(task) => {
                        if res.is_err() {
                            break;
                        }
                        emitted += 1;
                    }
                }
            }
            debug!(emitted, "task feed finished");
            emitted
        });
        (rx, handle)
    }
}
