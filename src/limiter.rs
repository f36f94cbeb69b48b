//! Admission control for dial probes.
//!
//! Two strategies share one [`Limiter`]: a fixed pool of workers pulling from
//! the task queue, or one short-lived runner per task gated by a semaphore.
//! Either way at most `bound` probes are in flight and every permit is
//! returned exactly once, by dropping it.
use crate::dial::{probe_until_cancelled, Dialer};
use crate::error::CapacityError;
use crate::merge::{FanIn, MergedResults};
use crate::types::ScanTask;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const MAX_CONCURRENCY: usize = 5_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    WorkerPool,
    Semaphore,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::WorkerPool => f.write_str("pool"),
            Strategy::Semaphore => f.write_str("semaphore"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pool" | "worker_pool" | "workers" => Ok(Strategy::WorkerPool),
            "semaphore" | "sem" => Ok(Strategy::Semaphore),
            other => Err(format!("unknown strategy: {other} (expected pool or semaphore)")),
        }
    }
}

/// Per-probe timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub grace: Duration,
}

/// Capacity pool of size `bound` with in-flight accounting.
#[derive(Debug, Clone)]
pub struct Limiter {
    sem: Arc<Semaphore>,
    bound: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// One unit of capacity. Dropping it returns the unit.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Limiter {
    pub fn new(bound: usize) -> Self {
        let bound = bound.clamp(1, MAX_CONCURRENCY);
        Self {
            sem: Arc::new(Semaphore::new(bound)),
            bound,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Wait for one unit of capacity, giving up if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit, CapacityError> {
        if cancel.is_cancelled() {
            return Err(CapacityError);
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CapacityError),
            p = self.sem.clone().acquire_owned() => p.map_err(|_| CapacityError)?,
        };
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(Permit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held permits seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Run every task from `tasks` through `dialer` using `strategy`,
    /// returning the merged result stream.
    pub fn execute(
        &self,
        strategy: Strategy,
        tasks: mpsc::Receiver<ScanTask>,
        dialer: Arc<dyn Dialer>,
        settings: ProbeSettings,
        cancel: CancellationToken,
    ) -> MergedResults {
        match strategy {
            Strategy::WorkerPool => self.worker_pool(tasks, dialer, settings, cancel),
            Strategy::Semaphore => self.per_task(tasks, dialer, settings, cancel),
        }
    }

    /// Exactly `bound` long-lived workers share the task queue; each feeds its
    /// own output channel and the outputs are merged. Workers and forwarders
    /// run under the same barrier.
    pub fn worker_pool(
        &self,
        tasks: mpsc::Receiver<ScanTask>,
        dialer: Arc<dyn Dialer>,
        settings: ProbeSettings,
        cancel: CancellationToken,
    ) -> MergedResults {
        let (fan_in, merged) = FanIn::new(self.bound, cancel.clone(), settings.grace);
        let queue = Arc::new(Mutex::new(tasks));
        let mut outputs = Vec::with_capacity(self.bound);
        for worker in 0..self.bound {
            let (tx, rx) = mpsc::channel(1);
            outputs.push(rx);
            let queue = queue.clone();
            let dialer = dialer.clone();
            let limiter = self.clone();
            let cancel = cancel.clone();
            fan_in.spawn(async move {
                let mut done = 0u64;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        t = async { queue.lock().await.recv().await } => t,
                    };
                    let Some(task) = next else { break };
                    let Ok(permit) = limiter.acquire(&cancel).await else {
                        break;
                    };
                    let res = probe_until_cancelled(
                        dialer.as_ref(),
                        task,
                        settings.timeout,
                        &cancel,
                        settings.grace,
                    )
                    .await;
                    drop(permit);
                    let Some(res) = res else { break };
                    done += 1;
                    if tx.send(res).await.is_err() {
                        break;
                    }
                }
                trace!(worker, done, "worker exiting");
            });
        }
        fan_in.forward(outputs);
        let _closer = fan_in.seal();
        merged
    }

    /// One ephemeral runner per task, admitted in task order once a unit of
    /// capacity is free.
    pub fn per_task(
        &self,
        mut tasks: mpsc::Receiver<ScanTask>,
        dialer: Arc<dyn Dialer>,
        settings: ProbeSettings,
        cancel: CancellationToken,
    ) -> MergedResults {
        let (fan_in, merged) = FanIn::new(self.bound, cancel.clone(), settings.grace);
        let limiter = self.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    t = tasks.recv() => t,
                };
                let Some(task) = next else { break };
                let permit = match limiter.acquire(&cancel).await {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(port = task.port, "{e}");
                        break;
                    }
                };
                let out = fan_in.sender();
                let dialer = dialer.clone();
                let cancel = cancel.clone();
                fan_in.spawn(async move {
                    let res = probe_until_cancelled(
                        dialer.as_ref(),
                        task,
                        settings.timeout,
                        &cancel,
                        settings.grace,
                    )
                    .await;
                    if let Some(res) = res {
                        out.send(res).await;
                    }
                    // Held through delivery so a slow consumer bounds the runner count too.
                    drop(permit);
                });
            }
            let _closer = fan_in.seal();
        });
        merged
    }
}
