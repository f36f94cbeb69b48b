//! Fan-in: many concurrent producers, one consumer.
//!
//! Producers are spawned on a [`TaskTracker`] which acts as the
//! wait-for-all barrier. The merged stream ends once that barrier passes, or
//! once cancellation fired and the grace period ran out, whichever is first.
use crate::types::ScanResult;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Producer side handle into a [`FanIn`].
#[derive(Clone, Debug)]
pub struct ResultSender {
    tx: mpsc::Sender<ScanResult>,
    cancel: CancellationToken,
    grace: Duration,
}

impl ResultSender {
    /// Deliver one result. Returns `false` when the consumer is gone, or when
    /// the pipeline was cancelled and buffer space did not free up within the
    /// grace period.
    pub async fn send(&self, result: ScanResult) -> bool {
        tokio::select! {
            biased;
            res = self.tx.send(result) => res.is_ok(),
            _ = async {
                self.cancel.cancelled().await;
                tokio::time::sleep(self.grace).await;
            } => false,
        }
    }
}

/// Builder for a merged result stream.
#[derive(Debug)]
pub struct FanIn {
    tx: mpsc::Sender<ScanResult>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    closed: CancellationToken,
    grace: Duration,
}

impl FanIn {
    pub fn new(
        capacity: usize,
        cancel: CancellationToken,
        grace: Duration,
    ) -> (Self, MergedResults) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let fan_in = Self {
            tx,
            tracker: TaskTracker::new(),
            cancel,
            closed: closed.clone(),
            grace,
        };
        (fan_in, MergedResults { rx, closed })
    }

    pub fn sender(&self) -> ResultSender {
        ResultSender {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            grace: self.grace,
        }
    }

    /// Forward every input channel into the merged stream. Each forwarder
    /// drains its input until the producer behind it hangs up, so results
    /// finished during the grace period still get through.
    pub fn forward(&self, inputs: Vec<mpsc::Receiver<ScanResult>>) {
        for (idx, mut input) in inputs.into_iter().enumerate() {
            let out = self.sender();
            self.spawn(async move {
                while let Some(result) = input.recv().await {
                    if !out.send(result).await {
                        break;
                    }
                }
                trace!(producer = idx, "producer drained");
            });
        }
    }

    /// Run a producer under the barrier.
    pub fn spawn<F>(&self, producer: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(producer)
    }

    /// Producers still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// No more producers will be added. Spawns the closer that waits on the
    /// barrier and then ends the merged stream.
    pub fn seal(self) -> JoinHandle<()> {
        let FanIn {
            tx,
            tracker,
            cancel,
            closed,
            grace,
        } = self;
        tracker.close();
        tokio::spawn(async move {
            tokio::select! {
                _ = tracker.wait() => {
                    debug!("all producers finished");
                }
                _ = async {
                    cancel.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => {
                    debug!(remaining = tracker.len(), "closing merged stream after cancellation");
                }
            }
            drop(tx);
            closed.cancel();
        })
    }
}

/// Consumer side of a [`FanIn`].
#[derive(Debug)]
pub struct MergedResults {
    rx: mpsc::Receiver<ScanResult>,
    closed: CancellationToken,
}

impl MergedResults {
    /// Next result, or `None` once the stream is complete. Results already
    /// buffered when the stream closes are still handed out.
    pub async fn recv(&mut self) -> Option<ScanResult> {
        tokio::select! {
            biased;
            res = self.rx.recv() => res,
            _ = self.closed.cancelled() => {
                self.rx.close();
                self.rx.recv().await
            }
        }
    }

    /// Drain everything that is left.
    pub async fn collect(mut self) -> Vec<ScanResult> {
        let mut out = Vec::new();
        while let Some(r) = self.recv().await {
            out.push(r);
        }
        out
    }
}

/// Merge independent producer channels into one stream.
pub fn merge(
    inputs: Vec<mpsc::Receiver<ScanResult>>,
    capacity: usize,
    cancel: CancellationToken,
    grace: Duration,
) -> MergedResults {
    let (fan_in, merged) = FanIn::new(capacity, cancel, grace);
    fan_in.forward(inputs);
    let _closer = fan_in.seal();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScanTask;
    use std::collections::HashSet;

    fn result(port: u16) -> ScanResult {
        ScanResult::open(ScanTask::new("127.0.0.1", port), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn merge_yields_every_result_exactly_once() {
        let cancel = CancellationToken::new();
        let mut inputs = Vec::new();
        let mut expected = HashSet::new();
        for producer in 0..5u16 {
            let (tx, rx) = mpsc::channel(2);
            inputs.push(rx);
            let count = producer * 7 + 1;
            let ports: Vec<u16> = (0..count).map(|i| producer * 1000 + i + 1).collect();
            expected.extend(ports.iter().copied());
            tokio::spawn(async move {
                for p in ports {
                    tx.send(result(p)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            });
        }

        let got = merge(inputs, 4, cancel, Duration::from_millis(50)).collect().await;
        let ports: Vec<u16> = got.iter().map(|r| r.port()).collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(ports.len(), expected.len());
        assert_eq!(unique, expected);
    }

    #[tokio::test]
    async fn slow_producer_is_not_dropped() {
        let cancel = CancellationToken::new();
        let (fast_tx, fast_rx) = mpsc::channel(1);
        let (slow_tx, slow_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            fast_tx.send(result(1)).await.unwrap();
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            slow_tx.send(result(2)).await.unwrap();
        });
        let got = merge(vec![fast_rx, slow_rx], 1, cancel, Duration::ZERO)
            .collect()
            .await;
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_closes_stream_with_stuck_producer() {
        let cancel = CancellationToken::new();
        let (fan_in, merged) = FanIn::new(1, cancel.clone(), Duration::from_millis(20));
        let sender = fan_in.sender();
        fan_in.spawn(async move {
            sender.send(result(7)).await;
            // never finishes on its own
            std::future::pending::<()>().await;
        });
        let closer = fan_in.seal();
        cancel.cancel();

        let got = tokio::time::timeout(Duration::from_secs(2), merged.collect())
            .await
            .expect("merged stream must close after cancellation");
        assert!(got.len() <= 1);
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn results_finished_during_grace_are_forwarded() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let merged = merge(vec![rx], 1, cancel.clone(), Duration::from_secs(2));
        cancel.cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(result(9)).await.unwrap();
        });
        let got = merged.collect().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].port(), 9);
    }

    #[tokio::test]
    async fn empty_fan_in_closes_immediately() {
        let (fan_in, merged) = FanIn::new(1, CancellationToken::new(), Duration::ZERO);
        fan_in.seal();
        assert!(merged.collect().await.is_empty());
    }
}
