//! Single broadcast shutdown signal shared by every pipeline stage.
use crate::types::CancelReason;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wraps a [`CancellationToken`] and remembers which trigger fired first.
///
/// Firing is idempotent: only the first call records a reason, later calls
/// are no-ops. Stages normally receive the plain token from [`token`](Self::token)
/// and only observe it.
#[derive(Clone, Debug, Default)]
pub struct CancelController {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the signal. Returns `true` only for the call that actually fired it.
    pub fn fire(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        if first {
            info!(%reason, "pipeline cancellation fired");
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Fire with [`CancelReason::Timeout`] once `after` elapses. The watcher
    /// exits early if something else fires first.
    pub fn arm_timeout(&self, after: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    this.fire(CancelReason::Timeout);
                }
                _ = this.token.cancelled() => {}
            }
        })
    }

    /// Fire with [`CancelReason::Interrupt`] on Ctrl-C.
    pub fn listen_for_interrupt(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        this.fire(CancelReason::Interrupt);
                    }
                }
                _ = this.token.cancelled() => {}
            }
        })
    }
}
