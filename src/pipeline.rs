//! One pipeline run: task feed -> limiter(probe) x N -> fan-in -> filter -> sink,
//! with a single cancellation signal cutting across every stage.
use crate::cancel::CancelController;
use crate::config::PipelineConfig;
use crate::dial::{Dialer, TcpDialer};
use crate::error::Result;
use crate::filter::{spawn_filter, FilterStats};
use crate::limiter::{Limiter, ProbeSettings};
use crate::ports::TaskSource;
use crate::sink::ResultSink;
use crate::types::{CancelReason, RunSummary};
use ::time::{format_description::well_known, OffsetDateTime};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

pub struct Pipeline {
    config: PipelineConfig,
    dialer: Arc<dyn Dialer>,
    controller: CancelController,
}

impl Pipeline {
    /// Pipeline dialing real TCP.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_dialer(config, Arc::new(TcpDialer))
    }

    pub fn with_dialer(config: PipelineConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        Ok(Self {
            config: config.validated()?,
            dialer,
            controller: CancelController::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for external triggers such as Ctrl-C.
    pub fn controller(&self) -> CancelController {
        self.controller.clone()
    }

    /// Drive the run to completion or cancellation.
    ///
    /// Cancellation is not an error: the summary reports the reason and the
    /// sink has seen every result that made it through before shutdown. A
    /// sink failure stops the run and is returned after the other stages
    /// have drained.
    pub async fn run(self, sink: &mut dyn ResultSink) -> Result<RunSummary> {
        let Self {
            config,
            dialer,
            controller,
        } = self;
        let started = Instant::now();
        let started_at = now_rfc3339();
        let cancel = controller.token();
        let source = TaskSource::new(config.hosts.clone(), config.ports.clone());

        info!(
            hosts = config.hosts.len(),
            tasks = source.len(),
            concurrency = config.concurrency,
            strategy = %config.strategy,
            filter = %config.filter,
            "starting scan pipeline"
        );

        let deadline = config.overall_timeout().map(|d| controller.arm_timeout(d));

        let capacity = config.capacity();
        let (tasks, feed) = source.spawn_feed(capacity, cancel.clone());
        let limiter = Limiter::new(config.concurrency);
        let settings = ProbeSettings {
            timeout: config.per_attempt_timeout(),
            grace: config.grace(),
        };
        let merged = limiter.execute(config.strategy, tasks, dialer, settings, cancel.clone());
        let (mut filtered, filter_stage) = spawn_filter(
            merged,
            config.filter.clone(),
            config.stop_after,
            controller.clone(),
            capacity,
        );

        let mut sink_error = None;
        while let Some(result) = filtered.recv().await {
            if let Err(e) = sink.accept(&result) {
                warn!(error = %e, "sink failed, shutting down pipeline");
                controller.fire(CancelReason::SinkFailure);
                sink_error = Some(e);
                break;
            }
        }
        // Keep upstream moving until every stage has exited.
        while filtered.recv().await.is_some() {}

        let tasks_emitted = feed.await.unwrap_or_else(|e| {
            warn!(error = %e, "task feed did not finish cleanly");
            0
        });
        let stats = filter_stage.await.unwrap_or_else(|e| {
            warn!(error = %e, "filter stage did not finish cleanly");
            FilterStats::default()
        });
        if let Some(deadline) = deadline {
            deadline.abort();
        }

        if let Some(e) = sink_error {
            return Err(e);
        }
        sink.finish()?;

        let summary = RunSummary {
            tasks_emitted,
            probed: stats.seen,
            matched: stats.matched,
            peak_in_flight: limiter.peak(),
            cancelled: controller.reason(),
            elapsed: started.elapsed(),
            started_at,
        };
        info!(
            emitted = summary.tasks_emitted,
            probed = summary.probed,
            matched = summary.matched,
            peak = summary.peak_in_flight,
            cancelled = ?summary.cancelled,
            elapsed = ?summary.elapsed,
            "scan pipeline finished"
        );
        Ok(summary)
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
