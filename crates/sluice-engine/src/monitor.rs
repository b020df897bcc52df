use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::config::MonitorConfig;
use sluice_core::event::EventBus;
use sluice_core::types::PipelineEvent;

use crate::resource::ResourceNode;
use crate::retry::calculate_backoff;
use crate::worker::Signal;

/// Watches a resource backend and records artifacts as they appear.
///
/// Scan errors are retried with backoff. After `max_retries` consecutive
/// failures the node's worker is told to fail the epoch, and the budget
/// starts over.
pub(crate) struct Monitor {
    node: Arc<ResourceNode>,
    config: MonitorConfig,
    event_bus: Arc<EventBus>,
    escalate: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
}

impl Monitor {
    pub(crate) fn new(
        node: Arc<ResourceNode>,
        config: MonitorConfig,
        event_bus: Arc<EventBus>,
        escalate: mpsc::UnboundedSender<Signal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node,
            config,
            event_bus,
            escalate,
            cancel,
        }
    }

    /// Run until cancelled.
    pub(crate) async fn run(self) {
        let interval = self.config.poll_interval();
        info!(
            node = %self.node.name(),
            location = %self.node.backend().location(),
            poll_ms = interval.as_millis() as u64,
            "Monitor started"
        );

        let mut attempt: u32 = 0;
        loop {
            let scanned = tokio::select! {
                result = self.node.scan_once() => result,
                _ = self.cancel.cancelled() => break,
            };
            let delay = match scanned {
                Ok(added) => {
                    if added > 0 {
                        debug!(node = %self.node.name(), added, "Monitor recorded artifacts");
                    }
                    attempt = 0;
                    interval
                }
                Err(e) if attempt < self.config.max_retries => {
                    let backoff = calculate_backoff(attempt, &self.config);
                    attempt += 1;
                    warn!(
                        node = %self.node.name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Monitor scan failed, retrying"
                    );
                    self.event_bus.publish(PipelineEvent::MonitorRetry {
                        node: self.node.name().to_string(),
                        attempt,
                        backoff_ms: backoff.as_millis() as u64,
                        error: e.to_string(),
                    });
                    backoff
                }
                Err(e) => {
                    error!(
                        node = %self.node.name(),
                        attempts = attempt + 1,
                        error = %e,
                        "Monitor retry budget exhausted"
                    );
                    let message = format!("monitor failed after {} attempts: {}", attempt + 1, e);
                    if self.escalate.send(Signal::Escalate { error: message }).is_err() {
                        debug!(node = %self.node.name(), "Worker gone, monitor stopping");
                        break;
                    }
                    attempt = 0;
                    interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        info!(node = %self.node.name(), "Monitor shutting down");
    }
}
