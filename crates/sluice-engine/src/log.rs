use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use sluice_core::types::PipelineEvent;

/// JSONL pipeline event logger.
///
/// Writes one JSON object per line so a crash never corrupts earlier
/// entries. Stops after `PipelineStopped` or when the bus closes.
pub struct EventLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    pipeline: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    detail: serde_json::Value,
}

impl EventLogger {
    /// Logs go to `{log_dir}/{pipeline}/{timestamp}.jsonl`.
    /// `level`: 1 = transitions and failures, 2 = + runs and ledger advances,
    /// 3 = + artifact records, node logs and monitor retries.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Minimum level at which `event` is written.
    fn level_of(event: &PipelineEvent) -> u8 {
        match event {
            PipelineEvent::PipelineStarted { .. }
            | PipelineEvent::PipelineStopped { .. }
            | PipelineEvent::NodeTransition { .. }
            | PipelineEvent::NodeBlocked { .. }
            | PipelineEvent::NodeFailed { .. } => 1,
            PipelineEvent::RunStarted { .. }
            | PipelineEvent::RunEnded { .. }
            | PipelineEvent::ArtifactsAdvanced { .. } => 2,
            PipelineEvent::ArtifactRecorded { .. }
            | PipelineEvent::NodeLog { .. }
            | PipelineEvent::MonitorRetry { .. } => 3,
        }
    }

    fn event_to_entry(&self, pipeline: &str, event: &PipelineEvent) -> Option<LogEntry> {
        if Self::level_of(event) > self.level {
            return None;
        }
        let mut detail = serde_json::to_value(event).ok()?;
        let map = detail.as_object_mut()?;
        let event_type = map.remove("type")?.as_str()?.to_string();
        let node = map
            .remove("node")
            .and_then(|v| v.as_str().map(str::to_string));

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            pipeline: pipeline.to_string(),
            event_type,
            node,
            detail,
        })
    }

    /// Run until the pipeline stops.
    ///
    /// `rx` is subscribed by the caller so events published before this task
    /// is first polled are not lost.
    pub async fn run(self, mut rx: broadcast::Receiver<PipelineEvent>, pipeline: String) {
        let dir = self.log_dir.join(&pipeline);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), level = self.level, "EventLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(entry) = self.event_to_entry(&pipeline, &event) {
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            // Flush after each entry for crash resilience
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                    }
                    if matches!(event, PipelineEvent::PipelineStopped { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "EventLogger lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventBus closed, EventLogger stopping");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "EventLogger finished");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sluice_core::event::EventBus;
    use sluice_core::types::{ArtifactTag, NodeState};

    use super::*;

    #[test]
    fn test_level_filtering() {
        let logger = EventLogger::new(PathBuf::from("/tmp"), 1);
        let recorded = PipelineEvent::ArtifactRecorded {
            node: "store".into(),
            key: "a".into(),
            tag: ArtifactTag::New,
        };
        assert!(logger.event_to_entry("p", &recorded).is_none());

        let blocked = PipelineEvent::NodeBlocked {
            node: "eval".into(),
            epoch: 2,
        };
        let entry = logger.event_to_entry("p", &blocked).unwrap();
        assert_eq!(entry.event_type, "node_blocked");
        assert_eq!(entry.node.as_deref(), Some("eval"));
        assert_eq!(entry.detail["epoch"], 2);
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let rx = bus.subscribe();
        let logger = EventLogger::new(dir.path().to_path_buf(), 3);
        let handle = tokio::spawn(logger.run(rx, "demo".into()));

        bus.publish(PipelineEvent::NodeTransition {
            node: "retraining".into(),
            from: NodeState::Idle,
            to: NodeState::Waiting,
            epoch: 1,
            at: Utc::now(),
        });
        bus.publish(PipelineEvent::PipelineStopped {
            pipeline: "demo".into(),
        });
        handle.await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("demo"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "node_transition");
        assert_eq!(lines[0]["detail"]["to"], "waiting");
        assert_eq!(lines[1]["event_type"], "pipeline_stopped");
    }
}
