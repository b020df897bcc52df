use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;
use tracing::{info, warn};

use sluice_core::error::Result;
use sluice_core::event::EventBus;
use sluice_core::traits::ResourceBackend;
use sluice_core::types::{ArtifactRecord, ArtifactTag, PipelineEvent};

use crate::ledger::{AdvanceReport, ArtifactLedger, RetentionPolicy};
use crate::state::StateCell;
use crate::trigger::{NewArtifactThreshold, TriggerCondition};

/// Artifact counts per tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ArtifactCounts {
    pub new: usize,
    pub current: usize,
    pub old: usize,
}

/// A node wrapping a physical resource and its artifact ledger.
pub struct ResourceNode {
    name: String,
    predecessors: Vec<String>,
    backend: Arc<dyn ResourceBackend>,
    ledger: RwLock<ArtifactLedger>,
    trigger: Box<dyn TriggerCondition>,
    retention: RetentionPolicy,
    monitoring: bool,
    status: StateCell,
    event_bus: Arc<EventBus>,
    changed: Notify,
}

impl ResourceNode {
    /// A monitoring resource with the default `new >= 1` trigger.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn ResourceBackend>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let name = name.into();
        Self {
            ledger: RwLock::new(ArtifactLedger::new(name.clone())),
            status: StateCell::new(name.clone(), event_bus.clone()),
            name,
            predecessors: Vec::new(),
            backend,
            trigger: Box::new(NewArtifactThreshold::default()),
            retention: RetentionPolicy::default(),
            monitoring: true,
            event_bus,
            changed: Notify::new(),
        }
    }

    pub fn with_predecessors<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predecessors = predecessors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_trigger(mut self, trigger: impl TriggerCondition) -> Self {
        self.trigger = Box::new(trigger);
        self
    }

    pub fn with_boxed_trigger(mut self, trigger: Box<dyn TriggerCondition>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_monitoring(mut self, monitoring: bool) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predecessors(&self) -> &[String] {
        &self.predecessors
    }

    pub fn status(&self) -> &StateCell {
        &self.status
    }

    pub fn backend(&self) -> &Arc<dyn ResourceBackend> {
        &self.backend
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    pub fn trigger(&self) -> &dyn TriggerCondition {
        self.trigger.as_ref()
    }

    fn read_ledger(&self) -> RwLockReadGuard<'_, ArtifactLedger> {
        self.ledger.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_ledger(&self) -> RwLockWriteGuard<'_, ArtifactLedger> {
        self.ledger.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an artifact tagged `new`.
    pub fn record_artifact(&self, key: &str) -> Result<ArtifactRecord> {
        self.record(key, ArtifactTag::New)
    }

    fn record(&self, key: &str, tag: ArtifactTag) -> Result<ArtifactRecord> {
        let record = self.write_ledger().record(key, tag)?;
        self.event_bus.publish(PipelineEvent::ArtifactRecorded {
            node: self.name.clone(),
            key: record.key.clone(),
            tag,
        });
        self.changed.notify_one();
        Ok(record)
    }

    /// Whether `key` was ever recorded.
    pub fn is_recorded(&self, key: &str) -> bool {
        self.read_ledger().contains(key)
    }

    /// Keys under `tag`, oldest first.
    pub fn list_artifacts(&self, tag: ArtifactTag) -> Vec<String> {
        self.read_ledger().list(tag)
    }

    /// Count under one tag, or every live record.
    pub fn artifact_count(&self, tag: Option<ArtifactTag>) -> usize {
        self.read_ledger().count(tag)
    }

    pub fn artifact_counts(&self) -> ArtifactCounts {
        let ledger = self.read_ledger();
        ArtifactCounts {
            new: ledger.count(Some(ArtifactTag::New)),
            current: ledger.count(Some(ArtifactTag::Current)),
            old: ledger.count(Some(ArtifactTag::Old)),
        }
    }

    pub fn artifact_records(&self) -> Vec<ArtifactRecord> {
        self.read_ledger().records()
    }

    pub fn trigger_condition(&self) -> bool {
        self.trigger.evaluate(&self.read_ledger())
    }

    /// Retire `current`, promote `new`, then apply retention.
    pub async fn advance_artifacts(&self) -> Result<AdvanceReport> {
        let report = self.write_ledger().advance(&self.retention);

        if self.retention.delete_evicted {
            for key in &report.evicted {
                match self.backend.remove(key).await {
                    // The blob is gone, so a later one at the same key is a new artifact
                    Ok(()) => {
                        self.write_ledger().forget(key);
                    }
                    Err(e) => {
                        warn!(node = %self.name, key = %key, error = %e, "Failed to delete evicted artifact");
                    }
                }
            }
        }

        info!(
            node = %self.name,
            promoted = report.promoted,
            retired = report.retired,
            evicted = report.evicted.len(),
            "Artifacts advanced"
        );
        self.event_bus.publish(PipelineEvent::ArtifactsAdvanced {
            node: self.name.clone(),
            promoted: report.promoted,
            retired: report.retired,
            evicted: report.evicted.len(),
        });
        self.changed.notify_one();
        Ok(report)
    }

    /// Write a blob produced by pipeline logic.
    ///
    /// The key is recorded as `current` before the blob is written, so a
    /// monitor scan that races the write sees it as already logged.
    pub async fn save_artifact(&self, name: &str, content: impl Into<Vec<u8>>) -> Result<ArtifactRecord> {
        let key = self.backend.key_for(name);
        let record = self.record(&key, ArtifactTag::Current)?;
        let stored = match self.backend.write(name, content.into()).await {
            Ok(stored) => stored,
            Err(e) => {
                self.write_ledger().forget(&key);
                warn!(node = %self.name, key = %key, error = %e, "Artifact write failed, record rolled back");
                return Err(e);
            }
        };
        if stored != key {
            warn!(node = %self.name, expected = %key, stored = %stored, "Backend stored artifact under a different key");
        }
        Ok(record)
    }

    pub async fn read_artifact(&self, key: &str) -> Result<Vec<u8>> {
        self.backend.read(key).await
    }

    /// Scan the backend once and record unseen keys. Returns how many were new.
    pub async fn scan_once(&self) -> Result<usize> {
        let keys = self.backend.scan().await?;
        let mut added = 0;
        for key in keys {
            if self.is_recorded(&key) {
                continue;
            }
            // A concurrent save_artifact may win the race; that is not an error here
            if self.record_artifact(&key).is_ok() {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Resolves after the next ledger mutation.
    pub(crate) async fn changed(&self) {
        self.changed.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::error::SluiceError;
    use sluice_store::MemoryResource;

    fn node(backend: Arc<MemoryResource>) -> ResourceNode {
        ResourceNode::new("haiku_data_store", backend, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn test_record_and_trigger() {
        let res = node(Arc::new(MemoryResource::new("haiku")));
        assert!(!res.trigger_condition());
        res.record_artifact("haiku/test_file0.txt").unwrap();
        assert!(res.trigger_condition());
        assert!(matches!(
            res.record_artifact("haiku/test_file0.txt"),
            Err(SluiceError::DuplicateArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn test_advance_moves_batch_to_current() {
        let res = node(Arc::new(MemoryResource::new("haiku")));
        for i in 0..10 {
            res.record_artifact(&format!("f{}", i)).unwrap();
        }
        res.advance_artifacts().await.unwrap();
        assert_eq!(res.list_artifacts(ArtifactTag::Current).len(), 10);
        assert!(res.list_artifacts(ArtifactTag::New).is_empty());
        assert!(!res.trigger_condition());
    }

    #[tokio::test]
    async fn test_scan_once_records_only_unseen() {
        let backend = Arc::new(MemoryResource::new("haiku"));
        let res = node(backend.clone());
        backend.put("a.txt", "a").unwrap();
        assert_eq!(res.scan_once().await.unwrap(), 1);
        backend.put("b.txt", "b").unwrap();
        assert_eq!(res.scan_once().await.unwrap(), 1);
        assert_eq!(res.scan_once().await.unwrap(), 0);
        assert_eq!(res.artifact_count(None), 2);
    }

    #[tokio::test]
    async fn test_save_artifact_is_current_and_not_rescanned() {
        let backend = Arc::new(MemoryResource::new("model_registry"));
        let res = node(backend.clone()).with_monitoring(false);
        let record = res.save_artifact("model0.txt", "weights").await.unwrap();
        assert_eq!(record.tag, ArtifactTag::Current);
        assert_eq!(res.scan_once().await.unwrap(), 0);
        assert_eq!(res.read_artifact(&record.key).await.unwrap(), b"weights");
    }

    #[tokio::test]
    async fn test_delete_evicted_removes_blob() {
        let backend = Arc::new(MemoryResource::new("plots"));
        let res = node(backend.clone()).with_retention(RetentionPolicy {
            max_old: Some(0),
            delete_evicted: true,
        });
        backend.put("p0.png", "x").unwrap();
        res.scan_once().await.unwrap();
        res.advance_artifacts().await.unwrap();
        let report = res.advance_artifacts().await.unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert!(backend.is_empty());
        assert!(!res.is_recorded(&report.evicted[0]));

        // A rolling file written again at the same path is a fresh artifact
        backend.put("p0.png", "y").unwrap();
        assert_eq!(res.scan_once().await.unwrap(), 1);
        assert_eq!(res.list_artifacts(ArtifactTag::New), vec![report.evicted[0].clone()]);
        assert!(res.trigger_condition());
    }

    #[tokio::test]
    async fn test_ledger_only_eviction_keeps_key_known() {
        let backend = Arc::new(MemoryResource::new("plots"));
        let res = node(backend.clone()).with_retention(RetentionPolicy {
            max_old: Some(0),
            delete_evicted: false,
        });
        backend.put("p0.png", "x").unwrap();
        res.scan_once().await.unwrap();
        res.advance_artifacts().await.unwrap();
        let report = res.advance_artifacts().await.unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert!(!backend.is_empty());
        assert!(res.is_recorded(&report.evicted[0]));
        assert_eq!(res.scan_once().await.unwrap(), 0);
    }

    /// Memory resource whose writes always fail.
    struct ReadOnlyResource(MemoryResource);

    impl ResourceBackend for ReadOnlyResource {
        fn location(&self) -> String {
            self.0.location()
        }

        fn scan(&self) -> futures::future::BoxFuture<'_, Result<Vec<String>>> {
            self.0.scan()
        }

        fn read(&self, key: &str) -> futures::future::BoxFuture<'_, Result<Vec<u8>>> {
            self.0.read(key)
        }

        fn write(&self, _name: &str, _content: Vec<u8>) -> futures::future::BoxFuture<'_, Result<String>> {
            Box::pin(async { Err(SluiceError::Resource("disk full".into())) })
        }

        fn key_for(&self, name: &str) -> String {
            self.0.key_for(name)
        }

        fn remove(&self, key: &str) -> futures::future::BoxFuture<'_, Result<()>> {
            self.0.remove(key)
        }
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_record() {
        let res = ResourceNode::new(
            "model_registry",
            Arc::new(ReadOnlyResource(MemoryResource::new("m"))),
            Arc::new(EventBus::default()),
        )
        .with_monitoring(false);

        let err = res.save_artifact("model0.txt", "weights").await.unwrap_err();
        assert!(matches!(err, SluiceError::Resource(_)));
        assert!(res.list_artifacts(ArtifactTag::Current).is_empty());
        assert_eq!(res.artifact_count(None), 0);

        // Retrying hits the backend again instead of DuplicateArtifact
        let retry = res.save_artifact("model0.txt", "weights").await.unwrap_err();
        assert!(matches!(retry, SluiceError::Resource(_)));
    }
}
