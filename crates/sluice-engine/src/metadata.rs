use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{info, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::event::EventBus;
use sluice_core::traits::MetadataBackend;
use sluice_core::types::{MetricEntry, ParamEntry, PipelineEvent, RunId, RunRecord, TagEntry};

use crate::state::StateCell;

/// Run/metric/param/tag recording, exposed as a pipeline node.
///
/// In the graph it is a passthrough: its work opens the epoch's run and its
/// settle hook closes it once every successor has finished the epoch.
pub struct MetadataNode {
    name: String,
    predecessors: Vec<String>,
    backend: Arc<dyn MetadataBackend>,
    active: Mutex<Option<RunId>>,
    status: StateCell,
    event_bus: Arc<EventBus>,
}

impl MetadataNode {
    /// Wrap `backend`. Runs left open by an earlier process are closed.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn MetadataBackend>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let name = name.into();
        let now = Utc::now();
        for run in backend.runs()?.into_iter().filter(RunRecord::is_active) {
            warn!(node = %name, run_id = %run.run_id, "Closing run left open by a previous process");
            backend.close_run(&run.run_id, now)?;
        }
        info!(node = %name, backend = backend.name(), "Metadata node ready");
        Ok(Self::observe(name, backend, event_bus))
    }

    /// Wrap `backend` as found, leaving runs from earlier processes untouched.
    pub fn observe(
        name: impl Into<String>,
        backend: Arc<dyn MetadataBackend>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let name = name.into();
        Self {
            status: StateCell::new(name.clone(), event_bus.clone()),
            name,
            predecessors: Vec::new(),
            backend,
            active: Mutex::new(None),
            event_bus,
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predecessors(&self) -> &[String] {
        &self.predecessors
    }

    pub fn status(&self) -> &StateCell {
        &self.status
    }

    fn active(&self) -> MutexGuard<'_, Option<RunId>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The active run, held under the lock so it cannot close mid-write.
    fn with_active<T>(&self, f: impl FnOnce(&RunId) -> Result<T>) -> Result<T> {
        let guard = self.active();
        match guard.as_ref() {
            Some(run_id) => f(run_id),
            None => Err(SluiceError::NoActiveRun(self.name.clone())),
        }
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.active().clone()
    }

    /// Open a run. Fails if one is already active.
    pub fn start_run(&self) -> Result<RunId> {
        self.start_run_at_epoch(self.status.epoch())
    }

    fn start_run_at_epoch(&self, epoch: u64) -> Result<RunId> {
        let mut active = self.active();
        if let Some(ref run_id) = *active {
            return Err(SluiceError::RunAlreadyActive(run_id.to_string()));
        }
        let run = RunRecord {
            run_id: RunId::new(),
            epoch,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.backend.insert_run(&run)?;
        *active = Some(run.run_id.clone());
        drop(active);

        info!(node = %self.name, run_id = %run.run_id, epoch, "Run started");
        self.event_bus.publish(PipelineEvent::RunStarted {
            node: self.name.clone(),
            run_id: run.run_id.clone(),
        });
        Ok(run.run_id)
    }

    /// Close the active run.
    pub fn end_run(&self) -> Result<RunId> {
        let mut active = self.active();
        let run_id = active
            .clone()
            .ok_or_else(|| SluiceError::NoActiveRun(self.name.clone()))?;
        self.backend.close_run(&run_id, Utc::now())?;
        *active = None;
        drop(active);

        info!(node = %self.name, run_id = %run_id, "Run ended");
        self.event_bus.publish(PipelineEvent::RunEnded {
            node: self.name.clone(),
            run_id: run_id.clone(),
        });
        Ok(run_id)
    }

    /// Node work: open this epoch's run unless one is already open.
    pub(crate) fn open_epoch_run(&self, epoch: u64) -> Result<()> {
        match self.start_run_at_epoch(epoch) {
            Ok(_) | Err(SluiceError::RunAlreadyActive(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Settle hook: close the epoch's run if still open.
    pub(crate) fn close_epoch_run(&self) -> Result<()> {
        match self.end_run() {
            Ok(_) | Err(SluiceError::NoActiveRun(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn log_metric(&self, name: &str, value: f64) -> Result<MetricEntry> {
        self.with_active(|run_id| {
            let entry = MetricEntry {
                run_id: run_id.clone(),
                name: name.to_string(),
                value,
                step: self.backend.metric_count(run_id, name)?,
                timestamp: Utc::now(),
            };
            self.backend.insert_metric(&entry)?;
            Ok(entry)
        })
    }

    pub fn log_metrics<I, S>(&self, metrics: I) -> Result<Vec<MetricEntry>>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        metrics
            .into_iter()
            .map(|(name, value)| self.log_metric(name.as_ref(), value))
            .collect()
    }

    pub fn log_param(&self, name: &str, value: impl Into<serde_json::Value>) -> Result<ParamEntry> {
        let value = value.into();
        self.with_active(|run_id| {
            let entry = ParamEntry {
                run_id: run_id.clone(),
                name: name.to_string(),
                value,
                timestamp: Utc::now(),
            };
            self.backend.insert_param(&entry)?;
            Ok(entry)
        })
    }

    pub fn log_params<I, S, V>(&self, params: I) -> Result<Vec<ParamEntry>>
    where
        I: IntoIterator<Item = (S, V)>,
        S: AsRef<str>,
        V: Into<serde_json::Value>,
    {
        params
            .into_iter()
            .map(|(name, value)| self.log_param(name.as_ref(), value))
            .collect()
    }

    /// Set a tag on the active run; the last write for a name wins.
    pub fn set_tag(&self, name: &str, value: impl Into<String>) -> Result<TagEntry> {
        let value = value.into();
        self.with_active(|run_id| {
            let entry = TagEntry {
                run_id: run_id.clone(),
                name: name.to_string(),
                value,
                updated_at: Utc::now(),
            };
            self.backend.upsert_tag(&entry)?;
            Ok(entry)
        })
    }

    pub fn set_tags<I, S, V>(&self, tags: I) -> Result<Vec<TagEntry>>
    where
        I: IntoIterator<Item = (S, V)>,
        S: AsRef<str>,
        V: Into<String>,
    {
        tags.into_iter()
            .map(|(name, value)| self.set_tag(name.as_ref(), value))
            .collect()
    }

    pub fn query_runs(&self) -> Result<Vec<RunRecord>> {
        self.backend.runs()
    }

    pub fn query_metrics(&self, run_id: Option<&RunId>) -> Result<Vec<MetricEntry>> {
        self.backend.metrics(run_id)
    }

    pub fn query_params(&self, run_id: Option<&RunId>) -> Result<Vec<ParamEntry>> {
        self.backend.params(run_id)
    }

    pub fn query_tags(&self, run_id: Option<&RunId>) -> Result<Vec<TagEntry>> {
        self.backend.tags(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_store::InMemoryMetadataStore;

    fn node() -> MetadataNode {
        MetadataNode::new(
            "metadata_store",
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(EventBus::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_runs_are_properly_nested() {
        let meta = node();
        assert!(matches!(meta.end_run(), Err(SluiceError::NoActiveRun(_))));

        let run = meta.start_run().unwrap();
        assert!(matches!(meta.start_run(), Err(SluiceError::RunAlreadyActive(_))));
        assert_eq!(meta.end_run().unwrap(), run);
        assert!(meta.active_run().is_none());

        let runs = meta.query_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].ended_at.is_some());
    }

    #[test]
    fn test_writes_require_active_run() {
        let meta = node();
        assert!(matches!(meta.log_metric("acc", 1.0), Err(SluiceError::NoActiveRun(_))));
        assert!(matches!(meta.log_param("seed", 1337), Err(SluiceError::NoActiveRun(_))));
        assert!(matches!(meta.set_tag("k", "v"), Err(SluiceError::NoActiveRun(_))));

        meta.start_run().unwrap();
        meta.log_metric("acc", 1.0).unwrap();
        meta.end_run().unwrap();
        // Late write after close
        assert!(meta.log_metric("acc", 0.5).is_err());
        assert_eq!(meta.query_metrics(None).unwrap().len(), 1);
    }

    #[test]
    fn test_metric_steps_count_per_name() {
        let meta = node();
        meta.start_run().unwrap();
        meta.log_metrics([("loss", 2.0), ("acc", 0.5), ("loss", 1.5)]).unwrap();
        let loss: Vec<u64> = meta
            .query_metrics(None)
            .unwrap()
            .into_iter()
            .filter(|m| m.name == "loss")
            .map(|m| m.step)
            .collect();
        assert_eq!(loss, vec![0, 1]);
    }

    #[test]
    fn test_batch_params_and_tags() {
        let meta = node();
        let run = meta.start_run().unwrap();
        meta.log_params([
            ("batch_size", serde_json::json!(64)),
            ("learning_rate", serde_json::json!(3e-4)),
        ])
        .unwrap();
        meta.set_tags([("test_name", "Karpathy LLM test"), ("test_name", "rerun")])
            .unwrap();

        let params = meta.query_params(Some(&run)).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].value, serde_json::json!(64));
        let tags = meta.query_tags(Some(&run)).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].value, "rerun");
    }

    #[test]
    fn test_stale_open_runs_closed_on_construction() {
        let backend = Arc::new(InMemoryMetadataStore::new());
        backend
            .insert_run(&RunRecord {
                run_id: RunId::from_string("crashed"),
                epoch: 4,
                started_at: Utc::now(),
                ended_at: None,
            })
            .unwrap();
        let meta =
            MetadataNode::new("metadata_store", backend, Arc::new(EventBus::default())).unwrap();
        assert!(meta.active_run().is_none());
        assert!(meta.query_runs().unwrap().iter().all(|r| !r.is_active()));
    }

    #[test]
    fn test_observe_leaves_open_runs_alone() {
        let backend = Arc::new(InMemoryMetadataStore::new());
        backend
            .insert_run(&RunRecord {
                run_id: RunId::from_string("crashed"),
                epoch: 4,
                started_at: Utc::now(),
                ended_at: None,
            })
            .unwrap();
        let meta = MetadataNode::observe("metadata_store", backend, Arc::new(EventBus::default()));
        assert!(meta.active_run().is_none());
        assert!(meta.query_runs().unwrap()[0].is_active());
    }

    #[test]
    fn test_epoch_run_hooks_are_idempotent() {
        let meta = node();
        meta.open_epoch_run(3).unwrap();
        let run = meta.active_run().unwrap();
        meta.open_epoch_run(3).unwrap();
        assert_eq!(meta.active_run(), Some(run));
        meta.close_epoch_run().unwrap();
        meta.close_epoch_run().unwrap();
        assert_eq!(meta.query_runs().unwrap()[0].epoch, 3);
    }
}
