//! Shared mocks and helpers for Sluice tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use sluice_core::error::{Result, SluiceError};
use sluice_core::event::EventBus;
use sluice_core::traits::ResourceBackend;
use sluice_core::types::{NodeState, PipelineEvent};
use sluice_engine::{ActionContext, ActionLogic, Pipeline};
use sluice_store::MemoryResource;

pub fn test_bus() -> Arc<EventBus> {
    Arc::new(EventBus::new(4096))
}

/// How a [`RecordingAction`] finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeed,
    /// Return `Ok(false)`.
    Fail,
    /// Return an error.
    Error,
    Panic,
}

#[derive(Default)]
struct Recording {
    started: AtomicUsize,
    finished: AtomicUsize,
    epochs: Mutex<Vec<u64>>,
}

/// Action logic that records every execution. Clones share the record.
#[derive(Clone)]
pub struct RecordingAction {
    outcome: ActionOutcome,
    delay: Option<Duration>,
    record: Arc<Recording>,
}

impl RecordingAction {
    pub fn new(outcome: ActionOutcome) -> Self {
        Self {
            outcome,
            delay: None,
            record: Arc::new(Recording::default()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(ActionOutcome::Succeed)
    }

    pub fn failing() -> Self {
        Self::new(ActionOutcome::Fail)
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn executions(&self) -> usize {
        self.record.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.record.finished.load(Ordering::SeqCst)
    }

    /// Epochs in which the action ran, in order.
    pub fn epochs(&self) -> Vec<u64> {
        self.record.epochs.lock().unwrap().clone()
    }
}

impl ActionLogic for RecordingAction {
    fn execute<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.record.started.fetch_add(1, Ordering::SeqCst);
            self.record.epochs.lock().unwrap().push(ctx.epoch());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.record.finished.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                ActionOutcome::Succeed => Ok(true),
                ActionOutcome::Fail => Ok(false),
                ActionOutcome::Error => Err(SluiceError::Internal("mock action error".into())),
                ActionOutcome::Panic => panic!("mock action panic"),
            }
        })
    }
}

/// In-memory resource whose scans fail on demand.
pub struct FlakyResource {
    inner: MemoryResource,
    failures_left: AtomicU32,
    scans: AtomicU32,
}

impl FlakyResource {
    /// Fail the first `failures` scans.
    pub fn new(namespace: &str, failures: u32) -> Self {
        Self {
            inner: MemoryResource::new(namespace),
            failures_left: AtomicU32::new(failures),
            scans: AtomicU32::new(0),
        }
    }

    /// Fail every scan.
    pub fn broken(namespace: &str) -> Self {
        Self::new(namespace, u32::MAX)
    }

    pub fn put(&self, name: &str, content: &str) -> Result<String> {
        self.inner.put(name, content)
    }

    pub fn scans(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn heal(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }
}

impl ResourceBackend for FlakyResource {
    fn location(&self) -> String {
        self.inner.location()
    }

    fn scan(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            Box::pin(async { Err(SluiceError::Resource("scan failed (injected)".into())) })
        } else {
            self.inner.scan()
        }
    }

    fn read(&self, key: &str) -> BoxFuture<'_, Result<Vec<u8>>> {
        self.inner.read(key)
    }

    fn write(&self, name: &str, content: Vec<u8>) -> BoxFuture<'_, Result<String>> {
        self.inner.write(name, content)
    }

    fn key_for(&self, name: &str) -> String {
        self.inner.key_for(name)
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        self.inner.remove(key)
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(
    pipeline: &Pipeline,
    node: &str,
    state: NodeState,
    timeout: Duration,
) -> bool {
    wait_for(timeout, || pipeline.node_state(node).ok() == Some(state)).await
}

/// Receive events until one matches `predicate`, or give up after `timeout`.
pub async fn next_event(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    timeout: Duration,
    mut predicate: impl FnMut(&PipelineEvent) -> bool,
) -> Option<PipelineEvent> {
    let search = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, search).await.ok().flatten()
}

/// Drain whatever is buffered without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// `(from, to)` transitions of `node`, in order.
pub fn transitions_of(events: &[PipelineEvent], node: &str) -> Vec<(NodeState, NodeState)> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::NodeTransition { node: n, from, to, .. } if n == node => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect()
}

/// Fast monitor settings for tests.
pub fn fast_monitor() -> sluice_core::config::MonitorConfig {
    sluice_core::config::MonitorConfig {
        poll_interval_ms: 10,
        max_retries: 2,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
    }
}

/// Two-store config rooted at `workspace`, in-memory metadata.
pub fn sample_config(workspace: &Path) -> String {
    format!(
        r#"
[pipeline]
name = "haiku-retraining"
workspace = "{}"

[monitor]
poll_interval_ms = 10
max_retries = 3

[metadata]
backend = "memory"

[log]
level = 3

[export]
dir = "ipfsjson"

[[resources]]
name = "haiku_data_store"
path = "haiku"
include = '\.txt$'
max_old = 5

[[resources]]
name = "model_registry"
path = "model_registry"
monitoring = false
trigger_threshold = 0
"#,
        workspace.display()
    )
}

/// Write `contents` to `{dir}/sluice.toml`.
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("sluice.toml");
    std::fs::write(&path, contents).unwrap();
    path
}
