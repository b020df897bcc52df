use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sluice_core::config::{AppConfig, MonitorConfig};
use sluice_core::error::{Result, SluiceError};
use sluice_core::event::EventBus;
use sluice_core::types::{NodeState, PipelineEvent};

use crate::log::EventLogger;
use crate::monitor::Monitor;
use crate::node::PipelineNode;
use crate::snapshot::{capture_runs, NodeSnapshot, PipelineSnapshot};
use crate::worker::{Signal, Worker};

/// Engine settings that are not part of any node.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub name: String,
    pub monitor: MonitorConfig,
    /// JSONL event log directory; `None` disables the event log.
    pub log_dir: Option<PathBuf>,
    pub log_level: u8,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            monitor: MonitorConfig::default(),
            log_dir: None,
            log_level: 2,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            name: config.pipeline.name.clone(),
            monitor: config.monitor.clone(),
            log_dir: config.log_dir(),
            log_level: config.log.as_ref().map_or(2, |l| l.level),
        }
    }
}

/// A validated DAG of nodes and the workers that drive it.
pub struct Pipeline {
    options: PipelineOptions,
    nodes: Vec<PipelineNode>,
    index: HashMap<String, usize>,
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
    event_bus: Arc<EventBus>,
    peers: Arc<Vec<mpsc::UnboundedSender<Signal>>>,
    inboxes: Mutex<Vec<mpsc::UnboundedReceiver<Signal>>>,
    logger: Mutex<Option<(EventLogger, broadcast::Receiver<PipelineEvent>)>>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    logger_task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Validate the graph and wire up (but do not start) its workers.
    ///
    /// Fails on duplicate names, unknown predecessors, or cycles. Nothing is
    /// spawned until [`Pipeline::start`].
    pub fn build(
        nodes: Vec<PipelineNode>,
        event_bus: Arc<EventBus>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name().to_string(), i).is_some() {
                return Err(SluiceError::DuplicateNodeName(node.name().to_string()));
            }
        }

        let mut predecessors = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut preds: Vec<usize> = Vec::new();
            for pred in node.predecessors() {
                let p = *index.get(pred).ok_or_else(|| SluiceError::UnknownPredecessor {
                    node: node.name().to_string(),
                    predecessor: pred.clone(),
                })?;
                if !preds.contains(&p) {
                    preds.push(p);
                }
            }
            predecessors.push(preds);
        }

        let mut successors = vec![Vec::new(); nodes.len()];
        for (i, preds) in predecessors.iter().enumerate() {
            for &p in preds {
                successors[p].push(i);
            }
        }

        if let Some(cycle) = find_cycle(&successors) {
            return Err(SluiceError::CycleDetected {
                cycle: cycle
                    .into_iter()
                    .map(|i| nodes[i].name().to_string())
                    .collect(),
            });
        }

        let (peers, inboxes): (Vec<_>, Vec<_>) =
            (0..nodes.len()).map(|_| mpsc::unbounded_channel()).unzip();

        let logger = options
            .log_dir
            .as_ref()
            .map(|dir| (EventLogger::new(dir.clone(), options.log_level), event_bus.subscribe()));

        info!(pipeline = %options.name, nodes = nodes.len(), "Pipeline built");
        Ok(Self {
            options,
            nodes,
            index,
            predecessors,
            successors,
            event_bus,
            peers: Arc::new(peers),
            inboxes: Mutex::new(inboxes),
            logger: Mutex::new(logger),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            logger_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    pub fn node(&self, name: &str) -> Option<&PipelineNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_state(&self, name: &str) -> Result<NodeState> {
        self.node(name)
            .map(|n| n.status().state())
            .ok_or_else(|| SluiceError::UnknownNode(name.to_string()))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Arm every node and spawn its worker, plus one monitor per watching
    /// resource node.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SluiceError::AlreadyStarted);
        }

        if let Some((logger, rx)) = lock(&self.logger).take() {
            let pipeline = self.options.name.clone();
            *lock(&self.logger_task) = Some(tokio::spawn(logger.run(rx, pipeline)));
        }

        for node in &self.nodes {
            node.status().transition(NodeState::Waiting)?;
        }

        let inboxes: Vec<_> = lock(&self.inboxes).drain(..).collect();
        let mut tasks = lock(&self.tasks);
        for (i, inbox) in inboxes.into_iter().enumerate() {
            let node = self.nodes[i].clone();

            if let PipelineNode::Resource(ref resource) = node {
                if resource.is_monitoring() {
                    let monitor = Monitor::new(
                        resource.clone(),
                        self.options.monitor.clone(),
                        self.event_bus.clone(),
                        self.peers[i].clone(),
                        self.cancel.clone(),
                    );
                    tasks.push(tokio::spawn(monitor.run()));
                }
            }

            let worker = Worker::new(
                i,
                node,
                self.predecessors[i].clone(),
                self.successors[i].clone(),
                self.peers.clone(),
                inbox,
                self.event_bus.clone(),
                self.cancel.clone(),
                self.options.monitor.poll_interval(),
            );
            tasks.push(tokio::spawn(worker.run()));
        }

        info!(pipeline = %self.options.name, nodes = self.nodes.len(), "Pipeline started");
        self.event_bus.publish(PipelineEvent::PipelineStarted {
            pipeline: self.options.name.clone(),
            nodes: self.nodes.len(),
        });
        Ok(())
    }

    /// Stop all workers and wait for them to exit.
    ///
    /// Work already RUNNING finishes first; waiting nodes and monitors stop
    /// right away. Open runs are closed and the event log is flushed before
    /// this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(pipeline = %self.options.name, error = %e, "Worker task failed");
            }
        }

        // Every worker has exited, so no action can still be logging
        for node in &self.nodes {
            if let Err(e) = node.settle() {
                error!(node = %node.name(), error = %e, "Settle on stop failed");
            }
        }

        info!(pipeline = %self.options.name, "Pipeline stopped");
        self.event_bus.publish(PipelineEvent::PipelineStopped {
            pipeline: self.options.name.clone(),
        });

        let logger = lock(&self.logger_task).take();
        if let Some(handle) = logger {
            if let Err(e) = handle.await {
                warn!(error = %e, "EventLogger task failed");
            }
        }
    }

    /// Current state of every node and every recorded run.
    pub fn snapshot(&self) -> Result<PipelineSnapshot> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        let mut runs = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let successors = self.successors[i]
                .iter()
                .map(|&s| self.nodes[s].name().to_string())
                .collect();
            nodes.push(NodeSnapshot::capture(node, successors));
            if let PipelineNode::Metadata(meta) = node {
                runs.extend(capture_runs(meta)?);
            }
        }
        Ok(PipelineSnapshot {
            pipeline: self.options.name.clone(),
            nodes,
            runs,
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// First cycle found by DFS over `successors`, as node indices closing on
/// the first node (`[a, b, a]`).
fn find_cycle(successors: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: usize,
        successors: &[Vec<usize>],
        color: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        color[node] = Color::Gray;
        stack.push(node);
        for &next in &successors[node] {
            match color[next] {
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(next, successors, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color[node] = Color::Black;
        None
    }

    let mut color = vec![Color::White; successors.len()];
    let mut stack = Vec::new();
    for start in 0..successors.len() {
        if color[start] == Color::White {
            if let Some(cycle) = visit(start, successors, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_cycle_none_for_dag() {
        // 0 -> 1 -> 2, 0 -> 2
        let succ = vec![vec![1, 2], vec![2], vec![]];
        assert!(find_cycle(&succ).is_none());
    }

    #[test]
    fn test_find_cycle_closes_on_first_node() {
        // 0 -> 1 -> 2 -> 1
        let succ = vec![vec![1], vec![2], vec![1]];
        assert_eq!(find_cycle(&succ), Some(vec![1, 2, 1]));
    }

    #[test]
    fn test_find_cycle_self_loop() {
        let succ = vec![vec![0]];
        assert_eq!(find_cycle(&succ), Some(vec![0, 0]));
    }
}
