use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::event::EventBus;
use sluice_core::types::{EpochOutcome, NodeState, PipelineEvent};

use crate::node::PipelineNode;

/// Messages between node workers.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    /// A predecessor finished (or skipped) `epoch`.
    Outcome {
        from: usize,
        epoch: u64,
        outcome: EpochOutcome,
    },
    /// A successor, and everything downstream of it, finished `epoch`.
    Settled { from: usize, epoch: u64 },
    /// The node's own monitor exhausted its retry budget.
    Escalate { error: String },
}

enum Verdict {
    Ready,
    Blocked,
    Escalated(String),
}

/// Drives one node through its epochs.
///
/// Epoch `e` ends only after every predecessor reported `e` and every
/// successor settled `e`. The node then resets, moves to `e + 1` and settles
/// `e` upstream, which keeps the whole graph in lockstep.
pub(crate) struct Worker {
    index: usize,
    node: PipelineNode,
    predecessors: Vec<usize>,
    successors: Vec<usize>,
    peers: Arc<Vec<mpsc::UnboundedSender<Signal>>>,
    inbox: mpsc::UnboundedReceiver<Signal>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
    /// Pause between epochs for roots whose readiness never depends on data.
    idle_interval: Duration,
    outcomes: BTreeMap<u64, HashMap<usize, EpochOutcome>>,
    settled: BTreeMap<u64, HashSet<usize>>,
    escalation: Option<String>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        node: PipelineNode,
        predecessors: Vec<usize>,
        successors: Vec<usize>,
        peers: Arc<Vec<mpsc::UnboundedSender<Signal>>>,
        inbox: mpsc::UnboundedReceiver<Signal>,
        event_bus: Arc<EventBus>,
        cancel: CancellationToken,
        idle_interval: Duration,
    ) -> Self {
        Self {
            index,
            node,
            predecessors,
            successors,
            peers,
            inbox,
            event_bus,
            cancel,
            idle_interval,
            outcomes: BTreeMap::new(),
            settled: BTreeMap::new(),
            escalation: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let name = self.node.name().to_string();
        debug!(node = %name, "Worker started");

        loop {
            let epoch = self.node.status().epoch();

            let verdict = match self.await_readiness(epoch).await {
                Some(v) => v,
                None => break,
            };

            let outcome = match verdict {
                Verdict::Ready => self.execute(epoch).await,
                Verdict::Blocked => {
                    info!(node = %name, epoch, "Upstream failed, skipping epoch");
                    self.event_bus.publish(PipelineEvent::NodeBlocked {
                        node: name.clone(),
                        epoch,
                    });
                    EpochOutcome::Skipped
                }
                Verdict::Escalated(message) => {
                    self.fail_waiting(epoch, message);
                    EpochOutcome::Failed
                }
            };

            for &succ in &self.successors {
                self.send(
                    succ,
                    Signal::Outcome {
                        from: self.index,
                        epoch,
                        outcome,
                    },
                );
            }

            if !self.await_settlement(epoch).await {
                break;
            }

            if let Err(e) = self.node.settle() {
                error!(node = %name, epoch, error = %e, "Settle hook failed");
            }
            self.reset();
            self.outcomes.remove(&epoch);
            self.settled.remove(&epoch);

            for &pred in &self.predecessors {
                self.send(
                    pred,
                    Signal::Settled {
                        from: self.index,
                        epoch,
                    },
                );
            }

            if self.predecessors.is_empty() && self.node.is_unconditional() {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_interval) => {}
                    _ = self.cancel.cancelled() => break,
                }
            }
        }

        debug!(node = %name, "Worker stopped");
    }

    fn send(&self, to: usize, signal: Signal) {
        if let Some(peer) = self.peers.get(to) {
            // A closed inbox means that worker already stopped
            let _ = peer.send(signal);
        }
    }

    fn absorb(&mut self, signal: Signal, epoch: u64) {
        match signal {
            Signal::Outcome {
                from,
                epoch: e,
                outcome,
            } => {
                if e < epoch {
                    debug!(node = %self.node.name(), from, stale = e, epoch, "Ignoring stale outcome");
                    return;
                }
                self.outcomes.entry(e).or_default().insert(from, outcome);
            }
            Signal::Settled { from, epoch: e } => {
                self.settled.entry(e).or_default().insert(from);
            }
            Signal::Escalate { error } => {
                self.escalation = Some(error);
            }
        }
    }

    /// All predecessor outcomes for `epoch`, once every one has reported.
    fn reported(&self, epoch: u64) -> Option<Vec<EpochOutcome>> {
        let outcomes = self.outcomes.get(&epoch);
        self.predecessors
            .iter()
            .map(|p| outcomes.and_then(|o| o.get(p).copied()))
            .collect()
    }

    /// Wait in WAITING until the node can run, is blocked, or must fail.
    /// `None` means the pipeline is stopping.
    async fn await_readiness(&mut self, epoch: u64) -> Option<Verdict> {
        loop {
            if let Some(message) = self.escalation.take() {
                return Some(Verdict::Escalated(message));
            }

            if let Some(outcomes) = self.reported(epoch) {
                if outcomes.iter().any(|o| !o.is_success()) {
                    return Some(Verdict::Blocked);
                }
                // Re-read local state on every wake-up, not just the signal
                if self.node.locally_ready() {
                    return Some(Verdict::Ready);
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                signal = self.inbox.recv() => match signal {
                    Some(signal) => self.absorb(signal, epoch),
                    None => return None,
                },
                _ = self.node.changed() => {}
            }
        }
    }

    /// TRIGGERED -> RUNNING -> SUCCEEDED | FAILED. Not interrupted by stop.
    async fn execute(&self, epoch: u64) -> EpochOutcome {
        let name = self.node.name();
        let status = self.node.status();
        if let Err(e) = status
            .transition(NodeState::Triggered)
            .and_then(|_| status.transition(NodeState::Running))
        {
            error!(node = %name, epoch, error = %e, "Could not enter RUNNING");
            return EpochOutcome::Failed;
        }

        info!(node = %name, role = %self.node.role(), epoch, "Node running");
        let failure = match self.node.work(epoch).await {
            Ok(true) => None,
            Ok(false) => Some("work returned failure".to_string()),
            Err(e) => Some(e.to_string()),
        };

        let (next, outcome) = match failure {
            None => (NodeState::Succeeded, EpochOutcome::Succeeded),
            Some(ref message) => {
                warn!(node = %name, epoch, error = %message, "Node failed");
                self.event_bus.publish(PipelineEvent::NodeFailed {
                    node: name.to_string(),
                    epoch,
                    error: message.clone(),
                });
                (NodeState::Failed, EpochOutcome::Failed)
            }
        };
        if let Err(e) = status.transition(next) {
            error!(node = %name, epoch, error = %e, "Could not record outcome");
        }
        outcome
    }

    /// WAITING -> FAILED after the monitor gave up.
    fn fail_waiting(&self, epoch: u64, message: String) {
        let name = self.node.name();
        error!(node = %name, epoch, error = %message, "Node failed while waiting");
        if let Err(e) = self.node.status().transition(NodeState::Failed) {
            error!(node = %name, epoch, error = %e, "Could not record failure");
        }
        self.event_bus.publish(PipelineEvent::NodeFailed {
            node: name.to_string(),
            epoch,
            error: message,
        });
    }

    /// Wait for every successor to settle and every predecessor to report.
    async fn await_settlement(&mut self, epoch: u64) -> bool {
        loop {
            let settled = self
                .settled
                .get(&epoch)
                .map_or(0, |s| self.successors.iter().filter(|i| s.contains(*i)).count());
            if settled == self.successors.len() && self.reported(epoch).is_some() {
                return true;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                signal = self.inbox.recv() => match signal {
                    Some(signal) => self.absorb(signal, epoch),
                    None => return false,
                },
            }
        }
    }

    /// Terminal states go back through IDLE; blocked nodes are still WAITING.
    fn reset(&self) {
        let status = self.node.status();
        if status.state().is_terminal() {
            if let Err(e) = status.transition(NodeState::Idle) {
                error!(node = %self.node.name(), error = %e, "Could not reset node");
                return;
            }
            status.next_epoch();
            if let Err(e) = status.transition(NodeState::Waiting) {
                error!(node = %self.node.name(), error = %e, "Could not re-arm node");
            }
        } else {
            status.next_epoch();
        }
    }
}
