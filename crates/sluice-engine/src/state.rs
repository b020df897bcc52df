use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use sluice_core::error::{Result, SluiceError};
use sluice_core::event::EventBus;
use sluice_core::types::{NodeState, PipelineEvent};

/// Point-in-time view of a node's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub state: NodeState,
    pub epoch: u64,
    pub last_transition: Option<DateTime<Utc>>,
}

/// A node's state machine. Written only by the node's own worker.
pub struct StateCell {
    node: String,
    inner: Mutex<NodeStatus>,
    event_bus: Arc<EventBus>,
}

impl StateCell {
    pub fn new(node: impl Into<String>, event_bus: Arc<EventBus>) -> Self {
        Self {
            node: node.into(),
            inner: Mutex::new(NodeStatus {
                state: NodeState::Idle,
                epoch: 1,
                last_transition: None,
            }),
            event_bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeStatus> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> NodeStatus {
        *self.lock()
    }

    pub fn state(&self) -> NodeState {
        self.lock().state
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Move to `to`, rejecting transitions the state machine does not allow.
    pub fn transition(&self, to: NodeState) -> Result<()> {
        let (from, epoch, at) = {
            let mut status = self.lock();
            let from = status.state;
            if !from.can_transition_to(to) {
                return Err(SluiceError::InvalidTransition {
                    node: self.node.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            let at = Utc::now();
            status.state = to;
            status.last_transition = Some(at);
            (from, status.epoch, at)
        };

        debug!(node = %self.node, epoch, %from, %to, "Node transition");
        self.event_bus.publish(PipelineEvent::NodeTransition {
            node: self.node.clone(),
            from,
            to,
            epoch,
            at,
        });
        Ok(())
    }

    /// Bump the epoch counter and return the new epoch.
    pub(crate) fn next_epoch(&self) -> u64 {
        let mut status = self.lock();
        status.epoch += 1;
        status.epoch
    }
}
