use std::sync::Arc;

use futures::future::BoxFuture;

use sluice_core::error::Result;
use sluice_core::types::NodeRole;

use crate::action::ActionNode;
use crate::metadata::MetadataNode;
use crate::resource::ResourceNode;
use crate::state::StateCell;

/// A vertex in the pipeline graph.
#[derive(Clone)]
pub enum PipelineNode {
    Resource(Arc<ResourceNode>),
    Metadata(Arc<MetadataNode>),
    Action(Arc<ActionNode>),
}

impl PipelineNode {
    pub fn name(&self) -> &str {
        match self {
            PipelineNode::Resource(n) => n.name(),
            PipelineNode::Metadata(n) => n.name(),
            PipelineNode::Action(n) => n.name(),
        }
    }

    pub fn role(&self) -> NodeRole {
        match self {
            PipelineNode::Resource(_) => NodeRole::Resource,
            PipelineNode::Metadata(_) => NodeRole::Metadata,
            PipelineNode::Action(_) => NodeRole::Action,
        }
    }

    /// Declared predecessor names.
    pub fn predecessors(&self) -> &[String] {
        match self {
            PipelineNode::Resource(n) => n.predecessors(),
            PipelineNode::Metadata(n) => n.predecessors(),
            PipelineNode::Action(n) => n.predecessors(),
        }
    }

    pub fn status(&self) -> &StateCell {
        match self {
            PipelineNode::Resource(n) => n.status(),
            PipelineNode::Metadata(n) => n.status(),
            PipelineNode::Action(n) => n.status(),
        }
    }

    /// Local readiness once every predecessor succeeded.
    pub(crate) fn locally_ready(&self) -> bool {
        match self {
            PipelineNode::Resource(n) => n.trigger_condition(),
            PipelineNode::Metadata(_) | PipelineNode::Action(_) => true,
        }
    }

    /// Whether readiness never depends on local data.
    pub(crate) fn is_unconditional(&self) -> bool {
        match self {
            PipelineNode::Resource(n) => n.trigger().is_unconditional(),
            PipelineNode::Metadata(_) | PipelineNode::Action(_) => true,
        }
    }

    /// The node's work for one epoch. `Ok(false)` is a failure.
    pub(crate) async fn work(&self, epoch: u64) -> Result<bool> {
        match self {
            PipelineNode::Resource(n) => n.advance_artifacts().await.map(|_| true),
            PipelineNode::Metadata(n) => n.open_epoch_run(epoch).map(|_| true),
            PipelineNode::Action(n) => n.run(epoch).await,
        }
    }

    /// Runs after every successor settled the epoch.
    pub(crate) fn settle(&self) -> Result<()> {
        match self {
            PipelineNode::Metadata(n) => n.close_epoch_run(),
            PipelineNode::Resource(_) | PipelineNode::Action(_) => Ok(()),
        }
    }

    /// Resolves when local readiness may have changed.
    pub(crate) fn changed(&self) -> BoxFuture<'_, ()> {
        match self {
            PipelineNode::Resource(n) => Box::pin(n.changed()),
            PipelineNode::Metadata(_) | PipelineNode::Action(_) => {
                Box::pin(futures::future::pending())
            }
        }
    }
}

impl From<ResourceNode> for PipelineNode {
    fn from(node: ResourceNode) -> Self {
        PipelineNode::Resource(Arc::new(node))
    }
}

impl From<Arc<ResourceNode>> for PipelineNode {
    fn from(node: Arc<ResourceNode>) -> Self {
        PipelineNode::Resource(node)
    }
}

impl From<MetadataNode> for PipelineNode {
    fn from(node: MetadataNode) -> Self {
        PipelineNode::Metadata(Arc::new(node))
    }
}

impl From<Arc<MetadataNode>> for PipelineNode {
    fn from(node: Arc<MetadataNode>) -> Self {
        PipelineNode::Metadata(node)
    }
}

impl From<ActionNode> for PipelineNode {
    fn from(node: ActionNode) -> Self {
        PipelineNode::Action(Arc::new(node))
    }
}

impl From<Arc<ActionNode>> for PipelineNode {
    fn from(node: Arc<ActionNode>) -> Self {
        PipelineNode::Action(node)
    }
}
