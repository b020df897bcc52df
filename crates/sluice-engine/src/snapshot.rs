use chrono::{DateTime, Utc};
use serde::Serialize;

use sluice_core::error::Result;
use sluice_core::types::{MetricEntry, NodeRole, NodeState, ParamEntry, RunRecord, TagEntry};

use crate::metadata::MetadataNode;
use crate::node::PipelineNode;
use crate::resource::ArtifactCounts;

/// Read-only view of a pipeline for dashboards and exports.
///
/// Carries no timestamp of its own, so two snapshots taken with no state
/// change in between compare equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub pipeline: String,
    pub nodes: Vec<NodeSnapshot>,
    pub runs: Vec<RunSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub role: NodeRole,
    pub state: NodeState,
    pub epoch: u64,
    pub last_transition: Option<DateTime<Utc>>,
    pub predecessors: Vec<String>,
    pub successors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    /// Metadata node that owns the run.
    pub store: String,
    #[serde(flatten)]
    pub run: RunRecord,
    pub metrics: Vec<MetricEntry>,
    pub params: Vec<ParamEntry>,
    pub tags: Vec<TagEntry>,
}

impl NodeSnapshot {
    pub(crate) fn capture(node: &PipelineNode, successors: Vec<String>) -> Self {
        let status = node.status().status();
        let artifacts = match node {
            PipelineNode::Resource(r) => Some(r.artifact_counts()),
            _ => None,
        };
        Self {
            name: node.name().to_string(),
            role: node.role(),
            state: status.state,
            epoch: status.epoch,
            last_transition: status.last_transition,
            predecessors: node.predecessors().to_vec(),
            successors,
            artifacts,
        }
    }
}

/// Every run of `store`, each with its own entries.
pub(crate) fn capture_runs(store: &MetadataNode) -> Result<Vec<RunSnapshot>> {
    let metrics = store.query_metrics(None)?;
    let params = store.query_params(None)?;
    let tags = store.query_tags(None)?;

    Ok(store
        .query_runs()?
        .into_iter()
        .map(|run| RunSnapshot {
            store: store.name().to_string(),
            metrics: metrics.iter().filter(|m| m.run_id == run.run_id).cloned().collect(),
            params: params.iter().filter(|p| p.run_id == run.run_id).cloned().collect(),
            tags: tags.iter().filter(|t| t.run_id == run.run_id).cloned().collect(),
            run,
        })
        .collect())
}
