use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SluiceError;

/// Lifecycle state of a pipeline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Idle,
    Waiting,
    Triggered,
    Running,
    Succeeded,
    Failed,
}

impl NodeState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `Waiting -> Failed` is reserved for resource nodes whose monitor loop
    /// exhausted its retry budget.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Idle, Waiting)
                | (Waiting, Triggered)
                | (Waiting, Failed)
                | (Triggered, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Idle)
                | (Failed, Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Failed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Idle => "IDLE",
            NodeState::Waiting => "WAITING",
            NodeState::Triggered => "TRIGGERED",
            NodeState::Running => "RUNNING",
            NodeState::Succeeded => "SUCCEEDED",
            NodeState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Role a node plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Resource,
    Metadata,
    Action,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Resource => "resource",
            NodeRole::Metadata => "metadata",
            NodeRole::Action => "action",
        };
        f.write_str(s)
    }
}

/// What a node reports to its successors at the end of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochOutcome {
    Succeeded,
    Failed,
    /// The node never ran because an upstream node failed.
    Skipped,
}

impl EpochOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, EpochOutcome::Succeeded)
    }
}

/// Lifecycle tag of an artifact. Ordered: `New < Current < Old`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactTag {
    New,
    Current,
    Old,
}

impl ArtifactTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactTag::New => "new",
            ArtifactTag::Current => "current",
            ArtifactTag::Old => "old",
        }
    }
}

impl fmt::Display for ArtifactTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactTag {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ArtifactTag::New),
            "current" => Ok(ArtifactTag::Current),
            "old" => Ok(ArtifactTag::Old),
            other => Err(SluiceError::Config(format!("unknown artifact tag: {}", other))),
        }
    }
}

/// One ledger entry. Only `tag` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub key: String,
    pub tag: ArtifactTag,
    pub created_at: DateTime<Utc>,
    /// Owning resource node.
    pub owner: String,
    /// Insertion order, breaks `created_at` ties.
    pub seq: u64,
}

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A run tracked by a metadata node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Pipeline epoch that opened the run (0 when opened outside the engine).
    pub epoch: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub run_id: RunId,
    pub name: String,
    pub value: f64,
    /// 0-based count of earlier entries with the same name in this run.
    pub step: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub run_id: RunId,
    pub name: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagEntry {
    pub run_id: RunId,
    pub name: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Result of handing a payload to a notarization service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotarizeReceipt {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
}

/// Severity of a node-scoped log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events published on the pipeline event bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Workers spawned.
    PipelineStarted { pipeline: String, nodes: usize },
    /// All workers exited.
    PipelineStopped { pipeline: String },
    /// A node changed state.
    NodeTransition {
        node: String,
        from: NodeState,
        to: NodeState,
        epoch: u64,
        at: DateTime<Utc>,
    },
    /// A node could not run this epoch because upstream failed.
    NodeBlocked { node: String, epoch: u64 },
    /// A node's work function failed.
    NodeFailed {
        node: String,
        epoch: u64,
        error: String,
    },
    /// New ledger entry.
    ArtifactRecorded {
        node: String,
        key: String,
        tag: ArtifactTag,
    },
    /// Ledger advanced after a trigger.
    ArtifactsAdvanced {
        node: String,
        promoted: usize,
        retired: usize,
        evicted: usize,
    },
    /// Transient monitor error, will retry.
    MonitorRetry {
        node: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    RunStarted { node: String, run_id: RunId },
    RunEnded { node: String, run_id: RunId },
    /// Log line emitted by action logic.
    NodeLog {
        node: String,
        level: LogLevel,
        message: String,
    },
}
