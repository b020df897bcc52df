pub mod action;
pub mod export;
pub mod ledger;
pub mod log;
pub mod metadata;
mod monitor;
pub mod node;
pub mod notarize;
pub mod pipeline;
pub mod resource;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod trigger;
mod worker;

pub use action::{action_fn, ActionContext, ActionLogic, ActionNode};
pub use export::RunExport;
pub use ledger::{AdvanceReport, ArtifactLedger, RetentionPolicy};
pub use log::EventLogger;
pub use metadata::MetadataNode;
pub use node::PipelineNode;
pub use notarize::{NotarizeAction, RECEIPT_TAG};
pub use pipeline::{Pipeline, PipelineOptions};
pub use resource::{ArtifactCounts, ResourceNode};
pub use snapshot::{NodeSnapshot, PipelineSnapshot, RunSnapshot};
pub use state::{NodeStatus, StateCell};
pub use trigger::{Always, NewArtifactThreshold, TriggerCondition};
