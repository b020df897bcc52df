use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;

use sluice_core::config::{AppConfig, MetadataBackendKind, ResourceConfig};
use sluice_core::error::Result;
use sluice_core::event::EventBus;
use sluice_core::traits::MetadataBackend;
use sluice_core::types::ArtifactTag;
use sluice_engine::trigger::from_threshold;
use sluice_engine::{
    ActionContext, ActionLogic, ActionNode, MetadataNode, NotarizeAction, Pipeline, PipelineNode,
    PipelineOptions, ResourceNode, RetentionPolicy,
};
use sluice_store::{FilesystemResource, InMemoryMetadataStore, SqliteMetadataStore};

use crate::notary::ReceiptDirNotarizer;

pub const RETRAINING: &str = "retraining";
pub const SHAKESPEARE_EVAL: &str = "shakespeare_eval";
pub const HAIKU_EVAL: &str = "haiku_eval";
pub const NOTARIZE: &str = "notarize";

const MODEL_REGISTRY: &str = "model_registry";

/// The built pipeline plus the handles the host reads from.
pub struct Demo {
    pub pipeline: Pipeline,
    pub metadata: Arc<MetadataNode>,
}

/// Stores used when the config declares none.
pub fn default_resources() -> Vec<ResourceConfig> {
    let store = |name: &str, path: &str, monitoring: bool| ResourceConfig {
        name: name.to_string(),
        path: path.to_string(),
        monitoring,
        trigger_threshold: if monitoring { 1 } else { 0 },
        max_old: None,
        delete_evicted: false,
        include: None,
        predecessors: Vec::new(),
    };
    vec![
        store("haiku_data_store", "haiku", true),
        store(MODEL_REGISTRY, "model_registry", false),
        store("plots_store", "plots", false),
    ]
}

/// Configured stores, or the defaults.
pub fn resources(config: &AppConfig) -> Vec<ResourceConfig> {
    if config.resources.is_empty() {
        default_resources()
    } else {
        config.resources.clone()
    }
}

/// Whether building the demo may touch stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Create directories and the database, close runs left open.
    ReadWrite,
    /// Leave disk untouched; a missing database reads as empty.
    ReadOnly,
}

pub fn open_metadata_backend(config: &AppConfig) -> Result<Arc<dyn MetadataBackend>> {
    open_metadata_backend_with(config, Access::ReadWrite)
}

fn open_metadata_backend_with(
    config: &AppConfig,
    access: Access,
) -> Result<Arc<dyn MetadataBackend>> {
    let path = config.resolve(&config.metadata.path);
    Ok(match (config.metadata.backend, access) {
        (MetadataBackendKind::Sqlite, Access::ReadWrite) => {
            Arc::new(SqliteMetadataStore::open(&path)?)
        }
        (MetadataBackendKind::Sqlite, Access::ReadOnly) if path.exists() => {
            Arc::new(SqliteMetadataStore::open_read_only(&path)?)
        }
        _ => Arc::new(InMemoryMetadataStore::new()),
    })
}

pub fn open_resource(config: &AppConfig, res: &ResourceConfig) -> Result<FilesystemResource> {
    open_resource_with(config, res, Access::ReadWrite)
}

fn open_resource_with(
    config: &AppConfig,
    res: &ResourceConfig,
    access: Access,
) -> Result<FilesystemResource> {
    let root = config.resolve(&res.path);
    let backend = match access {
        Access::ReadWrite => FilesystemResource::open(root)?,
        Access::ReadOnly => FilesystemResource::attach(root),
    };
    match res.include {
        Some(ref pattern) => backend.with_include(pattern),
        None => Ok(backend),
    }
}

/// metadata -> stores -> retraining -> {shakespeare, haiku} eval -> notarize
pub fn build(config: &AppConfig) -> Result<Demo> {
    build_with(config, Access::ReadWrite)
}

/// The same graph over stored state as found, for dumps that must not mutate it.
pub fn inspect(config: &AppConfig) -> Result<Demo> {
    build_with(config, Access::ReadOnly)
}

fn build_with(config: &AppConfig, access: Access) -> Result<Demo> {
    let event_bus = Arc::new(EventBus::new(config.pipeline.event_capacity));
    let metadata_name = config.metadata.name.clone();

    let metadata_backend = open_metadata_backend_with(config, access)?;
    let metadata = Arc::new(match access {
        Access::ReadWrite => {
            MetadataNode::new(metadata_name.clone(), metadata_backend, event_bus.clone())?
        }
        Access::ReadOnly => {
            MetadataNode::observe(metadata_name.clone(), metadata_backend, event_bus.clone())
        }
    });

    let mut nodes: Vec<PipelineNode> = vec![metadata.clone().into()];
    let mut stores = Vec::new();
    for res in resources(config) {
        let predecessors = if res.predecessors.is_empty() {
            vec![metadata_name.clone()]
        } else {
            res.predecessors.clone()
        };
        let backend = Arc::new(open_resource_with(config, &res, access)?);
        let node = Arc::new(
            ResourceNode::new(res.name.clone(), backend, event_bus.clone())
                .with_predecessors(predecessors)
                .with_boxed_trigger(from_threshold(res.trigger_threshold))
                .with_retention(RetentionPolicy {
                    max_old: res.max_old,
                    delete_evicted: res.delete_evicted,
                })
                .with_monitoring(res.monitoring),
        );
        nodes.push(node.clone().into());
        stores.push(node);
    }

    let retraining = RetrainingAction {
        data: stores.iter().filter(|s| s.is_monitoring()).cloned().collect(),
        registry: stores.iter().find(|s| s.name() == MODEL_REGISTRY).cloned(),
        metadata: metadata.clone(),
    };
    let store_names: Vec<String> = stores.iter().map(|s| s.name().to_string()).collect();
    nodes.push(
        ActionNode::new(RETRAINING, retraining, event_bus.clone())
            .with_predecessors(store_names)
            .into(),
    );

    for (name, dataset, metric, value) in [
        (SHAKESPEARE_EVAL, "Shakespeare", "shakespeare_test_loss", 1.47),
        (HAIKU_EVAL, "Haiku", "haiku_test_loss", 2.43),
    ] {
        let eval = EvalAction {
            metadata: metadata.clone(),
            dataset,
            metric,
            value,
        };
        nodes.push(
            ActionNode::new(name, eval, event_bus.clone())
                .with_predecessors([RETRAINING])
                .into(),
        );
    }

    let workspace = config.workspace_dir();
    let export_dir = config.resolve(&config.export.clone().unwrap_or_default().dir);
    let notarize = NotarizeAction::new(
        metadata.clone(),
        Arc::new(ReceiptDirNotarizer::new(workspace.join("receipts"))),
    )
    .with_export_dir(export_dir);
    nodes.push(
        ActionNode::new(NOTARIZE, notarize, event_bus.clone())
            .with_predecessors([HAIKU_EVAL, SHAKESPEARE_EVAL])
            .into(),
    );

    let pipeline = Pipeline::build(nodes, event_bus, PipelineOptions::from_config(config))?;
    Ok(Demo { pipeline, metadata })
}

/// Trains on the current batch and registers a model.
struct RetrainingAction {
    data: Vec<Arc<ResourceNode>>,
    registry: Option<Arc<ResourceNode>>,
    metadata: Arc<MetadataNode>,
}

impl RetrainingAction {
    async fn retrain(&self, ctx: &ActionContext) -> Result<bool> {
        ctx.info(format!("Executing node '{}'", ctx.node()));

        let mut trained = Vec::new();
        for store in &self.data {
            for key in store.list_artifacts(ArtifactTag::Current) {
                let content = store.read_artifact(&key).await?;
                ctx.info(format!("Trained on {} ({} bytes)", key, content.len()));
                trained.push(key);
            }
            for key in store.list_artifacts(ArtifactTag::Old) {
                ctx.info(format!("Already trained on {}", key));
            }
        }

        self.metadata.log_metrics([("acc", 1.00)])?;
        self.metadata.log_params([
            ("batch_size", serde_json::json!(64)),
            ("block_size", serde_json::json!(256)),
            ("max_iters", serde_json::json!(2500)),
            ("eval_interval", serde_json::json!(500)),
            ("learning_rate", serde_json::json!(3e-4)),
            ("eval_iters", serde_json::json!(200)),
            ("n_embd", serde_json::json!(384)),
            ("n_head", serde_json::json!(6)),
            ("n_layer", serde_json::json!(6)),
            ("dropout", serde_json::json!(0.2)),
            ("seed", serde_json::json!(1337)),
            ("split", serde_json::json!(0.9)),
        ])?;
        self.metadata.set_tags([("test_name", "Karpathy LLM test")])?;

        if let Some(ref registry) = self.registry {
            let name = format!(
                "model_{}_epoch{}.txt",
                Utc::now().format("%Y%m%d%H%M%S"),
                ctx.epoch()
            );
            let record = registry.save_artifact(&name, trained.join("\n")).await?;
            ctx.info(format!("Saved model {}", record.key));
        }

        ctx.info(format!("Node '{}' executed successfully.", ctx.node()));
        Ok(true)
    }
}

impl ActionLogic for RetrainingAction {
    fn execute<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.retrain(ctx))
    }
}

/// Scores the model on one validation set.
struct EvalAction {
    metadata: Arc<MetadataNode>,
    dataset: &'static str,
    metric: &'static str,
    value: f64,
}

impl ActionLogic for EvalAction {
    fn execute<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            ctx.info(format!("Evaluating LLM on {} validation dataset", self.dataset));
            self.metadata.log_metric(self.metric, self.value)?;
            Ok(true)
        })
    }
}
