use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::event::EventBus;
use sluice_core::types::{LogLevel, PipelineEvent};

use crate::state::StateCell;

/// What an action's logic sees when it runs.
#[derive(Clone)]
pub struct ActionContext {
    node: String,
    epoch: u64,
    event_bus: Arc<EventBus>,
}

impl ActionContext {
    pub fn new(node: impl Into<String>, epoch: u64, event_bus: Arc<EventBus>) -> Self {
        Self {
            node: node.into(),
            epoch,
            event_bus,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Node-scoped log line, sent to both tracing and the event bus.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(node = %self.node, epoch = self.epoch, "{}", message),
            LogLevel::Info => info!(node = %self.node, epoch = self.epoch, "{}", message),
            LogLevel::Warn => warn!(node = %self.node, epoch = self.epoch, "{}", message),
            LogLevel::Error => error!(node = %self.node, epoch = self.epoch, "{}", message),
        }
        self.event_bus.publish(PipelineEvent::NodeLog {
            node: self.node.clone(),
            level,
            message,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
}

/// User logic run by an action node.
///
/// Returning `Ok(false)` or `Err` marks the node FAILED for the epoch.
/// Collaborator nodes are held by the implementation, not passed in.
pub trait ActionLogic: Send + Sync + 'static {
    fn execute<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<bool>>;
}

/// Closure adapter, see [`action_fn`].
pub struct FnAction<F>(F);

/// Use an async closure as action logic.
pub fn action_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    FnAction(f)
}

impl<F, Fut> ActionLogic for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    fn execute<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<bool>> {
        Box::pin((self.0)(ctx.clone()))
    }
}

/// A node running user logic once all predecessors succeeded.
pub struct ActionNode {
    name: String,
    predecessors: Vec<String>,
    logic: Arc<dyn ActionLogic>,
    status: StateCell,
    event_bus: Arc<EventBus>,
}

impl ActionNode {
    pub fn new(name: impl Into<String>, logic: impl ActionLogic, event_bus: Arc<EventBus>) -> Self {
        let name = name.into();
        Self {
            status: StateCell::new(name.clone(), event_bus.clone()),
            name,
            predecessors: Vec::new(),
            logic: Arc::new(logic),
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

    /// Run the logic in its own task so a panic becomes a failure.
    pub(crate) async fn run(&self, epoch: u64) -> Result<bool> {
        let ctx = ActionContext::new(self.name.clone(), epoch, self.event_bus.clone());
        let logic = self.logic.clone();
        let handle = tokio::spawn(async move { logic.execute(&ctx).await });
        match handle.await {
            Ok(result) => result.map_err(|e| match e {
                SluiceError::NodeExecutionFailure { .. } => e,
                other => SluiceError::execution(&self.name, other),
            }),
            Err(join_err) if join_err.is_panic() => Err(SluiceError::execution(
                &self.name,
                format!("action panicked: {}", panic_message(join_err.into_panic())),
            )),
            Err(join_err) => Err(SluiceError::execution(&self.name, join_err)),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::default())
    }

    #[tokio::test]
    async fn test_action_fn_result_passes_through() {
        let node = ActionNode::new("ok", action_fn(|_ctx| async { Ok(true) }), bus());
        assert!(node.run(1).await.unwrap());

        let node = ActionNode::new("no", action_fn(|_ctx| async { Ok(false) }), bus());
        assert!(!node.run(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_error_wrapped_as_execution_failure() {
        let node = ActionNode::new(
            "eval",
            action_fn(|_ctx| async { Err(SluiceError::Resource("disk gone".into())) }),
            bus(),
        );
        let err = node.run(1).await.unwrap_err();
        match err {
            SluiceError::NodeExecutionFailure { node, message } => {
                assert_eq!(node, "eval");
                assert!(message.contains("disk gone"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_caught() {
        let node = ActionNode::new(
            "boom",
            action_fn(|_ctx| async {
                if true {
                    panic!("kaboom");
                }
                Ok(true)
            }),
            bus(),
        );
        let err = node.run(2).await.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_context_logs_to_bus() {
        let bus = bus();
        let mut rx = bus.subscribe();
        let node = ActionNode::new(
            "retraining",
            action_fn(|ctx| async move {
                ctx.info(format!("Executing node '{}' at epoch {}", ctx.node(), ctx.epoch()));
                Ok(true)
            }),
            bus.clone(),
        );
        node.run(7).await.unwrap();
        match rx.recv().await.unwrap() {
            PipelineEvent::NodeLog { node, level, message } => {
                assert_eq!(node, "retraining");
                assert_eq!(level, LogLevel::Info);
                assert_eq!(message, "Executing node 'retraining' at epoch 7");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
