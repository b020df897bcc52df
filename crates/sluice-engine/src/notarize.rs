use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::Notarizer;

use crate::action::{ActionContext, ActionLogic};
use crate::metadata::MetadataNode;

/// Tag set on the active run with the notarizer's receipt.
pub const RECEIPT_TAG: &str = "notarize_receipt";

/// Stock action: export the metadata node's runs and hand them to a
/// [`Notarizer`]. The node succeeds iff the notarizer accepts.
pub struct NotarizeAction {
    metadata: Arc<MetadataNode>,
    notarizer: Arc<dyn Notarizer>,
    export_dir: Option<PathBuf>,
}

impl NotarizeAction {
    pub fn new(metadata: Arc<MetadataNode>, notarizer: Arc<dyn Notarizer>) -> Self {
        Self {
            metadata,
            notarizer,
            export_dir: None,
        }
    }

    /// Also keep the exported JSON files under `dir`.
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    async fn notarize(&self, ctx: &ActionContext) -> Result<bool> {
        if let Some(ref dir) = self.export_dir {
            self.metadata.export_to_dir(dir).await?;
        }
        let payload = self.metadata.export_runs()?.to_json_pretty()?.into_bytes();
        let size = payload.len();

        let receipt = self
            .notarizer
            .notarize(payload)
            .await
            .map_err(|e| SluiceError::Notarize(format!("{}: {}", self.notarizer.name(), e)))?;

        if !receipt.accepted {
            ctx.warn(format!("{} rejected the {} byte run export", self.notarizer.name(), size));
            return Ok(false);
        }

        match receipt.receipt_id {
            Some(ref id) => {
                ctx.info(format!("Run export notarized by {}: {}", self.notarizer.name(), id));
                match self.metadata.set_tag(RECEIPT_TAG, id.clone()) {
                    Ok(_) | Err(SluiceError::NoActiveRun(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            None => ctx.info(format!("Run export notarized by {}", self.notarizer.name())),
        }
        Ok(true)
    }
}

impl ActionLogic for NotarizeAction {
    fn execute<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.notarize(ctx))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sluice_core::event::EventBus;
    use sluice_core::types::NotarizeReceipt;
    use sluice_store::InMemoryMetadataStore;

    use super::*;

    struct StubNotarizer {
        accept: bool,
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl Notarizer for StubNotarizer {
        fn name(&self) -> &str {
            "stub"
        }

        fn notarize(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<NotarizeReceipt>> {
            self.payloads.lock().unwrap().push(payload);
            let accepted = self.accept;
            Box::pin(async move {
                Ok(NotarizeReceipt {
                    accepted,
                    receipt_id: accepted.then(|| "receipt-1".to_string()),
                })
            })
        }
    }

    fn setup(accept: bool) -> (Arc<MetadataNode>, Arc<StubNotarizer>, ActionContext) {
        let bus = Arc::new(EventBus::default());
        let meta = Arc::new(
            MetadataNode::new("metadata_store", Arc::new(InMemoryMetadataStore::new()), bus.clone())
                .unwrap(),
        );
        let stub = Arc::new(StubNotarizer {
            accept,
            payloads: Mutex::new(Vec::new()),
        });
        (meta, stub, ActionContext::new("notarize", 1, bus))
    }

    #[tokio::test]
    async fn test_accepted_receipt_tagged_on_run() {
        let (meta, stub, ctx) = setup(true);
        let run = meta.start_run().unwrap();
        meta.log_metric("haiku_test_loss", 2.43).unwrap();

        let action = NotarizeAction::new(meta.clone(), stub.clone());
        assert!(action.execute(&ctx).await.unwrap());

        let payloads = stub.payloads.lock().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(json["metrics"][0]["name"], "haiku_test_loss");

        let tags = meta.query_tags(Some(&run)).unwrap();
        assert_eq!(tags[0].name, RECEIPT_TAG);
        assert_eq!(tags[0].value, "receipt-1");
    }

    #[tokio::test]
    async fn test_rejection_is_failure() {
        let (meta, stub, ctx) = setup(false);
        let action = NotarizeAction::new(meta, stub);
        assert!(!action.execute(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_export_dir_written() {
        let (meta, stub, ctx) = setup(true);
        let dir = tempfile::tempdir().unwrap();
        let action = NotarizeAction::new(meta, stub).with_export_dir(dir.path().join("exports"));
        assert!(action.execute(&ctx).await.unwrap());
        assert!(dir.path().join("exports/runs.json").exists());
    }
}
