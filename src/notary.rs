use std::path::PathBuf;

use futures::future::BoxFuture;
use tracing::info;

use sluice_core::error::Result;
use sluice_core::traits::Notarizer;
use sluice_core::types::NotarizeReceipt;

/// Local stand-in for a notarization service: files each payload under a
/// receipt id in `dir`.
pub struct ReceiptDirNotarizer {
    dir: PathBuf,
}

impl ReceiptDirNotarizer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Notarizer for ReceiptDirNotarizer {
    fn name(&self) -> &str {
        "receipt-dir"
    }

    fn notarize(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<NotarizeReceipt>> {
        Box::pin(async move {
            if payload.is_empty() {
                return Ok(NotarizeReceipt {
                    accepted: false,
                    receipt_id: None,
                });
            }
            tokio::fs::create_dir_all(&self.dir).await?;
            let receipt_id = uuid::Uuid::new_v4().to_string();
            let path = self.dir.join(format!("{}.json", receipt_id));
            tokio::fs::write(&path, &payload).await?;
            info!(path = %path.display(), bytes = payload.len(), "Payload filed");
            Ok(NotarizeReceipt {
                accepted: true,
                receipt_id: Some(receipt_id),
            })
        })
    }
}
