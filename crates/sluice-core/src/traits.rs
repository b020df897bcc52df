use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Persistence backend for run/metric/param/tag records.
///
/// Calls are synchronous; implementations guard their own connection.
pub trait MetadataBackend: Send + Sync + 'static {
    /// Backend name for logs (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Insert a freshly started run.
    fn insert_run(&self, run: &RunRecord) -> Result<()>;

    /// Set the end time of a run.
    fn close_run(&self, run_id: &RunId, ended_at: DateTime<Utc>) -> Result<()>;

    fn insert_metric(&self, entry: &MetricEntry) -> Result<()>;

    fn insert_param(&self, entry: &ParamEntry) -> Result<()>;

    /// Insert or replace a tag, keyed by (run, name).
    fn upsert_tag(&self, entry: &TagEntry) -> Result<()>;

    /// All runs ordered by start time.
    fn runs(&self) -> Result<Vec<RunRecord>>;

    /// Metrics in insertion order, optionally restricted to one run.
    fn metrics(&self, run_id: Option<&RunId>) -> Result<Vec<MetricEntry>>;

    fn params(&self, run_id: Option<&RunId>) -> Result<Vec<ParamEntry>>;

    fn tags(&self, run_id: Option<&RunId>) -> Result<Vec<TagEntry>>;

    /// Number of metrics already logged under `name` in `run_id`.
    fn metric_count(&self, run_id: &RunId, name: &str) -> Result<u64> {
        Ok(self
            .metrics(Some(run_id))?
            .iter()
            .filter(|m| m.name == name)
            .count() as u64)
    }
}

/// Physical resource watched by a resource node (directory, bucket, table).
pub trait ResourceBackend: Send + Sync + 'static {
    /// Human-readable location (path or URI).
    fn location(&self) -> String;

    /// List every artifact key currently present.
    fn scan(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Read an artifact's content.
    fn read(&self, key: &str) -> BoxFuture<'_, Result<Vec<u8>>>;

    /// Create or overwrite a named blob. Returns the key it is stored under.
    fn write(&self, name: &str, content: Vec<u8>) -> BoxFuture<'_, Result<String>>;

    /// Resolve a blob name to the key `write` would store it under.
    fn key_for(&self, name: &str) -> String;

    /// Delete an artifact's underlying data.
    fn remove(&self, key: &str) -> BoxFuture<'_, Result<()>>;
}

/// Outbound notarization / content-addressing service.
pub trait Notarizer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Submit an opaque payload. Rejections are `Ok` with `accepted = false`.
    fn notarize(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<NotarizeReceipt>>;
}
