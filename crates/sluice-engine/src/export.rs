use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use sluice_core::error::Result;
use sluice_core::types::{MetricEntry, ParamEntry, RunRecord, TagEntry};

use crate::metadata::MetadataNode;

/// Everything a metadata node has recorded, as flat sequences.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunExport {
    pub runs: Vec<RunRecord>,
    pub metrics: Vec<MetricEntry>,
    pub params: Vec<ParamEntry>,
    pub tags: Vec<TagEntry>,
}

impl RunExport {
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl MetadataNode {
    pub fn export_runs(&self) -> Result<RunExport> {
        Ok(RunExport {
            runs: self.query_runs()?,
            metrics: self.query_metrics(None)?,
            params: self.query_params(None)?,
            tags: self.query_tags(None)?,
        })
    }

    /// Write `runs.json`, `metrics.json`, `params.json` and `tags.json`.
    pub async fn export_to_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let export = self.export_runs()?;
        tokio::fs::create_dir_all(dir).await?;

        let files = [
            ("runs.json", serde_json::to_string_pretty(&export.runs)?),
            ("metrics.json", serde_json::to_string_pretty(&export.metrics)?),
            ("params.json", serde_json::to_string_pretty(&export.params)?),
            ("tags.json", serde_json::to_string_pretty(&export.tags)?),
        ];

        let mut written = Vec::with_capacity(files.len());
        for (file, body) in files {
            let path = dir.join(file);
            tokio::fs::write(&path, body).await?;
            written.push(path);
        }
        info!(node = %self.name(), dir = %dir.display(), runs = export.runs.len(), "Runs exported");
        Ok(written)
    }
}
