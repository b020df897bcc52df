use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{MetadataBackend, ResourceBackend};
use sluice_core::types::{MetricEntry, ParamEntry, RunId, RunRecord, TagEntry};

#[derive(Default)]
struct Tables {
    runs: Vec<RunRecord>,
    metrics: Vec<MetricEntry>,
    params: Vec<ParamEntry>,
    tags: Vec<TagEntry>,
}

/// Volatile metadata backend, for tests and throwaway pipelines.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: Mutex<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| SluiceError::Database(e.to_string()))
    }
}

fn matches_run(entry_run: &RunId, filter: Option<&RunId>) -> bool {
    filter.map_or(true, |r| r == entry_run)
}

impl MetadataBackend for InMemoryMetadataStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let mut t = self.lock()?;
        if t.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(SluiceError::Database(format!("duplicate run: {}", run.run_id)));
        }
        t.runs.push(run.clone());
        Ok(())
    }

    fn close_run(&self, run_id: &RunId, ended_at: DateTime<Utc>) -> Result<()> {
        let mut t = self.lock()?;
        let run = t
            .runs
            .iter_mut()
            .find(|r| &r.run_id == run_id)
            .ok_or_else(|| SluiceError::Database(format!("unknown run: {}", run_id)))?;
        run.ended_at = Some(ended_at);
        Ok(())
    }

    fn insert_metric(&self, entry: &MetricEntry) -> Result<()> {
        self.lock()?.metrics.push(entry.clone());
        Ok(())
    }

    fn insert_param(&self, entry: &ParamEntry) -> Result<()> {
        self.lock()?.params.push(entry.clone());
        Ok(())
    }

    fn upsert_tag(&self, entry: &TagEntry) -> Result<()> {
        let mut t = self.lock()?;
        match t
            .tags
            .iter_mut()
            .find(|tag| tag.run_id == entry.run_id && tag.name == entry.name)
        {
            Some(existing) => {
                existing.value = entry.value.clone();
                existing.updated_at = entry.updated_at;
            }
            None => t.tags.push(entry.clone()),
        }
        Ok(())
    }

    fn runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.lock()?.runs.clone())
    }

    fn metrics(&self, run_id: Option<&RunId>) -> Result<Vec<MetricEntry>> {
        Ok(self
            .lock()?
            .metrics
            .iter()
            .filter(|m| matches_run(&m.run_id, run_id))
            .cloned()
            .collect())
    }

    fn params(&self, run_id: Option<&RunId>) -> Result<Vec<ParamEntry>> {
        Ok(self
            .lock()?
            .params
            .iter()
            .filter(|p| matches_run(&p.run_id, run_id))
            .cloned()
            .collect())
    }

    fn tags(&self, run_id: Option<&RunId>) -> Result<Vec<TagEntry>> {
        Ok(self
            .lock()?
            .tags
            .iter()
            .filter(|t| matches_run(&t.run_id, run_id))
            .cloned()
            .collect())
    }
}

/// Resource held in a map. Keys are `mem://{namespace}/{name}`.
pub struct MemoryResource {
    namespace: String,
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryResource {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            blobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Drop a blob in from outside, as an external producer would.
    pub fn put(&self, name: &str, content: impl Into<Vec<u8>>) -> Result<String> {
        let key = self.key_for(name);
        self.lock()?.insert(key.clone(), content.into());
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|e| SluiceError::Resource(e.to_string()))
    }
}

impl ResourceBackend for MemoryResource {
    fn location(&self) -> String {
        format!("mem://{}", self.namespace)
    }

    fn scan(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move { Ok(self.lock()?.keys().cloned().collect()) })
    }

    fn read(&self, key: &str) -> BoxFuture<'_, Result<Vec<u8>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.lock()?
                .get(&key)
                .cloned()
                .ok_or_else(|| SluiceError::Resource(format!("no such artifact: {}", key)))
        })
    }

    fn write(&self, name: &str, content: Vec<u8>) -> BoxFuture<'_, Result<String>> {
        let name = name.to_string();
        Box::pin(async move { self.put(&name, content) })
    }

    fn key_for(&self, name: &str) -> String {
        format!("mem://{}/{}", self.namespace, name)
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.lock()?.remove(&key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_rejects_duplicate_run() {
        let store = InMemoryMetadataStore::new();
        let run = RunRecord {
            run_id: RunId::from_string("r"),
            epoch: 1,
            started_at: Utc::now(),
            ended_at: None,
        };
        store.insert_run(&run).unwrap();
        assert!(store.insert_run(&run).is_err());
    }

    #[test]
    fn test_memory_store_tag_upsert() {
        let store = InMemoryMetadataStore::new();
        let rid = RunId::from_string("r");
        for v in ["a", "b"] {
            store
                .upsert_tag(&TagEntry {
                    run_id: rid.clone(),
                    name: "k".into(),
                    value: v.into(),
                    updated_at: Utc::now(),
                })
                .unwrap();
        }
        let tags = store.tags(None).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].value, "b");
    }

    #[tokio::test]
    async fn test_memory_resource_write_scan_read_remove() {
        let res = MemoryResource::new("plots");
        let key = res.write("loss.png", b"png".to_vec()).await.unwrap();
        assert_eq!(key, "mem://plots/loss.png");
        assert_eq!(res.scan().await.unwrap(), vec![key.clone()]);
        assert_eq!(res.read(&key).await.unwrap(), b"png");
        res.remove(&key).await.unwrap();
        assert!(res.is_empty());
        assert!(res.read(&key).await.is_err());
    }
}
