//! Search indexing sink. The orchestrator reports every completed upload here on a
//! best-effort basis; nothing a sink does can change the outcome of a write.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub container: String,
    pub path: String,
    pub file_name: String,
    pub last_modified: DateTime<Utc>,
    pub created_by: String,
    pub size: u64,
}

pub trait IndexSink: Send + Sync {
    fn add_or_update(&self, record: IndexRecord) -> Result<()>;

    /// 1-based `page`. Returns (total matches, records on the page).
    fn search(&self, query: &str, page: usize, page_size: usize) -> Result<(usize, Vec<IndexRecord>)>;
}

/// Accepts everything, finds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndex;

impl IndexSink for NoopIndex {
    fn add_or_update(&self, _record: IndexRecord) -> Result<()> {
        Ok(())
    }

    fn search(&self, _query: &str, _page: usize, _page_size: usize) -> Result<(usize, Vec<IndexRecord>)> {
        Ok((0, Vec::new()))
    }
}

/// Process-local index keyed by (container, path). Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    records: RwLock<HashMap<(String, String), IndexRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

fn matches(record: &IndexRecord, needle: &str) -> bool {
    needle.is_empty()
        || record.container.to_lowercase().contains(needle)
        || record.path.to_lowercase().contains(needle)
        || record.file_name.to_lowercase().contains(needle)
}

impl IndexSink for MemoryIndex {
    fn add_or_update(&self, record: IndexRecord) -> Result<()> {
        let key = (record.container.clone(), record.path.clone());
        self.records.write().insert(key, record);
        Ok(())
    }

    fn search(&self, query: &str, page: usize, page_size: usize) -> Result<(usize, Vec<IndexRecord>)> {
        let needle = query.trim().to_lowercase();
        let mut hits: Vec<IndexRecord> = self
            .records
            .read()
            .values()
            .filter(|r| matches(r, &needle))
            .cloned()
            .collect();
        // Newest first; ties broken by location so paging is stable.
        hits.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.container.cmp(&b.container))
                .then_with(|| a.path.cmp(&b.path))
        });
        let total = hits.len();
        let page_size = page_size.max(1);
        let skip = page.max(1).saturating_sub(1).saturating_mul(page_size);
        let items = hits.into_iter().skip(skip).take(page_size).collect();
        Ok((total, items))
    }
}
