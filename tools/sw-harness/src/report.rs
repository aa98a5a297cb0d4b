//! Precache reports.
//!
//! Summarises what an install stored, so a deploy can be checked against
//! the live origin before the new version ships.

use std::path::Path;

use astroyou_sw::{CacheStorage, ServiceWorkerId};
use serde::{Deserialize, Serialize};

/// One stored manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub url: String,
    pub status: u16,
    pub bytes: usize,
    pub content_type: Option<String>,
}

/// Result of a precache run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheReport {
    pub worker: Option<ServiceWorkerId>,
    pub cache: String,
    pub generations: Vec<String>,
    pub entries: Vec<StoredEntry>,
    pub error: Option<String>,
}

impl PrecacheReport {
    /// Describe the contents of `cache` in `storage`.
    pub fn collect(storage: &CacheStorage, cache: &str) -> Self {
        let entries = storage
            .get(cache)
            .map(|generation| {
                generation
                    .entries()
                    .into_iter()
                    .map(|entry| StoredEntry {
                        url: entry.url.to_string(),
                        status: entry.status,
                        bytes: entry.body.len(),
                        content_type: entry
                            .headers
                            .iter()
                            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                            .map(|(_, value)| value.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            worker: None,
            cache: cache.to_string(),
            generations: storage.keys(),
            entries,
            error: None,
        }
    }

    pub fn with_worker(mut self, worker: ServiceWorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.bytes).sum()
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("Cache generation: {}", self.cache);
        for entry in &self.entries {
            println!("  {:<48} {} {:>8} bytes", entry.url, entry.status, entry.bytes);
        }
        match &self.error {
            Some(error) => println!("Install failed: {error}"),
            None => println!(
                "Stored {} entries ({} bytes)",
                self.entries.len(),
                self.total_bytes()
            ),
        }
    }
}
