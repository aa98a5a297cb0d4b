//! Cache generations and the origin's cache storage.

use std::time::{SystemTime, UNIX_EPOCH};

use astroyou_net::{HeaderName, HeaderValue, Method, Response, StatusCode};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use url::Url;

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the lookup key).
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a network response for the given request method.
    pub fn from_response(method: &Method, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            url: response.url.clone(),
            method: method.as_str().to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = Response::new(self.url.clone(), status, self.body.clone());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response = response.with_header(name, value);
            }
        }
        response
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Generation ====================

/// One named, versioned cache.
#[derive(Debug, Default)]
pub struct CacheGeneration {
    /// Generation name (the version constant).
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl CacheGeneration {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Exact URL match.
    pub fn match_request(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(url.as_str())
    }

    /// Store an entry under its URL, replacing any previous one.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.url.as_str().to_string(), entry);
    }

    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(url.as_str()).is_some()
    }

    /// Stored URLs, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Stored entries, ordered by URL.
    pub fn entries(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        entries.sort_unstable_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Storage ====================

/// Cache storage for one origin, shared by every agent version.
#[derive(Debug, Default)]
pub struct CacheStorage {
    generations: HashMap<String, CacheGeneration>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a generation, creating it if missing.
    pub fn open(&mut self, name: &str) -> &mut CacheGeneration {
        self.generations
            .entry(name.to_string())
            .or_insert_with(|| CacheGeneration::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&CacheGeneration> {
        self.generations.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.generations.contains_key(name)
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.generations.remove(name).is_some()
    }

    /// Generation names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.generations.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Exact URL match within a single generation.
    pub fn match_in(&self, name: &str, url: &Url) -> Option<&CacheEntry> {
        self.get(name).and_then(|generation| generation.match_request(url))
    }
}
