//! Exact-match cache of compiled search text to result sets.
//!
//! The key is the literal compiled query text; two semantically identical
//! but textually different trees miss on purpose. Invalidation is wholesale:
//! any write the owning connection observes clears everything, because a
//! structured search can span arbitrarily many resources.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use hyper::StatusCode;

use crate::dav::multistatus::all_successful;
use crate::dav::types::DavResult;
use crate::error::Result;

struct CacheEntry {
    status: StatusCode,
    results: Vec<DavResult>,
}

#[derive(Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A hit hands back a private copy; callers may mutate or drop it
    /// without affecting the cache or other readers.
    pub fn lookup(&self, key: &str) -> Option<Vec<DavResult>> {
        self.entries().get(key).map(|e| e.results.clone())
    }

    fn store(&self, key: &str, results: &[DavResult]) {
        self.entries().insert(
            key.to_string(),
            CacheEntry {
                status: StatusCode::MULTI_STATUS,
                results: results.to_vec(),
            },
        );
    }

    /// Return the cached results for `key`, or run `fetch` and cache its
    /// outcome. Only a fully-successful result set is stored; a partial
    /// failure is returned to the caller but never cached.
    pub async fn search_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Vec<DavResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<DavResult>>>,
    {
        if let Some(hit) = self.lookup(key) {
            tracing::trace!(key, "search cache hit");
            return Ok(hit);
        }
        let results = fetch().await?;
        if all_successful(&results) {
            self.store(key, &results);
        }
        Ok(results)
    }

    pub fn status_of(&self, key: &str) -> Option<StatusCode> {
        self.entries().get(key).map(|e| e.status)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Called before the next search by every mutating
    /// operation and by applied change notifications.
    pub fn clear(&self) {
        self.entries().clear();
    }
}
