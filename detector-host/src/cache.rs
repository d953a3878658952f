//! Concurrent invoker registry
//!
//! Maps detector id to the current [`Invoker`]. A single writer (the source
//! watcher) publishes; request handlers read. Point reads never block behind
//! a slow scan: publication swaps an `Arc` inside a sharded map, so a reader
//! in flight sees either the old invoker or the new one, never a torn value.
//!
//! There is no eviction and no capacity bound; entries live until replaced.
//! A failed load never touches the map, leaving the last good invoker in
//! place.

use std::sync::Arc;

use dashmap::DashMap;
use detector_api::{DetectorRequest, InvokeResult};

use crate::loader::{Invoker, LoadError};

/// Errors surfaced to cache consumers
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Detector not found: {0}")]
    DetectorNotFound(String),

    #[error("Detector invocation failed: {0}")]
    Invocation(#[source] LoadError),
}

/// Thread-safe registry of loaded detectors, cheap to clone and share
#[derive(Clone, Default)]
pub struct InvokerCache {
    inner: Arc<DashMap<String, Arc<Invoker>>>,
}

impl InvokerCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `invoker` as the current value for its id, replacing any
    /// prior value. Safe under concurrent upserts and concurrent reads.
    pub fn upsert(&self, invoker: Invoker) {
        let id = invoker.id().to_string();
        let replaced = self.inner.insert(id.clone(), Arc::new(invoker));
        match replaced {
            Some(_) => tracing::info!(id = %id, "Invoker replaced in cache"),
            None => tracing::info!(id = %id, "Invoker added to cache"),
        }
    }

    /// Non-blocking point read: the most recently completed upsert for `id`
    pub fn get(&self, id: &str) -> Option<Arc<Invoker>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether an invoker is currently published for `id`
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    /// Snapshot enumeration of all current invokers.
    ///
    /// May trail a concurrent upsert; use [`InvokerCache::get`] when a
    /// specific detector is about to be executed.
    pub fn list(&self) -> Vec<Arc<Invoker>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Ids of all currently published detectors
    pub fn ids(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of published invokers
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Execute a detector by id.
    ///
    /// An unknown id maps to [`CacheError::DetectorNotFound`], the
    /// user-visible "detector not available" path.
    pub async fn invoke(
        &self,
        id: &str,
        request: &DetectorRequest,
    ) -> Result<InvokeResult, CacheError> {
        let invoker = self
            .get(id)
            .ok_or_else(|| CacheError::DetectorNotFound(id.to_string()))?;

        invoker.invoke(request).await.map_err(CacheError::Invocation)
    }
}
