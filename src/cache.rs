//! Read-through cache of hydrated image aggregates.
//!
//! Entries expire on a sliding window: every hit pushes the expiry out by the
//! configured TTL. Anything that changes an image's relations must evict it.

use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::db::{Database, ImageAggregate};

/// Backing store the cache hydrates misses from.
pub trait ImageStore: Send + Sync {
    /// Load aggregates for `ids`. Order is unspecified; unknown ids are absent.
    fn hydrate(&self, ids: &[i64]) -> Result<Vec<ImageAggregate>>;

    /// Ids of the most recently modified images, newest first.
    fn recently_modified(&self, limit: usize) -> Result<Vec<i64>>;
}

impl ImageStore for Database {
    fn hydrate(&self, ids: &[i64]) -> Result<Vec<ImageAggregate>> {
        self.hydrate_images(ids)
    }

    fn recently_modified(&self, limit: usize) -> Result<Vec<i64>> {
        self.recently_modified_image_ids(limit)
    }
}

struct CacheEntry {
    image: Arc<ImageAggregate>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ImageCache {
    store: Arc<dyn ImageStore>,
    entries: DashMap<i64, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ImageCache {
    pub fn new(store: Arc<dyn ImageStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_cached_image(&self, id: i64) -> Option<Arc<ImageAggregate>> {
        self.get_cached_images(&[id]).into_iter().next()
    }

    /// Aggregates for `ids` in the order requested.
    ///
    /// Misses are hydrated with a single store call. Ids the store does not
    /// know, or that fail to hydrate, are left out of the result.
    pub fn get_cached_images(&self, ids: &[i64]) -> Vec<Arc<ImageAggregate>> {
        let now = Instant::now();

        let mut seen = HashSet::with_capacity(ids.len());
        let mut missing = Vec::new();
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let fresh = self.entries.get(&id).is_some_and(|entry| entry.expires_at > now);
            if !fresh {
                self.entries.remove_if(&id, |_, entry| entry.expires_at <= now);
                missing.push(id);
            }
        }

        let hits = seen.len() - missing.len();
        self.hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);

        let mut hydrated = HashSet::new();
        if !missing.is_empty() {
            match self.store.hydrate(&missing) {
                Ok(aggregates) => {
                    debug!(
                        requested = missing.len(),
                        found = aggregates.len(),
                        "Hydrated images into cache"
                    );
                    for aggregate in aggregates {
                        hydrated.insert(aggregate.id());
                        self.insert(Arc::new(aggregate));
                    }
                }
                Err(e) => {
                    error!(count = missing.len(), error = %e, "Failed to hydrate images");
                }
            }
        }

        let mut result = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.entries.get_mut(&id) {
                Some(mut entry) => {
                    entry.expires_at = Instant::now() + self.ttl;
                    result.push(Arc::clone(&entry.image));
                }
                None if hydrated.contains(&id) => {
                    // Inserted above but evicted concurrently.
                    error!(image_id = id, "Hydrated image missing from cache");
                }
                None => {}
            }
        }
        result
    }

    /// Replace the cached copy with an aggregate the caller already holds.
    pub fn refresh(&self, aggregate: &ImageAggregate) -> Arc<ImageAggregate> {
        let image = Arc::new(aggregate.clone());
        self.insert(Arc::clone(&image));
        image
    }

    pub fn evict(&self, id: i64) {
        if self.entries.remove(&id).is_some() {
            debug!(image_id = id, "Evicted image from cache");
        }
    }

    pub fn evict_many(&self, ids: &[i64]) {
        for id in ids {
            self.evict(*id);
        }
    }

    /// Preload the `count` most recently modified images.
    pub fn warm_up(&self, count: usize) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }
        let start = Instant::now();
        self.prune_expired();
        let ids = self.store.recently_modified(count)?;
        let loaded = self.store.hydrate(&ids)?;
        let loaded_count = loaded.len();
        for aggregate in loaded {
            self.insert(Arc::new(aggregate));
        }
        info!(
            images = loaded_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Warmed image cache"
        );
        Ok(loaded_count)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Pruned expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, image: Arc<ImageAggregate>) {
        self.entries.insert(
            image.id(),
            CacheEntry {
                image,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}
