use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use tokio::sync::Mutex;

use super::{CacheEntry, CacheKey};
use crate::model::AnalysisResult;

/// Process-local LRU tier; expired entries are dropped on lookup.
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<AnalysisResult> {
        let mut entries = self.entries.lock().await;
        let expired = entries.peek(key)?.is_expired(Utc::now());
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.response.clone())
    }

    pub async fn insert(&self, entry: CacheEntry) {
        if entry.is_expired(Utc::now()) {
            return;
        }
        let mut entries = self.entries.lock().await;
        entries.put(entry.key.clone(), entry);
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let n = entries.len();
        entries.clear();
        n
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
