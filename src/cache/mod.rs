//! Two-tier analysis cache: an LRU memory tier in front of an optional
//! filesystem tier, keyed by a hash of the normalized content.

pub mod memory;
pub mod persistent;
pub mod single_flight;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::model::AnalysisResult;

pub use memory::MemoryCache;
pub use persistent::PersistentCache;
pub use single_flight::SingleFlight;

/// How content is reduced before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalization {
    pub sample_threshold_chars: usize,
    pub sample_chars: usize,
}

impl Normalization {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            sample_threshold_chars: config.sample_threshold_chars,
            sample_chars: config.sample_chars,
        }
    }

    /// Lowercases and collapses whitespace. Content longer than the threshold
    /// keeps only its first and last `sample_chars` characters.
    pub fn apply(&self, content: &str) -> String {
        let collapsed = content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let total = collapsed.chars().count();
        if total <= self.sample_threshold_chars || total <= self.sample_chars * 2 {
            return collapsed;
        }
        let head: String = collapsed.chars().take(self.sample_chars).collect();
        let tail: String = collapsed.chars().skip(total - self.sample_chars).collect();
        format!("{head}\u{0}{total}\u{0}{tail}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(
        content: &str,
        template_id: &str,
        model_id: &str,
        normalization: &Normalization,
    ) -> Self {
        let mut h = Sha256::new();
        h.update(normalization.apply(content).as_bytes());
        h.update(b"\0");
        h.update(template_id.as_bytes());
        h.update(b"\0");
        h.update(model_id.as_bytes());
        Self(hex::encode(h.finalize()))
    }

    /// Accepts only 64-char lowercase hex, so keys are always safe path parts.
    pub fn parse(raw: &str) -> Option<Self> {
        let ok = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        ok.then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: AnalysisResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, response: AnalysisResult, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key,
            response,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct AnalysisCache {
    memory: MemoryCache,
    persistent: Option<PersistentCache>,
    memory_ttl: Duration,
    persistent_ttl: Duration,
    normalization: Normalization,
}

impl AnalysisCache {
    pub async fn open(config: &CacheConfig) -> anyhow::Result<Self> {
        let persistent = match &config.persistent_dir {
            Some(dir) => {
                Some(PersistentCache::open(dir.clone(), config.persistent_max_entries).await?)
            }
            None => None,
        };
        Ok(Self {
            memory: MemoryCache::new(config.memory_max_entries),
            persistent,
            memory_ttl: Duration::from_secs(config.memory_ttl_secs),
            persistent_ttl: Duration::from_secs(config.persistent_ttl_secs),
            normalization: Normalization::from_config(config),
        })
    }

    pub fn key_for(&self, content: &str, template_id: &str, model_id: &str) -> CacheKey {
        CacheKey::derive(content, template_id, model_id, &self.normalization)
    }

    pub fn default_ttl(&self) -> Duration {
        self.persistent_ttl
    }

    pub async fn get(&self, key: &CacheKey) -> Option<AnalysisResult> {
        if let Some(hit) = self.memory.get(key).await {
            tracing::debug!(%key, tier = "memory", "cache hit");
            return Some(hit);
        }

        let persistent = self.persistent.as_ref()?;
        match persistent.get(key).await {
            Ok(Some(entry)) => {
                tracing::debug!(%key, tier = "persistent", "cache hit");
                let promoted = CacheEntry::new(
                    key.clone(),
                    entry.response.clone(),
                    self.memory_ttl_for(&entry),
                );
                self.memory.insert(promoted).await;
                Some(entry.response)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%key, error = %format!("{err:#}"), "persistent cache read failed");
                None
            }
        }
    }

    /// `ttl` bounds the persistent entry; the memory copy never outlives the
    /// memory tier's own TTL.
    pub async fn set(&self, key: &CacheKey, result: &AnalysisResult, ttl: Duration) {
        let memory_ttl = ttl.min(self.memory_ttl);
        self.memory
            .insert(CacheEntry::new(key.clone(), result.clone(), memory_ttl))
            .await;

        if let Some(persistent) = &self.persistent {
            let entry = CacheEntry::new(key.clone(), result.clone(), ttl);
            if let Err(err) = persistent.put(&entry).await {
                tracing::warn!(%key, error = %format!("{err:#}"), "persistent cache write failed");
            }
        }
    }

    /// Clears both tiers, returning how many entries were dropped.
    pub async fn purge(&self) -> anyhow::Result<usize> {
        let mut removed = self.memory.clear().await;
        if let Some(persistent) = &self.persistent {
            removed += persistent.clear().await?;
        }
        Ok(removed)
    }

    fn memory_ttl_for(&self, entry: &CacheEntry) -> Duration {
        let remaining = (entry.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        remaining.min(self.memory_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm() -> Normalization {
        Normalization {
            sample_threshold_chars: 50_000,
            sample_chars: 10_000,
        }
    }

    fn result(summary: &str) -> AnalysisResult {
        AnalysisResult {
            summary: summary.to_owned(),
            key_points: vec!["point".to_owned()],
            ..AnalysisResult::default()
        }
    }

    #[test]
    fn key_ignores_case_and_whitespace() {
        let a = CacheKey::derive("Hello   World\n", "t", "m", &norm());
        let b = CacheKey::derive("hello world", "t", "m", &norm());
        assert_eq!(a, b);
        assert_eq!(a, CacheKey::derive("hello world", "t", "m", &norm()));
        assert_ne!(a, CacheKey::derive("hello world", "t2", "m", &norm()));
        assert_ne!(a, CacheKey::derive("hello world", "t", "m2", &norm()));
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(CacheKey::parse(a.as_str()), Some(a));
    }

    #[test]
    fn long_content_is_sampled() {
        let n = Normalization {
            sample_threshold_chars: 20,
            sample_chars: 3,
        };
        let sampled = n.apply("abcdefghijklmnopqrstuvwxyz");
        assert!(sampled.starts_with("abc"));
        assert!(sampled.ends_with("xyz"));
        assert!(!sampled.contains("m"));

        assert_ne!(
            CacheKey::derive("abcdefghijklmnopqrstuvwxyz", "t", "m", &n),
            CacheKey::derive("abcdefghijklmnopqrstuvwxyzzz", "t", "m", &n)
        );
        assert_eq!(
            CacheKey::derive("abcdefghijklmnopqrstuvwxyz", "t", "m", &n),
            CacheKey::derive("abcdefghijkl0000qrstuvwxyz", "t", "m", &n)
        );
    }

    #[test]
    fn parse_rejects_non_hex_keys() {
        assert!(CacheKey::parse("../etc/passwd").is_none());
        assert!(CacheKey::parse(&"A".repeat(64)).is_none());
    }

    #[tokio::test]
    async fn persistent_hits_are_promoted_and_purge_clears_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            persistent_dir: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let key = CacheKey::derive("content", "t", "m", &norm());

        let first = AnalysisCache::open(&config).await.unwrap();
        first
            .set(&key, &result("cached"), Duration::from_secs(3600))
            .await;

        let second = AnalysisCache::open(&config).await.unwrap();
        assert_eq!(second.memory.len().await, 0);
        assert_eq!(second.get(&key).await.unwrap().summary, "cached");
        assert_eq!(second.memory.len().await, 1);

        assert_eq!(second.purge().await.unwrap(), 2);
        assert!(second.get(&key).await.is_none());
    }
}
