use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context as _;
use chrono::Utc;
use lru::LruCache;
use tokio::fs;
use tokio::sync::Mutex;

use super::{CacheEntry, CacheKey};

/// Filesystem tier: one JSON file per entry under
/// `<root>/<key[0..2]>/<key[2..4]>/<key>.json`. Recency is tracked in an
/// in-memory index seeded from file mtimes, and the oldest entries are
/// removed once `max_entries` is exceeded.
pub struct PersistentCache {
    root: PathBuf,
    max_entries: usize,
    index: Mutex<LruCache<CacheKey, ()>>,
}

impl PersistentCache {
    pub async fn open(root: PathBuf, max_entries: usize) -> anyhow::Result<Self> {
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create cache dir: {}", root.display()))?;

        let mut found = scan(&root).await?;
        found.sort_by_key(|(_, modified)| *modified);

        let mut index = LruCache::unbounded();
        for (key, _) in found {
            index.put(key, ());
        }
        tracing::debug!(root = %root.display(), entries = index.len(), "opened persistent cache");

        let cache = Self {
            root,
            max_entries: max_entries.max(1),
            index: Mutex::new(index),
        };
        cache.enforce_cap().await;
        Ok(cache)
    }

    pub async fn get(&self, key: &CacheKey) -> anyhow::Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let Some(entry) = read_json::<CacheEntry>(&path).await? else {
            self.index.lock().await.pop(key);
            return Ok(None);
        };

        if entry.is_expired(Utc::now()) || entry.key != *key {
            self.remove(key).await;
            return Ok(None);
        }
        self.index.lock().await.put(key.clone(), ());
        Ok(Some(entry))
    }

    pub async fn put(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        write_json_atomic(&self.path_for(&entry.key), entry).await?;
        self.index.lock().await.put(entry.key.clone(), ());
        self.enforce_cap().await;
        Ok(())
    }

    pub async fn clear(&self) -> anyhow::Result<usize> {
        let mut index = self.index.lock().await;
        let n = index.len();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("read cache dir: {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path)
                    .await
                    .with_context(|| format!("remove cache shard: {}", path.display()))?;
            }
        }
        index.clear();
        Ok(n)
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let k = key.as_str();
        self.root
            .join(&k[0..2])
            .join(&k[2..4])
            .join(format!("{k}.json"))
    }

    async fn remove(&self, key: &CacheKey) {
        self.index.lock().await.pop(key);
        let path = self.path_for(key);
        if let Err(err) = fs::remove_file(&path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), %err, "failed to remove cache entry");
        }
    }

    async fn enforce_cap(&self) {
        loop {
            let evicted = {
                let mut index = self.index.lock().await;
                if index.len() <= self.max_entries {
                    break;
                }
                index.pop_lru().map(|(key, ())| key)
            };
            let Some(key) = evicted else { break };
            tracing::debug!(%key, "evicting persistent cache entry");
            self.remove(&key).await;
        }
    }
}

/// Keys of every entry file under `root`, with their modification times.
async fn scan(root: &Path) -> anyhow::Result<Vec<(CacheKey, SystemTime)>> {
    let mut out = Vec::new();
    let mut dirs = vec![(root.to_path_buf(), 0u8)];
    while let Some((dir, depth)) = dirs.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("read cache dir: {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                if depth < 2 {
                    dirs.push((path, depth + 1));
                }
                continue;
            }
            let key = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(CacheKey::parse);
            if let Some(key) = key {
                out.push((key, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
            }
        }
    }
    Ok(out)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read: {}", path.display())),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "ignoring unreadable cache entry");
            Ok(None)
        }
    }
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec(value).context("serialize cache entry")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::Normalization;
    use crate::model::AnalysisResult;

    fn entry(content: &str, ttl: Duration) -> CacheEntry {
        let n = Normalization {
            sample_threshold_chars: 1_000,
            sample_chars: 100,
        };
        let result = AnalysisResult {
            summary: content.to_owned(),
            ..AnalysisResult::default()
        };
        CacheEntry::new(CacheKey::derive(content, "t", "m", &n), result, ttl)
    }

    #[tokio::test]
    async fn writes_sharded_files_and_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path().to_path_buf(), 10)
            .await
            .unwrap();
        let e = entry("page", Duration::from_secs(60));
        cache.put(&e).await.unwrap();

        let k = e.key.as_str();
        let expected = dir
            .path()
            .join(&k[0..2])
            .join(&k[2..4])
            .join(format!("{k}.json"));
        assert!(expected.is_file());
        assert_eq!(cache.get(&e.key).await.unwrap().unwrap().response.summary, "page");
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path().to_path_buf(), 10)
            .await
            .unwrap();
        let e = entry("stale", Duration::ZERO);
        cache.put(&e).await.unwrap();
        assert!(cache.get(&e.key).await.unwrap().is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn cap_evicts_least_recently_used_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path().to_path_buf(), 2)
            .await
            .unwrap();
        let (a, b, c) = (
            entry("a", Duration::from_secs(60)),
            entry("b", Duration::from_secs(60)),
            entry("c", Duration::from_secs(60)),
        );
        cache.put(&a).await.unwrap();
        cache.put(&b).await.unwrap();
        assert!(cache.get(&a.key).await.unwrap().is_some());
        cache.put(&c).await.unwrap();

        assert!(cache.get(&b.key).await.unwrap().is_none());
        assert!(cache.get(&a.key).await.unwrap().is_some());

        let reopened = PersistentCache::open(dir.path().to_path_buf(), 2)
            .await
            .unwrap();
        assert_eq!(reopened.len().await, 2);
        assert!(reopened.get(&c.key).await.unwrap().is_some());
    }
}
