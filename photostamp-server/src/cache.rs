use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::GeoCoordinate;

/// Entries older than this are treated as absent and purged on read.
pub const CACHE_TTL_HOURS: i64 = 24;

/// Cache-version tag baked into every key so a format change invalidates
/// old entries wholesale.
const CACHE_VERSION: &str = "loc_v6";

/// One resolved location, stamped with its write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(location: String) -> Self {
        Self {
            location,
            timestamp: Utc::now(),
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.timestamp < Duration::hours(CACHE_TTL_HOURS)
    }
}

/// Key for a coordinate rounded to 4 decimal places (~11 m precision).
pub fn cache_key(coordinate: GeoCoordinate) -> String {
    format!(
        "{}_{:.4}_{:.4}",
        CACHE_VERSION, coordinate.latitude, coordinate.longitude
    )
}

/// Injectable key-value storage capability for resolved locations. Entries
/// are advisory: losing them only costs a provider round trip, so
/// implementations log failures instead of propagating them.
pub trait LocationCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn set(&self, key: &str, entry: CacheEntry);
    fn delete(&self, key: &str);
}

/// Read an entry honoring the TTL; stale entries are purged and reported
/// as absent.
pub fn fresh_entry(cache: &dyn LocationCache, key: &str) -> Option<CacheEntry> {
    let entry = cache.get(key)?;
    if entry.is_fresh(Utc::now()) {
        Some(entry)
    } else {
        cache.delete(key);
        None
    }
}

/// Process-local store. Survives across pipeline runs within a session.
#[derive(Default)]
pub struct MemoryCache {
    entries: parking_lot::RwLock<HashMap<String, CacheEntry>>,
}

impl LocationCache for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, entry: CacheEntry) {
        self.entries.write().insert(key.to_string(), entry);
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// On-disk store, one JSON file per key. Keys produced by [`cache_key`]
/// are filesystem-safe by construction.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl LocationCache for FileCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding unreadable cache entry");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn set(&self, key: &str, entry: CacheEntry) {
        let path = self.entry_path(key);
        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    tracing::warn!(key = %key, error = %e, "failed writing cache entry");
                }
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "failed serializing cache entry"),
        }
    }

    fn delete(&self, key: &str) {
        let _ = fs::remove_file(self.entry_path(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(latitude: f64, longitude: f64) -> GeoCoordinate {
        GeoCoordinate {
            latitude,
            longitude,
        }
    }

    #[test]
    fn key_rounds_to_four_decimals() {
        assert_eq!(
            cache_key(coord(35.65861234, 139.74539876)),
            "loc_v6_35.6586_139.7454"
        );
    }

    #[test]
    fn memory_cache_round_trips() {
        let cache = MemoryCache::default();
        let key = cache_key(coord(35.6586, 139.7454));
        cache.set(&key, CacheEntry::new("東京都 港区".into()));
        let entry = fresh_entry(&cache, &key).expect("fresh entry");
        assert_eq!(entry.location, "東京都 港区");
    }

    #[test]
    fn stale_entry_is_purged_on_read() {
        let cache = MemoryCache::default();
        let key = "loc_v6_1.0000_2.0000";
        let stale = CacheEntry {
            location: "old".into(),
            timestamp: Utc::now() - Duration::hours(CACHE_TTL_HOURS + 1),
        };
        cache.set(key, stale);
        assert!(fresh_entry(&cache, key).is_none());
        // Purged, not merely skipped.
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn last_write_wins_per_key() {
        let cache = MemoryCache::default();
        cache.set("k", CacheEntry::new("first".into()));
        cache.set("k", CacheEntry::new("second".into()));
        assert_eq!(cache.get("k").map(|e| e.location).as_deref(), Some("second"));
    }

    #[test]
    fn file_cache_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path()).expect("cache dir");
        let key = cache_key(coord(35.6586, 139.7454));
        cache.set(&key, CacheEntry::new("東京都 港区 東京タワー".into()));
        let entry = fresh_entry(&cache, &key).expect("fresh entry");
        assert_eq!(entry.location, "東京都 港区 東京タワー");
        cache.delete(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn file_cache_tolerates_corrupt_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path()).expect("cache dir");
        std::fs::write(dir.path().join("bad.json"), b"{not json").expect("write");
        assert!(cache.get("bad").is_none());
    }
}
