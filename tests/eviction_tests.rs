//! Integration tests for capacity enforcement and eviction policies.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use disk_tier::cache::evictor::EvictionPolicy;
use disk_tier::cache::index::SubstituteIndex;
use disk_tier::cache::substitute::{EntryStats, Substitute};
use disk_tier::{Config, DiskCache, Element, StoreListener};

fn config(dir: &TempDir, persistent: bool) -> Config {
    let mut config = Config::in_directory(dir.path());
    config.store.persistent = persistent;
    config.store.expiry_interval_ms = 0;
    config.store.clear_cached_on_flush = false;
    config
}

#[derive(Default)]
struct EvictionLog {
    evicted: Mutex<Vec<String>>,
}

impl StoreListener<String, u64> for EvictionLog {
    fn on_evicted(&self, key: &String) {
        self.evicted.lock().push(key.clone());
    }
}

#[test]
fn test_disk_eviction_prefers_lowest_hit_count() {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<String, u64> = DiskCache::open(config(&dir, false)).unwrap();
    let log = Arc::new(EvictionLog::default());
    cache.store().add_listener(log.clone());

    for (key, hits) in [("five", 5), ("one", 1), ("three", 3)] {
        cache.put(Element::new(key.to_string(), hits).with_hit_count(hits));
    }
    cache.flush().wait().unwrap();
    assert_eq!(cache.disk_resident(), 3);

    cache.store().set_disk_capacity(1);

    assert_eq!(*log.evicted.lock(), vec!["one".to_string(), "three".to_string()]);
    assert_eq!(cache.keys(), vec!["five".to_string()]);
    assert_eq!(cache.disk_resident(), 1);
    assert_eq!(cache.get(&"five".to_string()).unwrap().value, 5);
}

#[test]
fn test_disk_capacity_converges() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, false);
    cfg.store.disk_capacity = 20;
    let cache: DiskCache<u32, Vec<u8>> = DiskCache::open(cfg).unwrap();

    for i in 0..100u32 {
        cache.insert(i, vec![i as u8; 64]);
    }
    cache.flush().wait().unwrap();

    assert_eq!(cache.disk_resident(), 20);
    assert_eq!(cache.len(), 20);
    assert_eq!(cache.regions().len(), 20);
}

#[test]
fn test_memory_capacity_converges() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, true);
    cfg.store.memory_capacity = 10;
    let cache: DiskCache<u32, String> = DiskCache::open(cfg).unwrap();

    for i in 0..100u32 {
        cache.insert(i, format!("value-{i}"));
    }
    cache.flush().wait().unwrap();
    assert!(cache.memory_resident() <= 10);

    for i in 0..100u32 {
        assert_eq!(cache.get(&i).unwrap().value, format!("value-{i}"));
    }
    assert!(cache.memory_resident() <= 10);
    assert_eq!(cache.disk_resident(), 100);

    // Shrinking the capacity takes effect immediately.
    cache.store().set_memory_capacity(8);
    assert!(cache.memory_resident() <= 8);
}

#[test]
fn test_cached_entries_are_not_disk_victims() {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<String, u64> = DiskCache::open(config(&dir, true)).unwrap();

    cache.insert("hot".to_string(), 1);
    cache.insert("cold".to_string(), 2);
    cache.flush().wait().unwrap();

    // Drop the cached copy of one entry only.
    let cold = cache.index().peek(&"cold".to_string()).unwrap();
    if let Substitute::Caching(c) = &cold {
        c.flush();
    }

    cache.store().set_disk_capacity(1);
    assert_eq!(cache.keys(), vec!["hot".to_string()]);
}

/// Evicts the most recently read entry.
#[derive(Debug)]
struct MostRecentlyUsed;

impl EvictionPolicy for MostRecentlyUsed {
    fn name(&self) -> &'static str {
        "MRU"
    }

    fn compare(&self, a: &EntryStats, b: &EntryStats) -> Ordering {
        b.last_accessed_at.cmp(&a.last_accessed_at)
    }
}

fn demoted_after_reads(policy: Option<Arc<dyn EvictionPolicy>>) -> String {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<String, u64> = DiskCache::open(config(&dir, true)).unwrap();
    if let Some(policy) = policy {
        cache.store().set_eviction_policy(policy);
    }

    for key in ["a", "b", "c"] {
        cache.insert(key.to_string(), 0);
    }
    cache.flush().wait().unwrap();
    for key in ["a", "b", "c"] {
        std::thread::sleep(Duration::from_millis(5));
        cache.get(&key.to_string()).unwrap();
    }

    cache.store().set_memory_capacity(2);
    let demoted: Vec<String> = cache
        .keys()
        .into_iter()
        .filter(|k| !cache.index().peek(k).unwrap().is_memory_resident())
        .collect();
    assert_eq!(demoted.len(), 1);
    demoted[0].clone()
}

#[test]
fn test_memory_eviction_uses_configured_policy() {
    assert_eq!(demoted_after_reads(None), "a");
    assert_eq!(demoted_after_reads(Some(Arc::new(MostRecentlyUsed))), "c");
}
