//! Integration tests for concurrent use, expiry and failure handling.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::ser::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use tempfile::TempDir;

use disk_tier::cache::index::SubstituteIndex;
use disk_tier::{Config, DiskCache, DiskStoreError, Element, StoreListener};

fn config(dir: &TempDir) -> Config {
    let mut config = Config::in_directory(dir.path());
    config.store.expiry_interval_ms = 0;
    config.store.stripes = 4;
    config
}

fn value_for(key: u32, generation: u32) -> String {
    format!("{key}:{generation}:{}", "x".repeat((key % 17) as usize * 10))
}

#[test]
fn test_concurrent_free_and_reallocate_never_overlaps() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.store.persistent = false;
    let cache = Arc::new(DiskCache::<u32, String>::open(cfg).unwrap());

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for round in 0..200u32 {
                    let key = (round * 7 + t) % 64;
                    match round % 3 {
                        0 | 1 => cache.insert(key, value_for(key, round)),
                        _ => {
                            cache.remove(&key);
                        }
                    }
                    if round % 5 == 0 {
                        let _ = cache.get(&key);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    cache.flush().wait().unwrap();

    let mut regions: Vec<_> = cache.regions().into_iter().map(|(_, r)| r).collect();
    regions.sort();
    for pair in regions.windows(2) {
        assert!(
            !pair[0].overlaps(&pair[1]),
            "{} overlaps {}",
            pair[0],
            pair[1]
        );
    }
    let max_end = regions.iter().map(|r| r.end).max().unwrap_or(0);
    assert!(cache.store().data_extent() >= max_end);
    assert_eq!(regions.len(), cache.disk_resident());
}

#[test]
fn test_reads_see_whole_values_or_nothing() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.store.memory_capacity = 8;
    cfg.store.disk_capacity = 40;
    let cache = Arc::new(DiskCache::<u32, String>::open(cfg).unwrap());

    let writers: Vec<_> = (0..2u32)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for generation in 0..100u32 {
                    let key = (generation + t * 50) % 100;
                    cache.insert(key, value_for(key, generation));
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..2u32)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for round in 0..500u32 {
                    let key = round % 100;
                    if let Some(element) = cache.get(&key) {
                        assert_eq!(element.key, key);
                        let prefix = format!("{key}:");
                        assert!(element.value.starts_with(&prefix), "{}", element.value);
                    }
                }
            })
        })
        .collect();
    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }
    cache.flush().wait().unwrap();

    assert!(cache.disk_resident() <= 40);
    for key in cache.keys() {
        let element = cache.get(&key).unwrap();
        assert!(element.value.starts_with(&format!("{key}:")));
    }
}

#[derive(Default)]
struct Events {
    expired: Mutex<Vec<(String, u64)>>,
    failed: Mutex<Vec<String>>,
}

impl<V: Clone + Into<u64>> StoreListener<String, V> for Events {
    fn on_expired(&self, element: &Element<String, V>) {
        self.expired
            .lock()
            .push((element.key.clone(), element.value.clone().into()));
    }

    fn on_write_failure(&self, key: &String, _error: &DiskStoreError) {
        self.failed.lock().push(key.clone());
    }
}

#[test]
fn test_expiry_sweep_notifies_listeners() {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<String, u32> = DiskCache::open(config(&dir)).unwrap();
    let events = Arc::new(Events::default());
    cache.store().add_listener(events.clone());

    cache.put(Element::new("short".to_string(), 1).with_ttl(Duration::from_millis(1)));
    cache.put(Element::new("long".to_string(), 2).with_ttl(Duration::from_secs(3600)));
    cache.insert("forever".to_string(), 3);
    cache.flush().wait().unwrap();
    thread::sleep(Duration::from_millis(10));

    assert_eq!(cache.expire(), 1);
    assert_eq!(*events.expired.lock(), vec![("short".to_string(), 1)]);

    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, vec!["forever".to_string(), "long".to_string()]);
    assert_eq!(cache.disk_resident(), 2);

    // Nothing left to expire.
    assert_eq!(cache.expire(), 0);
    assert_eq!(events.expired.lock().len(), 1);
}

#[test]
fn test_background_sweep_runs_on_worker() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.store.expiry_interval_ms = 20;
    let cache: DiskCache<String, u32> = DiskCache::open(cfg).unwrap();
    let events = Arc::new(Events::default());
    cache.store().add_listener(events.clone());

    cache.put(Element::new("short".to_string(), 7).with_ttl(Duration::from_millis(1)));
    cache.flush().wait().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while events.expired.lock().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*events.expired.lock(), vec![("short".to_string(), 7)]);
    assert!(cache.is_empty());
}

/// A value whose serialization always fails.
#[derive(Clone, Debug, Deserialize)]
struct Unwritable(u32);

impl Serialize for Unwritable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("handle cannot be serialized"))
    }
}

impl From<Unwritable> for u64 {
    fn from(value: Unwritable) -> u64 {
        value.0 as u64
    }
}

#[test]
fn test_write_failure_evicts_entry() {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<String, Unwritable> = DiskCache::open(config(&dir)).unwrap();
    let events = Arc::new(Events::default());
    cache.store().add_listener(events.clone());

    cache.insert("bad".to_string(), Unwritable(1));
    cache.flush().wait().unwrap();

    assert!(cache.get(&"bad".to_string()).is_none());
    assert!(cache.is_empty());
    assert_eq!(cache.memory_resident(), 0);
    assert_eq!(cache.disk_resident(), 0);
    assert_eq!(*events.failed.lock(), vec!["bad".to_string()]);

    // The worker keeps going.
    let text = cache.store().render_metrics().unwrap();
    assert!(text.contains("disk_tier_write_failures_total{store=\"cache\"} 1"));
}

#[test]
fn test_value_stays_reachable_while_write_is_pending() {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<u32, String> = DiskCache::open(config(&dir)).unwrap();

    for key in 0..200u32 {
        cache.insert(key, value_for(key, 0));
        assert_eq!(cache.get(&key).unwrap().value, value_for(key, 0));
    }
    cache.flush().wait().unwrap();
    for key in 0..200u32 {
        let substitute = cache.index().peek(&key).unwrap();
        assert!(!substitute.is_placeholder());
    }
}

/// Rendezvous used to hold the worker inside a value's serialization.
#[derive(Debug)]
struct Gate {
    entered: Barrier,
    release: Barrier,
}

#[derive(Clone, Debug, Deserialize)]
struct Gated {
    value: u32,
    #[serde(skip)]
    gate: Option<Arc<Gate>>,
}

impl Serialize for Gated {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(gate) = &self.gate {
            gate.entered.wait();
            gate.release.wait();
        }
        let mut state = serializer.serialize_struct("Gated", 1)?;
        state.serialize_field("value", &self.value)?;
        state.end()
    }
}

#[test]
fn test_entry_removed_during_write_releases_region() {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<String, Gated> = DiskCache::open(config(&dir)).unwrap();
    let gate = Arc::new(Gate {
        entered: Barrier::new(2),
        release: Barrier::new(2),
    });

    let key = "racy".to_string();
    cache.insert(
        key.clone(),
        Gated {
            value: 1,
            gate: Some(gate.clone()),
        },
    );

    // The worker has claimed the write and is encoding.
    gate.entered.wait();
    assert!(cache.remove(&key));
    assert_eq!(cache.memory_resident(), 0);
    gate.release.wait();

    cache.flush().wait().unwrap();

    assert!(cache.is_empty());
    assert_eq!(cache.disk_resident(), 0);
    assert_eq!(cache.memory_resident(), 0);
    assert_eq!(cache.store().data_extent(), 0);
    let text = cache.store().render_metrics().unwrap();
    assert!(text.contains("disk_tier_fault_races_total{store=\"cache\"} 1"));
    assert!(text.contains("disk_tier_writes_total{store=\"cache\"} 0"));
}

#[tokio::test]
async fn test_flush_completes_asynchronously() {
    let dir = TempDir::new().unwrap();
    let cache: DiskCache<String, String> = DiskCache::open(config(&dir)).unwrap();

    cache.insert("a".to_string(), "alpha".to_string());
    cache.insert("b".to_string(), "beta".to_string());
    let written = cache.flush().completed().await.unwrap();
    assert_eq!(written, 2);

    let cache = tokio::task::spawn_blocking(move || {
        assert_eq!(cache.get(&"a".to_string()).unwrap().value, "alpha");
        cache
    })
    .await
    .unwrap();
    tokio::task::spawn_blocking(move || cache.close())
        .await
        .unwrap()
        .unwrap();
}
