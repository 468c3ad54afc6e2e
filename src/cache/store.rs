//! The disk store: owns the data file, the region allocator and the
//! background worker, and moves entries between placeholders and markers in
//! the index it is bound to.
//!
//! A store runs in one of two modes:
//!
//! - **persistent**: completed writes become [`CachingMarker`]s, the index is
//!   written to `<name>.index` on flush and unbind and reloaded on bind.
//! - **overflow**: completed writes become plain [`Marker`]s, the data file is
//!   truncated on open and both files are deleted on unbind.
//!
//! Client operations never fail because of worker failures. A failed write
//! evicts its entry; a failed read is reported as a miss.

use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::cache::codec::{CodecError, ElementCodec, ValueResolver};
use crate::cache::element::{hash_key, now_millis, CacheKey, CacheValue, Element};
use crate::cache::evictor::{EvictionPolicy, Evictor, LeastRecentlyUsed};
use crate::cache::index::{SegmentLock, SubstituteIndex};
use crate::cache::persistence::{Consistency, IndexFile, PersistenceError};
use crate::cache::substitute::{CachingMarker, Marker, OwnerId, Placeholder, Substitute};
use crate::config::{Config, StoreConfig};
use crate::metrics::StoreMetrics;
use crate::transfer::allocator::{AllocatorError, Region, RegionAllocator};
use crate::transfer::disk_io::{DiskIoError, DiskIoStats, StripedFile};
use crate::transfer::scheduler::{self, Scheduler, SchedulerStats, TaskExecutor, WorkerHandle};

#[derive(Error, Debug)]
pub enum DiskStoreError {
    #[error("Allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    #[error("Disk I/O error: {0}")]
    DiskIo(#[from] DiskIoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Index file error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Store is already bound to an index")]
    AlreadyBound,

    #[error("Store is not bound to an index")]
    NotBound,

    #[error("Disk worker has stopped")]
    WorkerStopped,

    #[error("Record at {0} belongs to a different key")]
    KeyMismatch(Region),
}

/// Callbacks for entries leaving the store outside of a client remove.
pub trait StoreListener<K, V>: Send + Sync {
    /// An expired entry was removed by a sweep.
    fn on_expired(&self, _element: &Element<K, V>) {}

    /// An entry was removed to enforce the disk capacity.
    fn on_evicted(&self, _key: &K) {}

    /// Writing an entry failed; the entry was dropped.
    fn on_write_failure(&self, _key: &K, _error: &DiskStoreError) {}
}

type SharedIndex<K, V> = Arc<dyn SubstituteIndex<K, V>>;

/// Completion of a [`DiskStore::flush`].
pub struct FlushHandle {
    rx: oneshot::Receiver<Result<usize, DiskStoreError>>,
}

impl FlushHandle {
    /// Block until the index is written. Returns the number of entries.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`completed`](Self::completed) there.
    pub fn wait(self) -> Result<usize, DiskStoreError> {
        self.rx
            .blocking_recv()
            .map_err(|_| DiskStoreError::WorkerStopped)?
    }

    pub async fn completed(self) -> Result<usize, DiskStoreError> {
        self.rx.await.map_err(|_| DiskStoreError::WorkerStopped)?
    }
}

/// Work queued for the disk worker.
pub enum DiskTask<K, V> {
    Write(Arc<Placeholder<K, V>>),
    Free {
        lock: SegmentLock,
        region: Region,
    },
    WriteIndex {
        clear_cached: bool,
        done: oneshot::Sender<Result<usize, DiskStoreError>>,
    },
}

struct Shared<K, V> {
    config: StoreConfig,
    evictor: Evictor,
    owner: OwnerId,
    data: StripedFile,
    allocator: Mutex<RegionAllocator>,
    codec: ElementCodec<K, V>,
    resolver: Option<Arc<dyn ValueResolver<V>>>,
    index: RwLock<Option<SharedIndex<K, V>>>,
    index_file: IndexFile,

    memory_count: AtomicUsize,
    disk_count: AtomicUsize,
    memory_capacity: AtomicUsize,
    disk_capacity: AtomicUsize,
    last_element_size: AtomicUsize,

    policy: RwLock<Arc<dyn EvictionPolicy>>,
    listeners: RwLock<Vec<Arc<dyn StoreListener<K, V>>>>,
    scheduler: Scheduler<DiskTask<K, V>>,
    metrics: StoreMetrics,
}

/// Disk tier for one logical cache.
pub struct DiskStore<K, V> {
    shared: Arc<Shared<K, V>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl<K: CacheKey, V: CacheValue> DiskStore<K, V> {
    pub fn open(config: Config) -> Result<Self, DiskStoreError> {
        Self::open_with(config, None)
    }

    /// Open the store files and start the worker. `resolver` is tried first
    /// when decoding values.
    pub fn open_with(
        config: Config,
        resolver: Option<Arc<dyn ValueResolver<V>>>,
    ) -> Result<Self, DiskStoreError> {
        let store = config.store;
        let data_path = store.data_path();
        let index_file = IndexFile::new(store.index_path());

        let keep_data = if store.persistent {
            let consistency =
                index_file.check_consistency(&data_path, store.staleness_tolerance())?;
            debug!(?consistency, "Checked index file");
            consistency == Consistency::Usable
        } else {
            index_file.delete()?;
            false
        };

        let data = StripedFile::open(&data_path, store.stripes, !keep_data)?;
        let (scheduler, receiver) = scheduler::channel();

        let shared = Arc::new(Shared {
            evictor: Evictor::new(config.eviction),
            owner: OwnerId::new(),
            data,
            allocator: Mutex::new(RegionAllocator::new()),
            codec: ElementCodec::new(config.compression),
            resolver,
            index: RwLock::new(None),
            index_file,
            memory_count: AtomicUsize::new(0),
            disk_count: AtomicUsize::new(0),
            memory_capacity: AtomicUsize::new(store.memory_capacity),
            disk_capacity: AtomicUsize::new(store.disk_capacity),
            last_element_size: AtomicUsize::new(0),
            policy: RwLock::new(Arc::new(LeastRecentlyUsed)),
            listeners: RwLock::new(Vec::new()),
            scheduler,
            metrics: StoreMetrics::new(&store.name)
                .map_err(|e| DiskStoreError::Metrics(e.to_string()))?,
            config: store,
        });

        let worker = receiver.spawn(
            &format!("disk-tier-{}", shared.config.name),
            shared.clone(),
            shared.config.expiry_interval(),
        )?;

        info!(
            name = %shared.config.name,
            owner = %shared.owner,
            persistent = shared.config.persistent,
            stripes = shared.data.stripe_count(),
            "Opened disk store"
        );

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Attach the index. A persistent store reloads its index file into it
    /// and returns the number of entries restored.
    pub fn bind(&self, index: SharedIndex<K, V>) -> Result<usize, DiskStoreError> {
        {
            let mut slot = self.shared.index.write();
            if slot.is_some() {
                return Err(DiskStoreError::AlreadyBound);
            }
            *slot = Some(index.clone());
        }

        if !self.shared.config.persistent {
            return Ok(0);
        }

        let restored = if self.shared.index_file.exists() {
            self.shared.load_index(&index)
        } else {
            0
        };
        self.shared.shrink_data_file();
        self.shared.enforce_disk_capacity(None);
        info!(restored, "Bound disk store");
        Ok(restored)
    }

    /// Persist (or discard, in overflow mode) and stop the store.
    pub fn unbind(&self) -> Result<(), DiskStoreError> {
        let result = if self.shared.config.persistent {
            self.flush().wait().map(|_| ())
        } else {
            Ok(())
        };

        self.shutdown();

        if !self.shared.config.persistent {
            remove_if_exists(self.shared.data.path())?;
            self.shared.index_file.delete()?;
        }
        *self.shared.index.write() = None;
        result
    }

    /// Wrap a freshly put element in a placeholder owned by this store.
    pub fn create(&self, key: K, element: Element<K, V>) -> Substitute<K, V> {
        debug_assert!(element.key == key);
        Substitute::Placeholder(Arc::new(Placeholder::new(element, self.shared.owner)))
    }

    /// Schedule the write of a placeholder that is installed in the index.
    /// Returns `false` if the substitute is not a placeholder of this store.
    pub fn put(&self, substitute: &Substitute<K, V>) -> bool {
        let Substitute::Placeholder(placeholder) = substitute else {
            return false;
        };
        if placeholder.owner() != self.shared.owner {
            return false;
        }

        self.shared.memory_count.fetch_add(1, Ordering::AcqRel);
        if self
            .shared
            .scheduler
            .submit(DiskTask::Write(placeholder.clone()))
            .is_err()
        {
            warn!(key = ?placeholder.key(), "Disk worker stopped, element stays in memory");
        }
        self.shared.enforce_memory_capacity(Some(placeholder.key()));
        true
    }

    /// Value behind `substitute`, reading it from disk if needed. A read of
    /// a caching marker populates its cached slot.
    pub fn retrieve(&self, key: &K, substitute: &Substitute<K, V>) -> Option<Arc<Element<K, V>>> {
        if substitute.owner() != self.shared.owner {
            return None;
        }

        match substitute {
            Substitute::Placeholder(p) => Some(p.element().clone()),
            Substitute::Marker(m) => {
                m.hit(now_millis());
                self.shared.read(m).map(Arc::new)
            }
            Substitute::Caching(c) => {
                c.marker().hit(now_millis());
                if let Some(cached) = c.cached() {
                    return Some(cached);
                }
                let element = Arc::new(self.shared.read(c.marker())?);
                if c.cache(element.clone()) {
                    self.shared.memory_count.fetch_add(1, Ordering::AcqRel);
                    self.shared.enforce_memory_capacity(Some(key));
                }
                Some(element)
            }
        }
    }

    /// Release everything held by a substitute that was removed from the
    /// index. The region is freed inline if `lock` is free, otherwise by the
    /// worker once readers are gone.
    pub fn free(&self, lock: SegmentLock, substitute: &Substitute<K, V>) {
        self.shared.free(lock, substitute);
    }

    /// Whether `substitute` belongs to this store.
    pub fn created(&self, substitute: &Substitute<K, V>) -> bool {
        substitute.owner() == self.shared.owner
    }

    /// Queue an index write behind every pending task.
    pub fn flush(&self) -> FlushHandle {
        let (done, rx) = oneshot::channel();
        let task = DiskTask::WriteIndex {
            clear_cached: self.shared.config.clear_cached_on_flush,
            done,
        };
        if self.shared.scheduler.submit(task).is_err() {
            warn!("Disk worker stopped, flush dropped");
        }
        FlushHandle { rx }
    }

    /// Remove every on-disk entry past its expiration. Returns the number
    /// removed.
    pub fn expire_elements(&self) -> usize {
        self.shared.expire_elements()
    }

    pub fn add_listener(&self, listener: Arc<dyn StoreListener<K, V>>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn memory_capacity(&self) -> usize {
        self.shared.memory_capacity.load(Ordering::Acquire)
    }

    pub fn set_memory_capacity(&self, capacity: usize) {
        self.shared.memory_capacity.store(capacity, Ordering::Release);
        self.shared.enforce_memory_capacity(None);
    }

    pub fn disk_capacity(&self) -> usize {
        self.shared.disk_capacity.load(Ordering::Acquire)
    }

    pub fn set_disk_capacity(&self, capacity: usize) {
        self.shared.disk_capacity.store(capacity, Ordering::Release);
        self.shared.enforce_disk_capacity(None);
    }

    pub fn eviction_policy(&self) -> Arc<dyn EvictionPolicy> {
        self.shared.policy.read().clone()
    }

    pub fn set_eviction_policy(&self, policy: Arc<dyn EvictionPolicy>) {
        debug!(policy = policy.name(), "Eviction policy changed");
        *self.shared.policy.write() = policy;
    }

    /// Advisory backpressure signal; writes are never dropped.
    pub fn is_write_queue_full(&self) -> bool {
        let pending = self.shared.scheduler.pending();
        let size = self.shared.last_element_size.load(Ordering::Relaxed);
        pending.saturating_mul(size) > self.shared.config.write_queue_budget_bytes
    }

    /// Entries holding a value in memory.
    pub fn memory_count(&self) -> usize {
        self.shared.memory_count.load(Ordering::Acquire)
    }

    /// Entries with a region in the data file.
    pub fn disk_count(&self) -> usize {
        self.shared.disk_count.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.scheduler.pending()
    }

    /// Bytes the data file must span.
    pub fn data_extent(&self) -> u64 {
        self.shared.allocator.lock().extent()
    }

    pub fn owner(&self) -> OwnerId {
        self.shared.owner
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn io_stats(&self) -> DiskIoStats {
        self.shared.data.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.shared.scheduler.stats()
    }

    /// Metrics in Prometheus text format.
    pub fn render_metrics(&self) -> Result<String, DiskStoreError> {
        let metrics = &self.shared.metrics;
        metrics.memory_resident.set(self.memory_count() as i64);
        metrics.disk_resident.set(self.disk_count() as i64);
        metrics.queue_depth.set(self.pending_tasks() as i64);
        metrics
            .render()
            .map_err(|e| DiskStoreError::Metrics(e.to_string()))
    }

    /// Drain the worker for up to the grace period, then close the data
    /// file. Idempotent.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        self.shared.scheduler.shutdown();
        let drained = worker.join_timeout(self.shared.config.shutdown_grace());
        if !drained {
            warn!(
                pending = self.shared.scheduler.pending(),
                "Force-closing data file with tasks outstanding"
            );
        }
        self.shared.data.close();
        info!(name = %self.shared.config.name, drained, "Disk store shut down");
    }
}

impl<K, V> Drop for DiskStore<K, V> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            self.shared.scheduler.shutdown();
            worker.join_timeout(self.shared.config.shutdown_grace());
            self.shared.data.close();
        }
    }
}

impl<K: CacheKey, V: CacheValue> TaskExecutor for Shared<K, V> {
    type Task = DiskTask<K, V>;

    fn execute(&self, task: DiskTask<K, V>) {
        match task {
            DiskTask::Write(placeholder) => self.write(placeholder),
            DiskTask::Free { lock, region } => {
                let _guard = lock.write();
                self.release_region(region);
            }
            DiskTask::WriteIndex { clear_cached, done } => {
                let result = self.write_index(clear_cached);
                if let Err(e) = &result {
                    error!(error = %e, "Failed to write index file");
                }
                let _ = done.send(result);
            }
        }
    }

    fn on_tick(&self) {
        let expired = self.expire_elements();
        if expired > 0 {
            debug!(expired, "Expiry sweep finished");
        }
    }
}

impl<K: CacheKey, V: CacheValue> Shared<K, V> {
    fn index(&self) -> Option<SharedIndex<K, V>> {
        self.index.read().clone()
    }

    fn listeners(&self) -> Vec<Arc<dyn StoreListener<K, V>>> {
        self.listeners.read().clone()
    }

    fn write(&self, placeholder: Arc<Placeholder<K, V>>) {
        if !placeholder.begin_write() {
            return;
        }
        let Some(index) = self.index() else {
            return;
        };

        let element = placeholder.element();
        let key = &element.key;
        let expected = Substitute::Placeholder(placeholder.clone());

        match self.write_element(element) {
            Ok(region) => {
                let marker = Marker::new(element.as_ref(), region, self.owner);
                let replacement = if self.config.persistent {
                    Substitute::Caching(Arc::new(CachingMarker::new(marker, Some(element.clone()))))
                } else {
                    Substitute::Marker(Arc::new(marker))
                };

                if index.fault(key, &expected, replacement) {
                    self.disk_count.fetch_add(1, Ordering::AcqRel);
                    if !self.config.persistent {
                        decrement(&self.memory_count, "memory_count");
                    }
                    self.metrics.writes.inc();
                    debug!(key = ?key, offset = region.start, size = region.len(), "Faulted element to disk");
                    self.enforce_memory_capacity(Some(key));
                    self.enforce_disk_capacity(Some(key));
                } else {
                    self.metrics.fault_races.inc();
                    debug!(key = ?key, "Placeholder replaced during write, discarding");
                    self.release_region(region);
                }
            }
            Err(e) => {
                self.metrics.write_failures.inc();
                error!(key = ?key, error = %e, "Failed to write element to disk");
                if index.evict(key, &expected) {
                    decrement(&self.memory_count, "memory_count");
                }
                for listener in self.listeners() {
                    listener.on_write_failure(key, &e);
                }
            }
        }
    }

    fn write_element(&self, element: &Element<K, V>) -> Result<Region, DiskStoreError> {
        let bytes = self.codec.encode(element)?;
        self.last_element_size.store(bytes.len(), Ordering::Relaxed);

        let region = self.allocator.lock().allocate(bytes.len() as u64)?;
        if let Err(e) = self
            .data
            .write_at(hash_key(&element.key), region.start, &bytes)
        {
            self.release_region(region);
            return Err(e.into());
        }
        Ok(region)
    }

    fn read(&self, marker: &Marker<K>) -> Option<Element<K, V>> {
        match self.try_read(marker) {
            Ok(element) => {
                self.metrics.reads.inc();
                Some(element)
            }
            Err(e) => {
                self.metrics.read_failures.inc();
                warn!(key = ?marker.key(), region = %marker.region(), error = %e, "Failed to read element");
                None
            }
        }
    }

    fn try_read(&self, marker: &Marker<K>) -> Result<Element<K, V>, DiskStoreError> {
        let region = marker.region();
        let bytes = self
            .data
            .read_at(hash_key(marker.key()), region.start, region.len() as usize)?;
        let mut element = self.codec.decode(&bytes, self.resolver.as_deref())?;
        if element.key != *marker.key() {
            return Err(DiskStoreError::KeyMismatch(region));
        }
        element.hit_count = marker.hit_count();
        element.last_accessed_at = marker.last_accessed_at();
        Ok(element)
    }

    fn free(&self, lock: SegmentLock, substitute: &Substitute<K, V>) {
        if substitute.owner() != self.owner {
            return;
        }

        let region = match substitute {
            Substitute::Placeholder(p) => {
                p.cancel();
                decrement(&self.memory_count, "memory_count");
                return;
            }
            Substitute::Marker(m) => m.region(),
            Substitute::Caching(c) => {
                if c.retire().is_some() {
                    decrement(&self.memory_count, "memory_count");
                }
                c.marker().region()
            }
        };
        decrement(&self.disk_count, "disk_count");

        if let Some(_guard) = lock.try_write() {
            self.release_region(region);
            return;
        }
        if let Err(DiskTask::Free { lock, region }) =
            self.scheduler.submit(DiskTask::Free { lock, region })
        {
            let _guard = lock.write();
            self.release_region(region);
        }
    }

    fn release_region(&self, region: Region) {
        if let Err(e) = self.allocator.lock().free(region) {
            warn!(%region, error = %e, "Failed to free region");
        }
    }

    fn expire_elements(&self) -> usize {
        let Some(index) = self.index() else {
            return 0;
        };
        let listeners = self.listeners();
        let now = now_millis();
        let mut expired = 0;

        for key in index.keys() {
            let Some(substitute) = index.peek(&key) else {
                continue;
            };
            if substitute.is_placeholder()
                || substitute.owner() != self.owner
                || !substitute.is_expired(now)
            {
                continue;
            }

            let lock = index.lock_for(&key);
            let element = if listeners.is_empty() {
                None
            } else {
                let _guard = lock.read();
                match &substitute {
                    Substitute::Caching(c) => c.cached().or_else(|| self.read(c.marker()).map(Arc::new)),
                    Substitute::Marker(m) => self.read(m).map(Arc::new),
                    Substitute::Placeholder(_) => None,
                }
            };

            if index.evict(&key, &substitute) {
                self.free(lock, &substitute);
                self.metrics.expirations.inc();
                expired += 1;
                if let Some(element) = element {
                    for listener in &listeners {
                        listener.on_expired(&element);
                    }
                }
            }
        }
        expired
    }

    fn enforce_memory_capacity(&self, hint: Option<&K>) {
        let capacity = self.memory_capacity.load(Ordering::Acquire);
        if capacity == 0 {
            return;
        }
        let Some(index) = self.index() else {
            return;
        };
        let policy = self.policy.read().clone();

        for _ in 0..self.evictor.max_attempts() {
            let count = self.memory_count.load(Ordering::Acquire);
            if count <= capacity {
                break;
            }
            let sample = index.random_sample(
                &|s: &Substitute<K, V>| Evictor::memory_eligible(s),
                self.evictor.sample_size(count),
                hint,
            );
            let Some(victim) = self.evictor.select_memory_victim(policy.as_ref(), sample) else {
                break;
            };
            if let Substitute::Caching(c) = &victim.substitute {
                if c.flush().is_some() {
                    decrement(&self.memory_count, "memory_count");
                    self.metrics.memory_demotions.inc();
                    debug!(key = ?victim.key, policy = policy.name(), "Demoted cached element");
                }
            }
        }
    }

    fn enforce_disk_capacity(&self, hint: Option<&K>) {
        let capacity = self.disk_capacity.load(Ordering::Acquire);
        if capacity == 0 {
            return;
        }
        let Some(index) = self.index() else {
            return;
        };

        for _ in 0..self.evictor.max_attempts() {
            let count = self.disk_count.load(Ordering::Acquire);
            if count <= capacity {
                break;
            }
            let sample = index.random_sample(
                &|s: &Substitute<K, V>| Evictor::disk_eligible(s),
                self.evictor.sample_size(count),
                hint,
            );
            let Some(victim) = self.evictor.select_disk_victim(sample) else {
                break;
            };
            if index.evict(&victim.key, &victim.substitute) {
                self.free(index.lock_for(&victim.key), &victim.substitute);
                self.metrics.disk_evictions.inc();
                debug!(key = ?victim.key, hits = victim.substitute.stats().hit_count, "Evicted element from disk");
                for listener in self.listeners() {
                    listener.on_evicted(&victim.key);
                }
            }
        }
    }

    fn write_index(&self, clear_cached: bool) -> Result<usize, DiskStoreError> {
        if !self.config.persistent {
            return Ok(0);
        }
        let index = self.index().ok_or(DiskStoreError::NotBound)?;

        for key in index.keys() {
            if let Some(Substitute::Placeholder(p)) = index.peek(&key) {
                if p.owner() == self.owner {
                    self.write(p);
                }
            }
        }
        self.data.sync()?;

        let mut entries = Vec::new();
        for key in index.keys() {
            let Some(substitute) = index.peek(&key) else {
                continue;
            };
            if substitute.owner() != self.owner {
                continue;
            }
            let Some(meta) = substitute.meta() else {
                continue;
            };
            if clear_cached {
                if let Substitute::Caching(c) = &substitute {
                    if c.flush().is_some() {
                        decrement(&self.memory_count, "memory_count");
                    }
                }
            }
            entries.push((key, meta));
        }

        entries.sort_by_key(|(_, meta)| meta.region.start);
        self.index_file.write(&entries)?;
        info!(entries = entries.len(), path = %self.index_file.path().display(), "Wrote index");
        Ok(entries.len())
    }

    /// Rebuild markers from the index file. Corruption wipes the index and
    /// the store continues empty.
    fn load_index(&self, index: &SharedIndex<K, V>) -> usize {
        match self.try_load_index(index) {
            Ok(restored) => restored,
            Err(e) => {
                warn!(error = %e, path = %self.index_file.path().display(), "Index file corrupt, starting empty");
                index.clear();
                self.allocator.lock().clear();
                self.disk_count.store(0, Ordering::Release);
                self.memory_count.store(0, Ordering::Release);
                if let Err(e) = self.index_file.delete() {
                    error!(error = %e, "Failed to delete corrupt index file");
                }
                0
            }
        }
    }

    fn try_load_index(&self, index: &SharedIndex<K, V>) -> Result<usize, DiskStoreError> {
        let loaded = self.index_file.read::<K>()?;
        let data_len = self.data.len()?;
        let mut allocator = self.allocator.lock();

        let mut restored = 0;
        for (key, meta) in loaded.entries {
            if meta.region.end > data_len {
                return Err(PersistenceError::RegionOutOfBounds {
                    region: meta.region,
                    data_len,
                }
                .into());
            }
            allocator
                .mark_used(meta.region)
                .map_err(PersistenceError::from)?;

            let marker = Marker::from_meta(key.clone(), meta, self.owner);
            let substitute = Substitute::Caching(Arc::new(CachingMarker::new(marker, None)));
            if !index.insert_if_absent(key, substitute) {
                return Err(PersistenceError::DuplicateKey.into());
            }
            self.disk_count.fetch_add(1, Ordering::AcqRel);
            restored += 1;
        }

        info!(restored, legacy = loaded.legacy, "Loaded index file");
        Ok(restored)
    }

    fn shrink_data_file(&self) {
        let extent = self.allocator.lock().extent();
        match self.data.len() {
            Ok(len) if len > extent => {
                if let Err(e) = self.data.set_len(extent) {
                    warn!(error = %e, extent, "Failed to shrink data file");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to stat data file"),
        }
    }
}

fn decrement(counter: &AtomicUsize, name: &'static str) {
    if counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_err()
    {
        warn!(counter = name, "Residency counter already at zero");
    }
}

fn remove_if_exists(path: &std::path::Path) -> Result<(), DiskStoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
