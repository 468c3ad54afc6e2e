//! The disk tier of the cache.
//!
//! - [`element`]: Element, key/value bounds, timestamps
//! - [`substitute`]: Placeholder, Marker and CachingMarker index entries
//! - [`codec`]: Element ↔ bytes, with optional zstd compression
//! - [`index`]: The index contract the store works against, plus `MapIndex`
//! - [`evictor`]: Sampling eviction for the memory and disk populations
//! - [`persistence`]: Index file format, legacy detection, startup checks
//! - [`store`]: DiskStore, the worker tasks and capacity accounting
//! - [`disk_cache`]: A get/put/remove cache over `MapIndex` + `DiskStore`

pub mod codec;
pub mod disk_cache;
pub mod element;
pub mod evictor;
pub mod index;
pub mod persistence;
pub mod store;
pub mod substitute;
