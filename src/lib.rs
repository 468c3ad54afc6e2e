//! disk-tier: the disk-overflow tier of an in-process cache.
//!
//! Entries that exceed the in-memory capacity are serialized to a striped
//! backing file by a background worker and replaced in the live index by
//! lightweight markers. A persistent store writes its index on flush and
//! reloads it on the next bind.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod transfer;

pub use cache::disk_cache::DiskCache;
pub use cache::element::Element;
pub use cache::store::{DiskStore, DiskStoreError, FlushHandle, StoreListener};
pub use config::Config;
