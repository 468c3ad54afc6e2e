//! Cache elements: the key/value pair plus the metadata envelope that
//! travels with it to disk.

use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bounds every cache key satisfies.
pub trait CacheKey:
    Hash + Eq + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Hash + Eq + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds every cache value satisfies.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hash used for stripe and segment routing.
pub fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A cached key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element<K, V> {
    pub key: K,

    pub value: V,

    /// Number of reads served for this entry.
    pub hit_count: u64,

    /// Creation time, epoch milliseconds.
    pub created_at: u64,

    /// Last access time, epoch milliseconds.
    pub last_accessed_at: u64,

    /// Absolute expiration time in epoch milliseconds; `None` never expires.
    pub expires_at: Option<u64>,
}

impl<K, V> Element<K, V> {
    pub fn new(key: K, value: V) -> Self {
        let now = now_millis();
        Self {
            key,
            value,
            hit_count: 0,
            created_at: now,
            last_accessed_at: now,
            expires_at: None,
        }
    }

    /// Expire `ttl` after creation.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.expires_at = Some(self.created_at.saturating_add(ttl));
        self
    }

    /// Expire at an absolute epoch-millisecond timestamp.
    pub fn with_expiry(mut self, expires_at: Option<u64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_hit_count(mut self, hit_count: u64) -> Self {
        self.hit_count = hit_count;
        self
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_expiry() {
        let e = Element::new("k", 1u32);
        assert!(!e.is_expired(u64::MAX));

        let e = e.with_expiry(Some(1_000));
        assert!(!e.is_expired(999));
        assert!(e.is_expired(1_000));
    }

    #[test]
    fn test_ttl_is_relative_to_creation() {
        let e = Element::new("k", ()).with_ttl(Duration::from_secs(2));
        assert_eq!(e.expires_at, Some(e.created_at + 2_000));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let e = Element::new("k", 1u32).with_ttl(Duration::MAX);
        assert_eq!(e.expires_at, Some(u64::MAX));
        assert!(!e.is_expired(now_millis()));

        let e = Element::new("k", 1u32).with_ttl(Duration::from_secs(u64::MAX / 1000));
        assert_eq!(e.expires_at, Some(u64::MAX));
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(hash_key(&"abc"), hash_key(&"abc".to_string()));
    }
}
