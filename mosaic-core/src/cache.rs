//! Process-wide TTL+LRU cache for parsed mosaic documents.
//!
//! Backends share one cache keyed by `(backend kind, canonical uri)`. Writes
//! and updates invalidate their own entry; errors are never cached.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use log::trace;
use moka::sync::Cache;

use crate::model::MosaicJSON;

/// Cache TTL in seconds.
const ENV_CACHE_TTL: &str = "MOSAIC_CACHE_TTL";
/// Maximum number of cached documents.
const ENV_CACHE_SIZE: &str = "MOSAIC_CACHE_SIZE";
/// Any truthy value disables the cache entirely.
const ENV_DISABLE_CACHE: &str = "MOSAIC_DISABLE_CACHE";

const DEFAULT_TTL_SECONDS: u64 = 300;
const DEFAULT_SIZE: u64 = 512;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub backend: &'static str,
    pub uri: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(backend: &'static str, uri: impl Into<String>) -> Self {
        Self {
            backend,
            uri: uri.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub size: u64,
    pub disabled: bool,
}

impl CacheConfig {
    /// Resolve the cache configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let ttl = env_u64(ENV_CACHE_TTL).unwrap_or(DEFAULT_TTL_SECONDS);
        let size = env_u64(ENV_CACHE_SIZE).unwrap_or(DEFAULT_SIZE);
        let disabled = std::env::var(ENV_DISABLE_CACHE)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Self {
            ttl: Duration::from_secs(ttl),
            size,
            disabled: disabled || ttl == 0 || size == 0,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

static DOCUMENT_CACHE: LazyLock<Option<Cache<CacheKey, Arc<MosaicJSON>>>> = LazyLock::new(|| {
    let config = CacheConfig::from_env();
    if config.disabled {
        return None;
    }
    Some(
        Cache::builder()
            .name("mosaic-documents")
            .max_capacity(config.size)
            .time_to_live(config.ttl)
            .build(),
    )
});

pub(crate) fn get(key: &CacheKey) -> Option<Arc<MosaicJSON>> {
    let cache = DOCUMENT_CACHE.as_ref()?;
    let hit = cache.get(key);
    trace!(
        "document cache {} for {key:?} ({} entries)",
        if hit.is_some() { "HIT" } else { "MISS" },
        cache.entry_count()
    );
    hit
}

pub(crate) fn insert(key: CacheKey, mosaic: Arc<MosaicJSON>) {
    if let Some(cache) = DOCUMENT_CACHE.as_ref() {
        cache.insert(key, mosaic);
    }
}

pub(crate) fn invalidate(key: &CacheKey) {
    if let Some(cache) = DOCUMENT_CACHE.as_ref() {
        cache.invalidate(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_invalidate_round_trip() {
        let key = CacheKey::new("test", "mosaic://cache-round-trip");
        assert!(get(&key).is_none());

        let mosaic = Arc::new(MosaicJSON::default());
        insert(key.clone(), Arc::clone(&mosaic));
        // moka sync caches are immediately readable from the same thread
        if let Some(cached) = get(&key) {
            assert_eq!(*cached, *mosaic);
        }

        invalidate(&key);
        assert!(get(&key).is_none());
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = CacheConfig::from_env();
        // only assert invariants, the suite must not depend on ambient env
        assert!(config.size > 0 || config.disabled);
    }
}
