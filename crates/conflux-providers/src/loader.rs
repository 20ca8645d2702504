//! Whitelist-gated provider loader with instance caching.
//!
//! Resolves a string key to a cached handler instance. Keys outside the
//! fixed [`ProviderKind`](crate::ProviderKind) registry are rejected before
//! any construction happens, and a failed load never leaves a partial or
//! unhealthy instance in the cache.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use conflux_types::{LoaderStats, ProviderDescriptor, ProviderError, Result};

use crate::handler::DynProvider;
use crate::registry::ProviderKind;

// ---------------------------------------------------------------------------
// ProviderLoader
// ---------------------------------------------------------------------------

pub struct ProviderLoader {
    /// Runtime configuration per key; keys without a descriptor get defaults.
    descriptors: HashMap<String, ProviderDescriptor>,
    cache: RwLock<HashMap<String, Arc<DynProvider>>>,
    load_count: AtomicU64,
    cache_hit_count: AtomicU64,
    error_count: AtomicU64,
}

impl ProviderLoader {
    pub fn new() -> Self {
        Self::with_descriptors(HashMap::new())
    }

    pub fn with_descriptors(descriptors: HashMap<String, ProviderDescriptor>) -> Self {
        Self {
            descriptors,
            cache: RwLock::new(HashMap::new()),
            load_count: AtomicU64::new(0),
            cache_hit_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Pure registry query; never touches the cache.
    pub fn is_allowed(&self, key: &str) -> bool {
        ProviderKind::from_key(key).is_some()
    }

    /// Pure registry query; never touches the cache.
    pub fn list_allowed(&self) -> Vec<&'static str> {
        ProviderKind::all().iter().map(|kind| kind.key()).collect()
    }

    /// Resolve `key` to a live handler instance.
    ///
    /// Repeated loads of the same key return the same `Arc`, so handler-local
    /// state persists across invocations. Construction and the liveness check
    /// run outside any lock; if two callers race past an empty cache, both
    /// may build an instance but only the first insert survives — the loser
    /// discards its build and is served the cached one.
    pub async fn load(&self, key: &str) -> Result<Arc<DynProvider>> {
        if let Some(cached) = self.cache.read().await.get(key) {
            self.cache_hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        let kind = match ProviderKind::from_key(key) {
            Some(kind) => kind,
            None => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(provider = %key, "Rejected non-whitelisted provider key");
                return Err(ProviderError::not_allowed(key, &self.list_allowed()));
            }
        };

        let descriptor = self
            .descriptors
            .get(key)
            .cloned()
            .unwrap_or_else(|| ProviderDescriptor::for_key(key));

        let instance = match kind.construct(&descriptor) {
            Ok(instance) => instance,
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(provider = %key, error = %err, "Provider construction failed");
                return Err(err);
            }
        };

        // The trait system guarantees the operations exist; what can still be
        // wrong structurally is the instance answering for a different key.
        if instance.key() != key {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(ProviderError::load_failed(format!(
                "constructed provider reports key '{}', expected '{}'",
                instance.key(),
                key
            )));
        }

        if !instance.health_check().await {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(provider = %key, "Provider failed its liveness check; not cached");
            return Err(ProviderError::unhealthy(key));
        }

        let instance = Arc::new(instance);
        let mut cache = self.cache.write().await;
        match cache.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                // Lost the first-construction race; serve the survivor.
                self.cache_hit_count.fetch_add(1, Ordering::Relaxed);
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
                self.load_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(provider = %key, name = %instance.name(), "Provider loaded and cached");
                Ok(instance)
            }
        }
    }

    /// Drop the cache entry for `key`. Intended for tests and hot-reload
    /// tooling, not steady-state traffic.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.cache.write().await.remove(key).is_some()
    }

    pub async fn invalidate_all(&self) {
        self.cache.write().await.clear();
    }

    /// Counter snapshot. Reading never mutates anything.
    pub async fn stats(&self) -> LoaderStats {
        let cache = self.cache.read().await;
        let mut cached_keys: Vec<String> = cache.keys().cloned().collect();
        cached_keys.sort();
        LoaderStats {
            load_count: self.load_count.load(Ordering::Relaxed),
            cache_hit_count: self.cache_hit_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            cache_size: cache.len(),
            cached_keys,
        }
    }
}

impl Default for ProviderLoader {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_types::ErrorCode;

    fn loader_with_cloud_base(base_url: &str) -> ProviderLoader {
        let mut descriptor = ProviderDescriptor::for_key("cloud_function");
        descriptor
            .params
            .insert("base_url".to_string(), serde_json::json!(base_url));
        let mut descriptors = HashMap::new();
        descriptors.insert("cloud_function".to_string(), descriptor);
        ProviderLoader::with_descriptors(descriptors)
    }

    #[tokio::test]
    async fn load_twice_returns_identical_cached_instance() {
        let loader = ProviderLoader::new();

        let first = loader.load("http_endpoint").await.unwrap();
        let second = loader.load("http_endpoint").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = loader.stats().await;
        assert_eq!(stats.load_count, 1);
        assert_eq!(stats.cache_hit_count, 1);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.cached_keys, vec!["http_endpoint".to_string()]);
    }

    #[tokio::test]
    async fn non_whitelisted_key_is_rejected_with_diagnostics() {
        let loader = ProviderLoader::new();

        let err = loader.load("MALICIOUS_PROVIDER").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotAllowed);
        let details = err.details.unwrap();
        assert_eq!(details["attempted"], "MALICIOUS_PROVIDER");
        let allowed = details["allowed"].as_array().unwrap();
        assert!(allowed.contains(&serde_json::json!("http_endpoint")));
        assert!(allowed.contains(&serde_json::json!("cloud_function")));
        assert!(allowed.contains(&serde_json::json!("external_workflow")));

        let stats = loader.stats().await;
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.load_count, 0);
        assert_eq!(stats.cache_size, 0);
    }

    #[tokio::test]
    async fn construction_failure_is_load_failed_and_never_cached() {
        std::env::remove_var(crate::cloud_function::BASE_URL_ENV);
        // No descriptor and no env var: cloud_function cannot be constructed.
        let loader = ProviderLoader::new();

        let err = loader.load("cloud_function").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadFailed);

        let stats = loader.stats().await;
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.cache_size, 0);
    }

    #[tokio::test]
    async fn unhealthy_instance_is_discarded_not_cached() {
        let loader = loader_with_cloud_base("not a parseable url");

        let err = loader.load("cloud_function").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unhealthy);

        // Still not cached on a second try; every failure counts.
        let err = loader.load("cloud_function").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unhealthy);

        let stats = loader.stats().await;
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.load_count, 0);
    }

    #[tokio::test]
    async fn healthy_configured_provider_is_cached() {
        let loader = loader_with_cloud_base("https://fn.internal");

        let provider = loader.load("cloud_function").await.unwrap();
        assert_eq!(provider.key(), "cloud_function");

        let stats = loader.stats().await;
        assert_eq!(stats.load_count, 1);
        assert_eq!(stats.error_count, 0);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_instance() {
        let loader = ProviderLoader::new();

        let first = loader.load("http_endpoint").await.unwrap();
        assert!(loader.invalidate("http_endpoint").await);
        assert!(!loader.invalidate("http_endpoint").await);

        let second = loader.load("http_endpoint").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let stats = loader.stats().await;
        assert_eq!(stats.load_count, 2);
    }

    #[tokio::test]
    async fn invalidate_all_clears_the_cache() {
        let loader = ProviderLoader::new();
        loader.load("http_endpoint").await.unwrap();
        loader.load("external_workflow").await.ok();

        loader.invalidate_all().await;
        assert_eq!(loader.stats().await.cache_size, 0);
    }

    #[tokio::test]
    async fn registry_queries_have_no_side_effects() {
        let loader = ProviderLoader::new();

        assert!(loader.is_allowed("http_endpoint"));
        assert!(!loader.is_allowed("MALICIOUS_PROVIDER"));
        assert_eq!(
            loader.list_allowed(),
            vec!["http_endpoint", "cloud_function", "external_workflow"]
        );

        // Neither query inserted anything or moved a counter.
        let stats = loader.stats().await;
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.load_count, 0);
        assert_eq!(stats.cache_hit_count, 0);
        assert_eq!(stats.error_count, 0);

        // stats() itself is idempotent.
        let again = loader.stats().await;
        assert_eq!(again.load_count, stats.load_count);
        assert_eq!(again.cache_hit_count, stats.cache_hit_count);
        assert_eq!(again.error_count, stats.error_count);
    }

    #[tokio::test]
    async fn concurrent_first_load_yields_one_surviving_instance() {
        let loader = Arc::new(ProviderLoader::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = loader.clone();
            handles.push(tokio::spawn(async move {
                loader.load("http_endpoint").await.unwrap()
            }));
        }
        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap());
        }

        // Everyone got the same surviving instance.
        for instance in &instances[1..] {
            assert!(Arc::ptr_eq(&instances[0], instance));
        }
        let stats = loader.stats().await;
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.load_count, 1);
        // Each of the other 7 calls was served from the cache one way or the other.
        assert_eq!(stats.cache_hit_count, 7);
        assert_eq!(stats.error_count, 0);
    }
}
