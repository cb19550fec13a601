use crate::category::{CacheCategory, CategoryTtls};
use crate::error::CacheError;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn matches_any(&self, key: &str, tags: &[&str]) -> bool {
        tags.iter()
            .any(|tag| key.contains(tag) || self.tags.iter().any(|t| t == tag))
    }
}

/// Options for [`CacheStore::set`]. Without a TTL the entry lives until it
/// is deleted or invalidated.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl), tags: Vec::new() }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A value returned by [`CacheStore::get_or_compute`], flagged with whether
/// it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup<T> {
    pub value: T,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by `delete`, `clear` or invalidation.
    pub evictions: u64,
    /// Entries removed because their TTL passed.
    pub expirations: u64,
}

/// The in-memory cache store.
///
/// Reads re-validate `expires_at` against the clock on every `get`; an expired
/// entry is reported as a miss and removed in the same call.
#[derive(Debug)]
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttls: CategoryTtls,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CategoryTtls::default(), true)
    }
}

impl CacheStore {
    pub fn new(ttls: CategoryTtls, enabled: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttls,
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &configuration::CacheSettings) -> Self {
        Self::new(CategoryTtls::from_settings(settings), settings.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        self.ttls.ttl(category)
    }

    /// Returns the raw JSON value for `key` if present and fresh.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: evict under the write lock, re-checking in case a writer
        // refreshed the entry in between.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key, "Evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Returns the value for `key` decoded as `T`. A value that no longer
    /// decodes (the caller changed its type) is evicted and treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::debug!(key, error = %e, "Cached value has an unexpected shape; evicting");
                self.delete(key);
                None
            }
        }
    }

    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }
        let value = serde_json::to_value(value).map_err(|source| CacheError::Serialization {
            key: key.to_string(),
            source,
        })?;
        let entry = CacheEntry {
            value,
            expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
            tags: options.tags,
        };
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }

    /// Stores `value` with the configured TTL of `category`.
    pub fn set_in<T: Serialize + ?Sized>(
        &self,
        category: CacheCategory,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.set(key, value, SetOptions::ttl(self.ttls.ttl(category)))
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes every entry whose key contains at least one of `tags` (or that
    /// was stored with one of them). `None` clears everything. Returns the
    /// number of removed entries.
    pub fn clear(&self, tags: Option<&[&str]>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        match tags {
            None => entries.clear(),
            Some(tags) => entries.retain(|key, entry| !entry.matches_any(key, tags)),
        }
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Removes every entry whose key mentions the collection `name`.
    pub fn invalidate_collection(&self, name: &str) -> usize {
        let removed = self.clear(Some(&[name]));
        if removed > 0 {
            tracing::debug!(collection = name, removed, "Invalidated collection cache entries");
        }
        removed
    }

    /// Removes every entry in `category` (prefix match).
    pub fn invalidate_category(&self, category: CacheCategory) -> usize {
        let prefix = format!("{}:", category.prefix());
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !(key.starts_with(&prefix) || key == category.prefix()));
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Read-through lookup: returns the fresh cached value for `key`, or runs
    /// `compute`, stores its result with the TTL of `category`, and returns it.
    ///
    /// Concurrent misses on the same key may each run `compute`; the last
    /// writer wins and readers only ever see complete values. Errors from
    /// `compute` are returned and nothing is cached.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        category: CacheCategory,
        compute: F,
    ) -> Result<CacheLookup<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.enabled {
            if let Some(value) = self.get::<T>(key) {
                return Ok(CacheLookup { value, cached: true });
            }
        }

        let value = compute().await?;
        if let Err(e) = self.set_in(category, key, &value) {
            tracing::warn!(key, error = %e, "Failed to cache computed value");
        }
        Ok(CacheLookup { value, cached: false })
    }

    /// Drops every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Number of stored entries, including ones that expired but have not
    /// been read or swept yet.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Spawns a task that purges expired entries every `interval`. The task
    /// ends on its own once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = store.upgrade() else { break };
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Cache sweeper purged expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss_and_is_evicted() {
        let cache = CacheStore::default();
        cache.set("widget:active:all", &vec!["a", "b"], SetOptions::ttl(Duration::from_secs(1))).unwrap();
        assert_eq!(cache.get::<Vec<String>>("widget:active:all").unwrap(), vec!["a", "b"]);

        tokio::time::advance(Duration::from_millis(1100)).await;

        assert_eq!(cache.get::<Vec<String>>("widget:active:all"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.clear(None), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_without_ttl_do_not_expire() {
        let cache = CacheStore::default();
        cache.set("setting:site", &"Strata", SetOptions::default()).unwrap();
        tokio::time::advance(Duration::from_secs(3600 * 24 * 30)).await;
        assert_eq!(cache.get::<String>("setting:site").as_deref(), Some("Strata"));
    }

    #[test]
    fn invalidate_collection_only_touches_matching_keys() {
        let cache = CacheStore::default();
        cache.set("query:media:find_many:1", &1, SetOptions::default()).unwrap();
        cache.set("query:media:count:2", &2, SetOptions::default()).unwrap();
        cache.set("media:folder:root", &3, SetOptions::default()).unwrap();
        cache.set("widget:active:all", &4, SetOptions::default()).unwrap();

        assert_eq!(cache.invalidate_collection("media"), 3);
        assert_eq!(cache.get::<i32>("widget:active:all"), Some(4));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_by_tag_matches_key_or_explicit_tags() {
        let cache = CacheStore::default();
        cache
            .set("content:structure:flat:ab", &1, SetOptions::default().with_tags(["nav"]))
            .unwrap();
        cache.set("theme:default", &2, SetOptions::default()).unwrap();
        cache.set("widget:nav:menu", &3, SetOptions::default()).unwrap();

        assert_eq!(cache.clear(Some(&["nav"])), 2);
        assert_eq!(cache.get::<i32>("theme:default"), Some(2));
    }

    #[test]
    fn invalidate_category_uses_prefix() {
        let cache = CacheStore::default();
        cache.set_in(CacheCategory::Widget, "widget:active:all", &1).unwrap();
        cache.set_in(CacheCategory::Query, "query:widget:count:9", &2).unwrap();

        assert_eq!(cache.invalidate_category(CacheCategory::Widget), 1);
        assert_eq!(cache.get::<i32>("query:widget:count:9"), Some(2));
    }

    #[test]
    fn mismatched_type_is_treated_as_miss() {
        let cache = CacheStore::default();
        cache.set("user:1", &"not a number", SetOptions::default()).unwrap();
        assert_eq!(cache.get::<u64>("user:1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = CacheStore::new(CategoryTtls::default(), false);
        cache.set("widget:active:all", &1, SetOptions::default()).unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn read_through_computes_once_then_hits() {
        let cache = CacheStore::default();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let lookup = cache
                .get_or_compute("content:structure:flat:00", CacheCategory::Content, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(lookup.value, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test]
    async fn read_through_errors_are_not_cached() {
        let cache = CacheStore::default();
        let result = cache
            .get_or_compute::<u32, _, _, _>("api:status", CacheCategory::Api, || async {
                Err(std::io::Error::other("backend down"))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_all_observe_complete_values() {
        let cache = Arc::new(CacheStore::default());
        let tasks = (0..8).map(|i| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("query:pages:find_many:0", CacheCategory::Query, || async move {
                        tokio::task::yield_now().await;
                        Ok::<_, std::io::Error>(vec![i; 4])
                    })
                    .await
                    .unwrap()
                    .value
            })
        });
        for result in futures::future::join_all(tasks).await {
            let value = result.unwrap();
            assert_eq!(value.len(), 4);
            assert!(value.iter().all(|v| *v == value[0]));
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_in_background() {
        let cache = Arc::new(CacheStore::default());
        cache.set("session:abc", &1, SetOptions::ttl(Duration::from_secs(1))).unwrap();
        let handle = cache.spawn_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 0);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(handle.is_finished());
    }
}
