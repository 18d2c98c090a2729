//! Query result cache
//!
//! Keyed by normalized statement text plus canonical parameter JSON.
//! Entries are TTL-bound; at capacity an arbitrary entry is evicted rather
//! than maintaining LRU order, which the TTL bound makes acceptable.
//! Only committed read results are ever stored, so a cache hit can never
//! observe an uncommitted write.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::QueryCacheConfig;
use crate::statement::{Row, normalize};

#[derive(Debug, Clone)]
struct CacheEntry {
    rows: Arc<Vec<Row>>,
    inserted_at: Instant,
}

/// Hit/miss accounting for reports
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

/// TTL- and size-bounded result cache
#[derive(Debug)]
pub struct QueryCache {
    config: QueryCacheConfig,
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl QueryCache {
    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Cache key for a statement and its parameters
    pub fn key(sql: &str, params: &[Value]) -> String {
        let params_json =
            serde_json::to_string(params).unwrap_or_else(|_| "[]".to_string());
        format!("{}|{}", normalize(sql), params_json)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a fresh entry, expiring it in place when past TTL
    pub fn get(&mut self, key: &str) -> Option<Arc<Vec<Row>>> {
        if !self.config.enabled {
            return None;
        }
        let ttl = self.config.ttl();
        match self.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= ttl => {
                self.hits += 1;
                Some(entry.rows.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store a committed read result, evicting an arbitrary entry at
    /// capacity
    pub fn put(&mut self, key: String, rows: Arc<Vec<Row>>) {
        if !self.config.enabled || self.config.max_entries == 0 {
            return;
        }
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&key) {
            if let Some(victim) = self.entries.keys().next().cloned() {
                self.entries.remove(&victim);
                self.evictions += 1;
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                rows,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry whose TTL has lapsed
    pub fn prune_expired(&mut self) {
        let ttl = self.config.ttl();
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Swap in a new sizing configuration, clearing existing entries
    pub fn reconfigure(&mut self, config: QueryCacheConfig) {
        self.config = config;
        self.entries.clear();
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
            evictions: self.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache(max_entries: usize, ttl_ms: u64) -> QueryCache {
        QueryCache::new(QueryCacheConfig {
            enabled: true,
            max_entries,
            ttl_ms,
        })
    }

    fn rows(marker: i64) -> Arc<Vec<Row>> {
        let mut row = Row::new();
        row.insert("v".to_string(), Value::from(marker));
        Arc::new(vec![row])
    }

    #[test]
    fn test_key_ignores_formatting_but_not_params() {
        let a = QueryCache::key("SELECT * FROM files", &[Value::from(1)]);
        let b = QueryCache::key("select *  from files", &[Value::from(1)]);
        let c = QueryCache::key("SELECT * FROM files", &[Value::from(2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hit_within_ttl_returns_identical_rows() {
        let mut cache = cache(10, 60_000);
        let key = QueryCache::key("SELECT 1", &[]);
        cache.put(key.clone(), rows(7));

        let hit = cache.get(&key).expect("fresh entry must hit");
        assert_eq!(hit[0]["v"], Value::from(7));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let mut cache = cache(10, 20);
        let key = QueryCache::key("SELECT 1", &[]);
        cache.put(key.clone(), rows(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_capacity_evicts_some_entry() {
        let mut cache = cache(2, 60_000);
        cache.put("a".to_string(), rows(1));
        cache.put("b".to_string(), rows(2));
        cache.put("c".to_string(), rows(3));
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
        assert!(cache.get("c").is_some(), "newest entry must survive");
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let mut cache = QueryCache::new(QueryCacheConfig {
            enabled: false,
            max_entries: 10,
            ttl_ms: 60_000,
        });
        cache.put("a".to_string(), rows(1));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_reconfigure_clears() {
        let mut cache = cache(10, 60_000);
        cache.put("a".to_string(), rows(1));
        cache.reconfigure(QueryCacheConfig {
            enabled: true,
            max_entries: 5,
            ttl_ms: 1000,
        });
        assert_eq!(cache.stats().entries, 0);
    }
}
