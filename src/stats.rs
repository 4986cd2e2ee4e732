//! Per-tenant prompt-cache statistics.
//!
//! The registry is process-wide and sharded by tenant-id hash so that
//! concurrent tenants never contend on the same lock. Reads return
//! snapshots; read-modify-write is atomic per tenant.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::sync::RwLock;

/// Cache hit/miss and savings counters for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// hits / max(1, total_requests)
    pub hit_rate: f64,
    /// Tokens served from backend prompt caches
    pub total_cached_tokens: u64,
    /// Cumulative savings versus uncached pricing, USD
    pub total_savings_usd: f64,
}

impl CacheStats {
    /// Record one cache-eligible request.
    ///
    /// A request counts as a hit when the backend reported any cache-read
    /// tokens; `savings` is the uncached-minus-actual cost difference.
    pub fn record(&mut self, hit: bool, cached_tokens: u64, savings: f64) {
        self.total_requests += 1;
        if hit {
            self.hits += 1;
            self.total_cached_tokens += cached_tokens;
            self.total_savings_usd += savings;
        } else {
            self.misses += 1;
        }
        self.hit_rate = self.hits as f64 / self.total_requests.max(1) as f64;
    }
}

const SHARD_COUNT: usize = 16;

/// Process-wide registry of per-tenant [`CacheStats`].
///
/// Tenants are created lazily on first record and live until explicitly
/// cleared. No lock spans more than one shard, so updates for different
/// tenants proceed independently.
pub struct CacheStatsRegistry {
    shards: Vec<RwLock<HashMap<String, CacheStats>>>,
}

impl CacheStatsRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, tenant_id: &str) -> &RwLock<HashMap<String, CacheStats>> {
        let mut hasher = DefaultHasher::new();
        tenant_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Record a cache-eligible request for a tenant.
    pub async fn record(&self, tenant_id: &str, hit: bool, cached_tokens: u64, savings: f64) {
        let mut shard = self.shard(tenant_id).write().await;
        shard
            .entry(tenant_id.to_string())
            .or_default()
            .record(hit, cached_tokens, savings);
    }

    /// Snapshot one tenant's stats. Tenants with no recorded requests
    /// report zeroed stats.
    pub async fn get(&self, tenant_id: &str) -> CacheStats {
        let shard = self.shard(tenant_id).read().await;
        shard.get(tenant_id).copied().unwrap_or_default()
    }

    /// Snapshot every tenant's stats.
    pub async fn all(&self) -> HashMap<String, CacheStats> {
        let mut out = HashMap::new();
        for shard in &self.shards {
            let shard = shard.read().await;
            for (tenant, stats) in shard.iter() {
                out.insert(tenant.clone(), *stats);
            }
        }
        out
    }

    /// Drop one tenant's stats.
    pub async fn clear(&self, tenant_id: &str) {
        let mut shard = self.shard(tenant_id).write().await;
        shard.remove(tenant_id);
    }

    /// Drop every tenant's stats.
    pub async fn clear_all(&self) {
        for shard in &self.shards {
            shard.write().await.clear();
        }
    }
}

impl Default for CacheStatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_maintains_invariants() {
        let mut stats = CacheStats::default();
        stats.record(true, 1000, 0.002);
        stats.record(false, 0, 0.0);
        stats.record(true, 500, 0.001);

        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.hits + stats.misses, stats.total_requests);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.total_cached_tokens, 1500);
        assert!((stats.total_savings_usd - 0.003).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_registry_lazy_creation_and_isolation() {
        let registry = CacheStatsRegistry::new();
        assert_eq!(registry.get("tenant-a").await, CacheStats::default());

        registry.record("tenant-a", true, 100, 0.001).await;
        registry.record("tenant-b", false, 0, 0.0).await;

        let a = registry.get("tenant-a").await;
        let b = registry.get("tenant-b").await;
        assert_eq!(a.hits, 1);
        assert_eq!(a.misses, 0);
        assert_eq!(b.hits, 0);
        assert_eq!(b.misses, 1);

        let all = registry.all().await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_zeroes_stats() {
        let registry = CacheStatsRegistry::new();
        registry.record("tenant-a", true, 100, 0.001).await;
        registry.record("tenant-b", true, 100, 0.001).await;

        registry.clear("tenant-a").await;
        assert_eq!(registry.get("tenant-a").await, CacheStats::default());
        assert_eq!(registry.get("tenant-b").await.hits, 1);

        registry.clear_all().await;
        assert!(registry.all().await.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn accounting_invariants_hold(
                events in proptest::collection::vec((any::<bool>(), 0u64..5000), 0..50)
            ) {
                let mut stats = CacheStats::default();
                for (hit, tokens) in events {
                    stats.record(hit, tokens, tokens as f64 * 1e-6);
                }
                prop_assert_eq!(stats.hits + stats.misses, stats.total_requests);
                if stats.total_requests > 0 {
                    let expected = stats.hits as f64 / stats.total_requests as f64;
                    prop_assert!((stats.hit_rate - expected).abs() < 1e-12);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_updates_same_tenant() {
        use std::sync::Arc;
        let registry = Arc::new(CacheStatsRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    registry.record("tenant-a", true, 10, 0.0001).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = registry.get("tenant-a").await;
        assert_eq!(stats.total_requests, 400);
        assert_eq!(stats.hits + stats.misses, stats.total_requests);
    }
}
