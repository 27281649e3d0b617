//! Pruning cadence and aggressiveness
//!
//! A [`CachePolicy`] is a set of pure predicates consulted by the
//! persistence manager after server updates. It never touches storage.

/// Server updates between two cache size checks
pub const SERVER_UPDATES_BETWEEN_CACHE_SIZE_CHECKS: u64 = 1000;
/// Prunable query count above which pruning is warranted
pub const MAX_NUMBER_OF_PRUNABLE_QUERIES_TO_KEEP: u64 = 1000;
/// Fraction of prunable queries evicted per pruning pass
pub const PERCENT_OF_QUERIES_TO_PRUNE_AT_ONCE: f64 = 0.2;

/// Decides when to check the cache size and when to prune
pub trait CachePolicy: Send + Sync {
    /// True once enough updates have accumulated to re-check the size.
    fn should_check_cache_size(&self, server_updates_since_last_check: u64) -> bool;

    /// True when the cache should shrink.
    fn should_prune(&self, cache_size_bytes: u64, prunable_query_count: u64) -> bool;

    /// Fraction of prunable queries to evict per pass, in `[0, 1]`.
    fn percent_of_queries_to_prune_at_once(&self) -> f64;

    /// Upper bound on prunable queries surviving a pass.
    fn max_number_of_queries_to_keep(&self) -> u64;
}

/// Evicts least recently used queries once the cache outgrows a byte budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruCachePolicy {
    max_size_bytes: u64,
}

impl LruCachePolicy {
    /// Policy with a byte budget.
    pub fn new(max_size_bytes: u64) -> Self {
        LruCachePolicy { max_size_bytes }
    }

    /// Byte budget.
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }
}

impl CachePolicy for LruCachePolicy {
    fn should_check_cache_size(&self, server_updates_since_last_check: u64) -> bool {
        server_updates_since_last_check > SERVER_UPDATES_BETWEEN_CACHE_SIZE_CHECKS
    }

    fn should_prune(&self, cache_size_bytes: u64, prunable_query_count: u64) -> bool {
        cache_size_bytes > self.max_size_bytes
            || prunable_query_count > MAX_NUMBER_OF_PRUNABLE_QUERIES_TO_KEEP
    }

    fn percent_of_queries_to_prune_at_once(&self) -> f64 {
        PERCENT_OF_QUERIES_TO_PRUNE_AT_ONCE
    }

    fn max_number_of_queries_to_keep(&self) -> u64 {
        MAX_NUMBER_OF_PRUNABLE_QUERIES_TO_KEEP
    }
}

/// Never prunes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCachePolicy;

impl CachePolicy for NoopCachePolicy {
    fn should_check_cache_size(&self, _server_updates_since_last_check: u64) -> bool {
        false
    }

    fn should_prune(&self, _cache_size_bytes: u64, _prunable_query_count: u64) -> bool {
        false
    }

    fn percent_of_queries_to_prune_at_once(&self) -> f64 {
        0.0
    }

    fn max_number_of_queries_to_keep(&self) -> u64 {
        u64::MAX
    }
}
