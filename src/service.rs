//! Service facade: the operations the gateway offers upward.
//!
//! [`QueryService`] owns one gateway, cache, ledger and rate limiter, built
//! from a [`Config`] and the injected engine, blob store and clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::cache::{AdaptiveResultCache, CleanupTask, Delivery, SizeReport};
use crate::clock::Clock;
use crate::config::Config;
use crate::engine::QueryEngine;
use crate::error::{GatewayResult, RateLimitError};
use crate::execution::{GatewayStats, QueryGateway};
use crate::ledger::{Classification, OutcomeCounts, PatternLedger, PatternRecord};
use crate::query::{ExecutionResult, Query};
use crate::ratelimit::{RateLimiter, RateLimiterStats};
use crate::storage::BlobStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    pub gateway: GatewayStats,
    pub rate_limiter: RateLimiterStats,
    pub cache_entries: usize,
    pub patterns: BTreeMap<Classification, OutcomeCounts>,
}

pub struct QueryService {
    config: Config,
    gateway: QueryGateway,
    cache: Arc<AdaptiveResultCache>,
    ledger: Arc<PatternLedger>,
    limiter: RateLimiter,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl QueryService {
    /// Wire the service. Reopens existing cache entries and ledger records.
    pub fn new(
        config: Config,
        engine: Arc<dyn QueryEngine>,
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> GatewayResult<Self> {
        let ledger = Arc::new(PatternLedger::load(&config.ledger)?);
        let cache = Arc::new(AdaptiveResultCache::open(
            config.cache.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
        )?);
        let gateway = QueryGateway::new(config.gateway.clone(), engine)
            .with_ledger(Arc::clone(&ledger))
            .with_clock(Arc::clone(&clock));
        let limiter = RateLimiter::new(&config.rate_limit, clock);

        info!(
            pool_size = config.gateway.pool_size,
            cached_entries = cache.len(),
            "Query service ready"
        );

        Ok(QueryService {
            config,
            gateway,
            cache,
            ledger,
            limiter,
            cleanup: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &QueryGateway {
        &self.gateway
    }

    pub fn cache(&self) -> &Arc<AdaptiveResultCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<PatternLedger> {
        &self.ledger
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Start the age cleanup task when `cache.max_age_secs` is set.
    /// Must be called from within a tokio runtime. Returns false when
    /// cleanup is disabled or already running.
    pub fn start_background_tasks(&self) -> bool {
        let max_age = self.config.cache.max_age_secs;
        if max_age == 0 {
            return false;
        }
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return false;
        }
        *cleanup = Some(self.cache.spawn_age_cleanup(
            Duration::from_secs(max_age),
            Duration::from_secs(self.config.cache.cleanup_interval_secs.max(1)),
        ));
        true
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    /// Run `query` and cache the result, returning it whole or summarized.
    pub async fn execute(&self, query: &Query) -> GatewayResult<Delivery> {
        let result = self.gateway.execute(query).await?;
        let outcome = self.cache.put(query, &result).map_err(|e| {
            error!(error = %e, "Failed to cache query result");
            e
        })?;
        Ok(outcome.delivery)
    }

    pub fn get(&self, cache_id: &str) -> GatewayResult<ExecutionResult> {
        self.cache.get(cache_id)
    }

    pub fn check_size(&self) -> SizeReport {
        self.cache.check_size()
    }

    /// Delete every cache entry, or only those older than `older_than`.
    pub fn clear(&self, older_than: Option<Duration>) -> GatewayResult<usize> {
        Ok(self.cache.clear(older_than)?)
    }

    /// Gate a downstream metered call. Returns how long the caller waited.
    pub async fn acquire(&self, cost: u32) -> Result<Duration, RateLimitError> {
        self.limiter.acquire(cost).await
    }

    pub fn suggest(&self, query_text: &str, limit: usize) -> Vec<PatternRecord> {
        self.ledger.suggest(query_text, limit)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            gateway: self.gateway.stats(),
            rate_limiter: self.limiter.stats(),
            cache_entries: self.cache.len(),
            patterns: self.ledger.summary(),
        }
    }
}
