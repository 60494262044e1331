//! Query Execution Module
//!
//! [`QueryGateway`] runs queries against the injected [`QueryEngine`] with:
//! - Structural validation before scheduling
//! - A fixed pool of worker slots bounding concurrent engine calls
//! - One deadline per call, covering slot wait, engine call and fallback
//! - Cooperative cancellation and abandonment of timed-out calls
//! - The aggregation guard and its local re-aggregation fallback

mod inflight;
mod timeout;
mod validate;

pub use inflight::{Completion, InFlightGuard, InFlightRegistry, InFlightSnapshot};
pub use timeout::{CancelHandle, QueryTimeout, TimeoutError};
pub use validate::{effective_timeout, validate_query};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::engine::QueryEngine;
use crate::error::{EngineError, EngineErrorKind, GatewayError, GatewayResult};
use crate::guard::{self, AggregationPlan};
use crate::ledger::{PatternLedger, PatternRecord};
use crate::query::{ExecutionResult, Query, RawResult};
use crate::storage::StorageError;
use crate::value::Scalar;

use inflight::duration_millis;

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    /// Calls that returned a result
    pub executed: u64,
    /// Calls that returned any error, timeouts included
    pub failed: u64,
    pub timed_out: u64,
    /// Results whose aggregates were recomputed locally
    pub corrected: u64,
    /// Engine calls given up on at the deadline
    pub abandoned: u64,
    /// Abandoned calls that later finished and had their result dropped
    pub late_discarded: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    executed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    corrected: AtomicU64,
    abandoned: AtomicU64,
    late_discarded: AtomicU64,
}

/// Bounded, deadline-aware front door to the query engine.
///
/// Construct one per engine and share it by reference (or `Arc`); there is
/// no process-wide instance.
pub struct QueryGateway {
    config: GatewayConfig,
    engine: Arc<dyn QueryEngine>,
    slots: Arc<Semaphore>,
    in_flight: Arc<InFlightRegistry>,
    counters: Arc<Counters>,
    ledger: Option<Arc<PatternLedger>>,
    clock: Arc<dyn Clock>,
}

impl QueryGateway {
    pub fn new(config: GatewayConfig, engine: Arc<dyn QueryEngine>) -> Self {
        let pool_size = config.pool_size.max(1);
        QueryGateway {
            config,
            engine,
            slots: Arc::new(Semaphore::new(pool_size)),
            in_flight: Arc::new(InFlightRegistry::new()),
            counters: Arc::new(Counters::default()),
            ledger: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Record every execution in `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<PatternLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Time source for ledger timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn ledger(&self) -> Option<&Arc<PatternLedger>> {
        self.ledger.as_ref()
    }

    /// Worker slots not currently held by an engine call
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_flight(&self) -> Vec<InFlightSnapshot> {
        self.in_flight.snapshot()
    }

    pub fn stats(&self) -> GatewayStats {
        let c = &self.counters;
        GatewayStats {
            executed: c.executed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            corrected: c.corrected.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            late_discarded: c.late_discarded.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }

    /// Validate, schedule and run `query`, correcting defective aggregates.
    ///
    /// Returns within the query's timeout (plus scheduling jitter) or fails
    /// with [`GatewayError::Timeout`]. A timed-out engine call keeps its
    /// worker slot until it actually finishes.
    pub async fn execute(&self, query: &Query) -> GatewayResult<ExecutionResult> {
        let outcome = self.execute_inner(query).await;

        match &outcome {
            Ok(result) => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    rows = result.row_count(),
                    elapsed_ms = result.elapsed_millis,
                    corrected = result.aggregation_corrected,
                    "Query executed"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(
                    e,
                    GatewayError::Timeout(_) | GatewayError::AggregationFallbackTimeout { .. }
                ) {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                debug!(error = %e, "Query failed");
            }
        }

        self.record_pattern(query, &outcome).await;
        outcome
    }

    async fn execute_inner(&self, query: &Query) -> GatewayResult<ExecutionResult> {
        validate_query(query, &self.config)?;

        let deadline = QueryTimeout::new(effective_timeout(query, &self.config));
        let raw = self
            .run_once(&query.text, &query.parameters, &deadline)
            .await?;
        raw.validate()?;

        let (raw, corrected) = if guard::detect(&query.text, &raw) {
            (self.correct_aggregation(query, &deadline).await?, true)
        } else {
            (raw, false)
        };

        let mut result = ExecutionResult::from_raw(raw, duration_millis(deadline.elapsed()));
        result.aggregation_corrected = corrected;
        if self.config.max_result_rows > 0 {
            result.truncate_rows(self.config.max_result_rows);
        }
        Ok(result)
    }

    /// Re-run the query without aggregation and aggregate the raw tuples here.
    async fn correct_aggregation(
        &self,
        query: &Query,
        deadline: &QueryTimeout,
    ) -> GatewayResult<RawResult> {
        let plan = AggregationPlan::parse(&query.text).ok_or_else(|| {
            EngineError::protocol(
                "aggregate column holds identifiers and the query cannot be re-aggregated locally",
            )
        })?;

        let remaining = deadline.remaining();
        if remaining < self.config.fallback_min_budget() {
            warn!(
                remaining_ms = duration_millis(remaining),
                "Not enough budget left for the aggregation fallback"
            );
            return Err(GatewayError::AggregationFallbackTimeout { remaining });
        }

        let rewritten = guard::rewrite(&query.text);
        info!(query = %rewritten, "Aggregate result is defective, re-running without aggregation");

        let raw = self
            .run_once(&rewritten, &query.parameters, deadline)
            .await
            .map_err(|e| match e {
                GatewayError::Timeout(_) => GatewayError::AggregationFallbackTimeout {
                    remaining: deadline.remaining(),
                },
                other => other,
            })?;
        raw.validate()?;

        self.counters.corrected.fetch_add(1, Ordering::Relaxed);
        Ok(plan.aggregate(&raw))
    }

    /// One engine call through the worker pool, bounded by `deadline`.
    async fn run_once(
        &self,
        text: &str,
        parameters: &[Scalar],
        deadline: &QueryTimeout,
    ) -> GatewayResult<RawResult> {
        let permit = tokio::time::timeout_at(
            deadline.deadline(),
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        .map_err(|_| {
            debug!("No worker slot before the deadline");
            deadline.error()
        })?
        .map_err(|_| EngineError::with_kind(EngineErrorKind::Other, "worker pool closed"))?;

        let guard = self.in_flight.register(text);
        let call_id = guard.id();
        let (tx, rx) = oneshot::channel();

        let engine = Arc::clone(&self.engine);
        let counters = Arc::clone(&self.counters);
        let cancel = deadline.cancel_handle();
        let text = text.to_string();
        let parameters = parameters.to_vec();

        tokio::spawn(async move {
            let outcome = engine.run(&text, &parameters, &cancel).await;
            // The slot frees only once the engine is actually done
            drop(permit);

            match guard.finish() {
                Completion::Deliver => {
                    let _ = tx.send(outcome);
                }
                Completion::Abandoned { ran_for, preview } => {
                    counters.late_discarded.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        call_id,
                        ran_for_ms = duration_millis(ran_for),
                        query = %preview,
                        succeeded = outcome.is_ok(),
                        "Discarding late result of abandoned query"
                    );
                }
            }
        });

        match tokio::time::timeout_at(deadline.deadline(), rx).await {
            Ok(Ok(outcome)) => Ok(outcome?),
            Ok(Err(_)) => Err(EngineError::with_kind(
                EngineErrorKind::Other,
                "engine task ended without a result",
            )
            .into()),
            Err(_) => {
                if self.in_flight.abandon(call_id) {
                    self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                }
                deadline.cancel();
                let err = deadline.error();
                warn!(
                    call_id,
                    timeout_ms = duration_millis(err.timeout),
                    "Query timed out, abandoning engine call"
                );
                Err(err.into())
            }
        }
    }

    async fn record_pattern(&self, query: &Query, outcome: &GatewayResult<ExecutionResult>) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let now = self.clock.wall();
        let record = match outcome {
            Ok(result) => PatternRecord::success(&query.text, result.row_count(), now),
            Err(e) => PatternRecord::failure(&query.text, e.to_string(), now),
        };
        let recorded = if ledger.path().is_some() {
            // File appends stay off the runtime's worker threads
            let ledger = Arc::clone(ledger);
            tokio::task::spawn_blocking(move || ledger.record(record))
                .await
                .unwrap_or_else(|e| Err(StorageError::Other(format!("ledger task failed: {e}"))))
        } else {
            ledger.record(record)
        };
        if let Err(e) = recorded {
            warn!(error = %e, "Failed to record query pattern");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::error::ValidationRule;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedEngine {
        delay: Duration,
        columns: Vec<&'static str>,
        rows: Vec<Vec<Scalar>>,
    }

    #[async_trait]
    impl QueryEngine for FixedEngine {
        async fn run(
            &self,
            _text: &str,
            _parameters: &[Scalar],
            _cancel: &CancelHandle,
        ) -> Result<RawResult, EngineError> {
            tokio::time::sleep(self.delay).await;
            Ok(RawResult::new(
                self.columns.iter().map(|c| c.to_string()).collect(),
                self.rows.clone(),
            ))
        }
    }

    fn gateway(delay: Duration, rows: usize) -> QueryGateway {
        let engine = FixedEngine {
            delay,
            columns: vec!["?s"],
            rows: (0..rows).map(|i| vec![Scalar::Int(i as i64)]).collect(),
        };
        QueryGateway::new(GatewayConfig::default(), Arc::new(engine))
    }

    #[tokio::test]
    async fn test_execute_returns_normalized_result() {
        let gateway = gateway(Duration::ZERO, 3);
        let result = gateway
            .execute(&Query::new("SELECT ?s WHERE { ?s ?p ?o }"))
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["s"]);
        assert_eq!(result.row_count(), 3);
        assert!(!result.truncated);
        assert_eq!(gateway.stats().executed, 1);
    }

    #[tokio::test]
    async fn test_row_limit_truncates() {
        let mut gateway = gateway(Duration::ZERO, 10);
        gateway.config.max_result_rows = 4;
        let result = gateway
            .execute(&Query::new("SELECT ?s WHERE { ?s ?p ?o }"))
            .await
            .unwrap();
        assert_eq!(result.row_count(), 4);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_validation_fails_before_scheduling() {
        let gateway = gateway(Duration::ZERO, 1);
        let err = gateway.execute(&Query::new("   ")).await.unwrap_err();
        match err {
            GatewayError::Validation(v) => assert_eq!(v.rule, ValidationRule::EmptyQuery),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(gateway.in_flight().is_empty());
        assert_eq!(gateway.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_call_and_holds_slot() {
        let mut gateway = gateway(Duration::from_secs(5), 1);
        gateway.config.pool_size = 1;
        gateway.slots = Arc::new(Semaphore::new(1));

        let err = gateway
            .execute(&Query::new("SELECT ?s WHERE { ?s ?p ?o }").with_timeout(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));

        // Still running in the background
        assert_eq!(gateway.available_slots(), 0);
        assert_eq!(gateway.in_flight().len(), 1);
        assert!(gateway.in_flight()[0].abandoned);

        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(gateway.available_slots(), 1);
        let stats = gateway.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.late_discarded, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_ledger_records_success_and_failure() {
        let ledger = Arc::new(PatternLedger::new(&LedgerConfig::default()));
        let gateway = gateway(Duration::ZERO, 2).with_ledger(Arc::clone(&ledger));

        gateway
            .execute(&Query::new("SELECT ?s WHERE { ?s ?p ?o }"))
            .await
            .unwrap();
        let _ = gateway.execute(&Query::new("SELECT ?s WHERE { ?s ?p ?o")).await;

        let records = ledger.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row_count, 2);
        assert!(records[1].error_message.is_some());
    }
}
