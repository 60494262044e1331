//! End-to-end tests of the service facade with an in-process engine and
//! blob store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use querygate::ledger::{Classification, Outcome, PatternLedger};
use querygate::{
    CancelHandle, Config, Delivery, EngineError, ErrorKind, ManualClock, MemoryBlobStore,
    QueryEngine, Query, QueryService, RawResult, Scalar,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Returns `rows` rows of (entity, value) for any query mentioning `?v`,
/// and a syntax error otherwise.
struct TableEngine {
    rows: i64,
}

#[async_trait]
impl QueryEngine for TableEngine {
    async fn run(
        &self,
        text: &str,
        _parameters: &[Scalar],
        _cancel: &CancelHandle,
    ) -> Result<RawResult, EngineError> {
        if !text.contains("?v") {
            return Err(EngineError::new("syntax error near WHERE"));
        }
        Ok(RawResult::new(
            vec!["e".into(), "v".into()],
            (0..self.rows)
                .map(|i| vec![Scalar::iri(format!("http://ex.org/{i}")), Scalar::Int(i)])
                .collect(),
        ))
    }
}

fn service_with(config: Config, rows: i64) -> (QueryService, Arc<MemoryBlobStore>, ManualClock) {
    let store = Arc::new(MemoryBlobStore::new());
    let clock = ManualClock::new();
    let service = QueryService::new(
        config,
        Arc::new(TableEngine { rows }),
        store.clone(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    (service, store, clock)
}

const QUERY: &str = "SELECT ?e ?v WHERE { ?e <http://ex.org/value> ?v }";

// ============================================================================
// Execute / Get
// ============================================================================

#[tokio::test]
async fn test_small_result_is_delivered_whole_and_cached() {
    let (service, _store, _clock) = service_with(Config::default(), 3);

    let delivery = service.execute(&Query::new(QUERY)).await.unwrap();
    let Delivery::Full { cache_id, result } = delivery else {
        panic!("expected full delivery");
    };
    assert_eq!(result.row_count(), 3);
    assert_eq!(service.get(&cache_id).unwrap(), result);
    assert_eq!(service.check_size().entries.len(), 1);
}

#[tokio::test]
async fn test_large_result_is_summarized() {
    let mut config = Config::default();
    config.cache.summary_token_threshold = 50;
    config.cache.sample_rows = 5;
    let (service, _store, _clock) = service_with(config, 500);

    let delivery = service.execute(&Query::new(QUERY)).await.unwrap();
    let Delivery::Summarized {
        cache_id,
        summary,
        truncated_for_delivery,
    } = delivery
    else {
        panic!("expected summary");
    };
    assert!(truncated_for_delivery);
    assert_eq!(summary.row_count, 500);
    assert_eq!(summary.sample_rows.len(), 5);
    let stats = &summary.per_column_stats["v"];
    assert_eq!(stats.min, 0.0);
    assert_eq!(stats.max, 499.0);

    assert_eq!(service.get(&cache_id).unwrap().row_count(), 500);
}

#[tokio::test]
async fn test_engine_failure_is_not_cached() {
    let (service, store, _clock) = service_with(Config::default(), 3);
    let err = service
        .execute(&Query::new("SELECT ?e WHERE { ?e ?p ?o }"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_store_outage_fails_execute() {
    let (service, store, _clock) = service_with(Config::default(), 3);
    store.set_offline(true);
    let err = service.execute(&Query::new(QUERY)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
}

#[tokio::test]
async fn test_clear_then_get_is_not_found() {
    let (service, _store, _clock) = service_with(Config::default(), 3);
    let delivery = service.execute(&Query::new(QUERY)).await.unwrap();

    assert_eq!(service.clear(Some(Duration::ZERO)).unwrap(), 1);
    let err = service.get(delivery.cache_id()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// Ledger and Stats
// ============================================================================

#[tokio::test]
async fn test_every_execution_is_recorded() {
    let (service, _store, _clock) = service_with(Config::default(), 2);
    service.execute(&Query::new(QUERY)).await.unwrap();
    let _ = service.execute(&Query::new("SELECT ?e WHERE { ?e ?p ?o }")).await;
    let _ = service.execute(&Query::new("")).await;

    let records = service.ledger().records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].outcome, Outcome::Success);
    assert_eq!(records[1].outcome, Outcome::Failure);
    assert_eq!(records[2].outcome, Outcome::Failure);

    let stats = service.stats();
    assert_eq!(stats.gateway.executed, 1);
    assert_eq!(stats.gateway.failed, 2);
    assert_eq!(stats.cache_entries, 1);
    assert_eq!(stats.patterns[&Classification::SimpleSelect].success, 1);
}

#[tokio::test]
async fn test_suggest_returns_same_shape_success() {
    let (service, _store, _clock) = service_with(Config::default(), 2);
    service.execute(&Query::new(QUERY)).await.unwrap();

    let suggestions = service.suggest(
        "SELECT ?e ?v WHERE { ?e <http://ex.org/other> ?v }",
        3,
    );
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].query_text, QUERY);
}

#[tokio::test]
async fn test_ledger_append_failure_does_not_fail_query() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("patterns.jsonl");

    let mut config = Config::default();
    config.ledger.path = Some(path.clone());
    let (service, _store, _clock) = service_with(config, 1);

    // A directory where the ledger file should be makes every append fail
    std::fs::create_dir_all(&path).unwrap();

    let delivery = service.execute(&Query::new(QUERY)).await.unwrap();
    assert!(!delivery.is_summarized());
    assert_eq!(service.ledger().len(), 1);
}

#[test]
fn test_ledger_is_reloaded_on_startup() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.ledger.path = Some(temp.path().join("patterns.jsonl"));

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let (service, _store, _clock) = service_with(config.clone(), 1);
        service.execute(&Query::new(QUERY)).await.unwrap();
    });

    let reloaded = PatternLedger::load(&config.ledger).unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded.records()[0].query_text, QUERY);
}

#[tokio::test]
async fn test_acquire_uses_configured_bucket() {
    let mut config = Config::default();
    config.rate_limit.capacity = 2;
    config.rate_limit.requests_per_minute = 60;
    let (service, _store, clock) = service_with(config, 1);

    assert_eq!(service.acquire(2).await.unwrap(), Duration::ZERO);
    let waited = service.acquire(1).await.unwrap();
    assert!((waited.as_secs_f64() - 1.0).abs() < 1e-3);
    assert!((clock.elapsed().as_secs_f64() - 1.0).abs() < 1e-3);
    assert!(service.acquire(3).await.is_err());
}

// ============================================================================
// Background Tasks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_background_cleanup_runs_only_when_configured() {
    let (service, _store, _clock) = service_with(Config::default(), 1);
    assert!(!service.start_background_tasks());

    let mut config = Config::default();
    config.cache.max_age_secs = 60;
    config.cache.cleanup_interval_secs = 5;
    let (service, store, clock) = service_with(config, 1);
    assert!(service.start_background_tasks());
    assert!(!service.start_background_tasks());

    service.execute(&Query::new(QUERY)).await.unwrap();
    clock.advance(Duration::from_secs(61));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(store.is_empty());

    service.shutdown().await;
}
