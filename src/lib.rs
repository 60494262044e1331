//! # QueryGate
//!
//! A query-execution gateway between clients and an external graph/ontology
//! query engine.
//!
//! ## Pipeline
//! ```text
//! Query
//!     ↓
//! [Validation]            → ValidationError (before scheduling)
//!     ↓
//! [Worker pool slot]      → TimeoutError if none frees up in time
//!     ↓
//! [QueryEngine::run]      → RawResult (abandoned, not killed, on timeout)
//!     ↓
//! [Aggregation guard]     → local re-aggregation when the engine returns
//!     ↓                     identifiers in aggregate columns
//! ExecutionResult
//!     ↓
//! [Adaptive result cache] → Full result, or Summary + cache id
//! ```
//!
//! A separate [`RateLimiter`] gates calls to downstream metered APIs.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use querygate::{Config, FsBlobStore, Query, QueryService, SparqlHttpEngine, SystemClock};
//!
//! let config = Config::load()?;
//! let engine = Arc::new(SparqlHttpEngine::new(&config.engine)?);
//! let store = Arc::new(FsBlobStore::new(&config.cache.dir)?);
//! let service = QueryService::new(config, engine, store, Arc::new(SystemClock))?;
//!
//! let delivery = service
//!     .execute(&Query::new("SELECT ?g (COUNT(?x) AS ?count) WHERE { ?x ?p ?g } GROUP BY ?g"))
//!     .await?;
//! let full = service.get(delivery.cache_id())?;
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod guard;
pub mod ledger;
pub mod query;
pub mod ratelimit;
pub mod service;
pub mod storage;
pub mod value;

pub use cache::{AdaptiveResultCache, CacheEntry, Delivery, SizeReport, Summary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{QueryEngine, SparqlHttpEngine};
pub use error::{
    EngineError, EngineErrorKind, ErrorKind, GatewayError, GatewayResult, RateLimitError,
    ValidationError, ValidationRule,
};
pub use execution::{CancelHandle, GatewayStats, QueryGateway, TimeoutError};
pub use ledger::{PatternLedger, PatternRecord};
pub use query::{ExecutionResult, Query, RawResult};
pub use ratelimit::{RateLimiter, RateLimiterStats};
pub use service::{QueryService, ServiceStats};
pub use storage::{BlobStore, FsBlobStore, MemoryBlobStore, StorageError};
pub use value::{Row, Scalar};
