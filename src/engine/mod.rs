//! Query engine capability.
//!
//! The gateway never talks to a graph store directly; it calls whatever
//! [`QueryEngine`] it was constructed with.

mod sparql;

pub use sparql::{parse_sparql_results, SparqlHttpEngine};

use async_trait::async_trait;

use crate::error::EngineError;
use crate::execution::CancelHandle;
use crate::query::RawResult;
use crate::value::Scalar;

/// External engine executing a declarative query and returning tabular rows.
///
/// Called concurrently from up to `pool_size` gateway tasks; implementations
/// serialize internally if they need to. `cancel` fires when the caller has
/// given up; honouring it is optional.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn run(
        &self,
        text: &str,
        parameters: &[Scalar],
        cancel: &CancelHandle,
    ) -> Result<RawResult, EngineError>;
}
