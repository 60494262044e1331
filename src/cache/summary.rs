//! Bounded summaries of large results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::ExecutionResult;
use crate::value::Row;

/// Numeric profile of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    #[serde(with = "crate::value::float_repr")]
    pub min: f64,
    #[serde(with = "crate::value::float_repr")]
    pub max: f64,
    #[serde(with = "crate::value::float_repr")]
    pub avg: f64,
    /// Non-null values seen
    pub count: u64,
}

/// Compact stand-in for a result too large to hand to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub row_count: usize,
    pub columns: Vec<String>,
    /// Prefix of the rows, at most the configured sample size
    pub sample_rows: Vec<Row>,
    /// Only for columns whose every non-null value is numeric
    pub per_column_stats: BTreeMap<String, ColumnStats>,
    pub estimated_tokens: u64,
}

impl Summary {
    pub fn build(result: &ExecutionResult, sample_rows: usize, estimated_tokens: u64) -> Self {
        let per_column_stats = result
            .columns
            .iter()
            .enumerate()
            .filter_map(|(i, name)| column_stats(result, i).map(|s| (name.clone(), s)))
            .collect();

        Summary {
            row_count: result.rows.len(),
            columns: result.columns.clone(),
            sample_rows: result.rows.iter().take(sample_rows).cloned().collect(),
            per_column_stats,
            estimated_tokens,
        }
    }
}

fn column_stats(result: &ExecutionResult, index: usize) -> Option<ColumnStats> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0u64;

    for value in result.rows.iter().filter_map(|row| row.get(index)) {
        if value.is_null() {
            continue;
        }
        let x = value.as_f64()?;
        min = min.min(x);
        max = max.max(x);
        sum += x;
        count += 1;
    }

    (count > 0).then(|| ColumnStats {
        min,
        max,
        avg: sum / count as f64,
        count,
    })
}

/// Approximate token cost of delivering `result`: its serialized length
/// divided by `bytes_per_token`. A policy heuristic, not a tokenizer.
pub fn estimate_tokens(result: &ExecutionResult, bytes_per_token: u64) -> u64 {
    let bytes = serde_json::to_vec(result).map_or(0, |b| b.len() as u64);
    tokens_for_bytes(bytes, bytes_per_token)
}

pub(crate) fn tokens_for_bytes(bytes: u64, bytes_per_token: u64) -> u64 {
    bytes / bytes_per_token.max(1)
}
