//! Query and result types shared by every component.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::value::{Row, Scalar};

/// A submitted query. Immutable once handed to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    /// Positional parameters bound to `{{1}}`, `{{2}}`, ... placeholders
    #[serde(default)]
    pub parameters: Vec<Scalar>,
    /// Per-query budget; the configured default applies when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Query {
            text: text.into(),
            parameters: Vec::new(),
            timeout_seconds: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Scalar>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// Columns and rows exactly as an engine produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RawResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        RawResult { columns, rows }
    }

    /// Position of a column, ignoring a leading `?`/`$` on either side.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let wanted = strip_var(name);
        self.columns.iter().position(|c| strip_var(c) == wanted)
    }

    /// Check column uniqueness and row arity.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(strip_var(column)) {
                return Err(EngineError::protocol(format!(
                    "duplicate column '{column}' in engine result"
                )));
            }
        }
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(EngineError::protocol(format!(
                    "row {i} has {} values but the result has {} columns",
                    row.len(),
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }
}

fn strip_var(name: &str) -> &str {
    name.trim_start_matches(['?', '$'])
}

/// Normalised result handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique, in projection order
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub elapsed_millis: u64,
    /// Rows were cut at the configured row limit
    pub truncated: bool,
    /// Aggregates were recomputed locally after a defective engine answer
    #[serde(default)]
    pub aggregation_corrected: bool,
}

impl ExecutionResult {
    pub fn from_raw(raw: RawResult, elapsed_millis: u64) -> Self {
        ExecutionResult {
            columns: raw.columns.into_iter().map(|c| strip_var(&c).to_string()).collect(),
            rows: raw.rows,
            elapsed_millis,
            truncated: false,
            aggregation_corrected: false,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        let wanted = strip_var(name);
        self.columns.iter().position(|c| c == wanted)
    }

    /// Keep at most `max_rows` rows, flagging the result when rows were dropped.
    pub fn truncate_rows(&mut self, max_rows: usize) {
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            self.truncated = true;
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*(\d+)\s*\}\}").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Highest placeholder index referenced by `text` (0 when there are none).
pub fn placeholder_count(text: &str) -> usize {
    placeholder_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<usize>().ok()))
        .max()
        .unwrap_or(0)
}

/// Substitute `{{N}}` placeholders with SPARQL renderings of `parameters`.
///
/// Placeholders without a matching parameter are left untouched; validation
/// rejects such queries before they reach an engine.
pub fn bind_parameters(text: &str, parameters: &[Scalar]) -> String {
    if parameters.is_empty() {
        return text.to_string();
    }
    placeholder_re()
        .replace_all(text, |caps: &Captures<'_>| {
            let index = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .unwrap_or(0);
            match index.checked_sub(1).and_then(|i| parameters.get(i)) {
                Some(value) => value.to_sparql_literal(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
