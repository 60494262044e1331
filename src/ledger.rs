//! Pattern ledger: a bounded record of what was queried and how it went.
//!
//! Records feed suggestions for callers. They never influence execution.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::LedgerConfig;
use crate::storage::StorageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Aggregation,
    Grouping,
    SimpleSelect,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub query_shape_hash: String,
    pub classification: Classification,
    pub outcome: Outcome,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Query text, kept so suggestions can show an example
    #[serde(default)]
    pub query_text: String,
}

impl PatternRecord {
    pub fn success(query_text: &str, row_count: usize, timestamp: DateTime<Utc>) -> Self {
        Self::new(query_text, Outcome::Success, row_count, None, timestamp)
    }

    pub fn failure(query_text: &str, error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(query_text, Outcome::Failure, 0, Some(error.into()), timestamp)
    }

    fn new(
        query_text: &str,
        outcome: Outcome,
        row_count: usize,
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        PatternRecord {
            query_shape_hash: shape_hash(query_text),
            classification: classify(query_text),
            outcome,
            row_count,
            error_message,
            timestamp,
            query_text: query_text.to_string(),
        }
    }
}

/// Success/failure counts for one classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: u64,
    pub failure: u64,
}

macro_rules! shape_regex {
    ($name:ident, $pattern:literal) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| {
                Regex::new($pattern).unwrap_or_else(|e| unreachable!("static regex: {e}"))
            })
        }
    };
}

shape_regex!(string_literal_re, r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#);
shape_regex!(iri_re, r"<[^<>\s]*>");
shape_regex!(number_re, r"\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b");
shape_regex!(whitespace_re, r"\s+");
shape_regex!(aggregate_re, r"(?i)\b(?:COUNT|SUM|AVG|MIN|MAX)\s*\(");
shape_regex!(group_by_re, r"(?i)\bGROUP\s+BY\b");
shape_regex!(select_re, r"(?i)\bSELECT\b");

/// Query text with literals, IRIs and numbers replaced by placeholders,
/// whitespace collapsed and case folded.
pub fn normalize_shape(query_text: &str) -> String {
    let text = string_literal_re().replace_all(query_text, " ?lit ");
    let text = iri_re().replace_all(&text, " ?iri ");
    let text = number_re().replace_all(&text, " ?num ");
    whitespace_re()
        .replace_all(&text, " ")
        .trim()
        .to_lowercase()
}

/// First 16 hex chars of the SHA-256 of the normalized query.
pub fn shape_hash(query_text: &str) -> String {
    let digest = Sha256::digest(normalize_shape(query_text).as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

pub fn classify(query_text: &str) -> Classification {
    if aggregate_re().is_match(query_text) {
        Classification::Aggregation
    } else if group_by_re().is_match(query_text) {
        Classification::Grouping
    } else if select_re().is_match(query_text) {
        Classification::SimpleSelect
    } else {
        Classification::Other
    }
}

/// Ring buffer of the last `retention` records, optionally mirrored to a
/// JSON-lines file.
pub struct PatternLedger {
    retention: usize,
    records: Mutex<VecDeque<PatternRecord>>,
    path: Option<PathBuf>,
    /// Held for the whole append so lines from concurrent records never interleave
    append: Mutex<()>,
}

impl PatternLedger {
    pub fn new(config: &LedgerConfig) -> Self {
        PatternLedger {
            retention: config.retention.max(1),
            records: Mutex::new(VecDeque::new()),
            path: config.path.clone(),
            append: Mutex::new(()),
        }
    }

    /// Open a ledger, loading the last `retention` records from its file.
    pub fn load(config: &LedgerConfig) -> StorageResult<Self> {
        let ledger = Self::new(config);
        let Some(path) = &ledger.path else {
            return Ok(ledger);
        };
        if !path.exists() {
            return Ok(ledger);
        }

        let reader = BufReader::new(File::open(path)?);
        let mut records = ledger.records.lock();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PatternRecord>(&line) {
                Ok(record) => {
                    if records.len() == ledger.retention {
                        records.pop_front();
                    }
                    records.push_back(record);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping malformed ledger line"),
            }
        }
        drop(records);
        Ok(ledger)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record, dropping the oldest beyond retention.
    ///
    /// The in-memory record is kept even when the file append fails. With a
    /// file configured this does blocking I/O.
    pub fn record(&self, record: PatternRecord) -> StorageResult<()> {
        let line = self
            .path
            .as_ref()
            .map(|_| serde_json::to_string(&record).map(|json| format!("{json}\n")))
            .transpose()?;

        {
            let mut records = self.records.lock();
            if records.len() == self.retention {
                records.pop_front();
            }
            records.push_back(record);
        }

        if let (Some(path), Some(line)) = (&self.path, line) {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let _append = self.append.lock();
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records oldest first
    pub fn records(&self) -> Vec<PatternRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Recent successful records of the same classification as `query_text`,
    /// same-shape records first, newest first within each group.
    pub fn suggest(&self, query_text: &str, limit: usize) -> Vec<PatternRecord> {
        let classification = classify(query_text);
        let hash = shape_hash(query_text);

        let mut matches: Vec<PatternRecord> = self
            .records
            .lock()
            .iter()
            .rev()
            .filter(|r| r.outcome == Outcome::Success && r.classification == classification)
            .cloned()
            .collect();
        // Stable: keeps newest-first inside each group
        matches.sort_by_key(|r| r.query_shape_hash != hash);
        matches.truncate(limit);
        matches
    }

    pub fn summary(&self) -> BTreeMap<Classification, OutcomeCounts> {
        let mut summary: BTreeMap<Classification, OutcomeCounts> = BTreeMap::new();
        for record in self.records.lock().iter() {
            let counts = summary.entry(record.classification).or_default();
            match record.outcome {
                Outcome::Success => counts.success += 1,
                Outcome::Failure => counts.failure += 1,
            }
        }
        summary
    }
}
