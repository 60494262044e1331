//! SPARQL 1.1 protocol client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::QueryEngine;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineErrorKind};
use crate::execution::CancelHandle;
use crate::query::{bind_parameters, RawResult};
use crate::value::{Row, Scalar};

const RESULTS_JSON: &str = "application/sparql-results+json";
const XSD: &str = "http://www.w3.org/2001/XMLSchema#";

/// Engine adaptor speaking the SPARQL HTTP protocol to a remote endpoint.
pub struct SparqlHttpEngine {
    client: reqwest::Client,
    endpoint: String,
}

impl SparqlHttpEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| EngineError::with_kind(EngineErrorKind::Connection, e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, query: &str) -> Result<RawResult, EngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, RESULTS_JSON)
            .form(&[("query", query)])
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    EngineErrorKind::Timeout
                } else if e.is_connect() {
                    EngineErrorKind::Connection
                } else {
                    EngineErrorKind::Other
                };
                EngineError::with_kind(kind, e.to_string())
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::protocol(e.to_string()))?;

        if !status.is_success() {
            // Endpoints put the parser message in the body
            let message = String::from_utf8_lossy(&body).trim().to_string();
            let kind = if status == reqwest::StatusCode::BAD_REQUEST {
                EngineErrorKind::Syntax
            } else {
                EngineErrorKind::classify(&message)
            };
            return Err(EngineError::with_kind(
                kind,
                format!("endpoint responded with {status}: {message}"),
            ));
        }

        parse_sparql_results(&body)
    }
}

#[async_trait]
impl QueryEngine for SparqlHttpEngine {
    async fn run(
        &self,
        text: &str,
        parameters: &[Scalar],
        cancel: &CancelHandle,
    ) -> Result<RawResult, EngineError> {
        let query = bind_parameters(text, parameters);
        debug!(endpoint = %self.endpoint, bytes = query.len(), "Sending SPARQL query");

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EngineError::with_kind(
                EngineErrorKind::Timeout,
                "request cancelled by gateway",
            )),
            result = self.send(&query) => result,
        }
    }
}

#[derive(Deserialize)]
struct SparqlResults {
    #[serde(default)]
    head: Head,
    #[serde(default)]
    results: Option<Bindings>,
    #[serde(default)]
    boolean: Option<bool>,
}

#[derive(Deserialize, Default)]
struct Head {
    #[serde(default)]
    vars: Vec<String>,
}

#[derive(Deserialize)]
struct Bindings {
    bindings: Vec<HashMap<String, Term>>,
}

#[derive(Deserialize)]
struct Term {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(default)]
    datatype: Option<String>,
}

/// Decode a `application/sparql-results+json` document.
///
/// ASK results become a single `boolean` column.
pub fn parse_sparql_results(body: &[u8]) -> Result<RawResult, EngineError> {
    let doc: SparqlResults = serde_json::from_slice(body)
        .map_err(|e| EngineError::protocol(format!("invalid SPARQL JSON results: {e}")))?;

    if let Some(answer) = doc.boolean {
        return Ok(RawResult::new(
            vec!["boolean".to_string()],
            vec![vec![Scalar::Bool(answer)]],
        ));
    }

    let bindings = doc
        .results
        .ok_or_else(|| EngineError::protocol("SPARQL JSON results have no 'results' member"))?
        .bindings;

    let columns = doc.head.vars;
    let rows = bindings
        .into_iter()
        .map(|mut solution| {
            columns
                .iter()
                .map(|var| solution.remove(var).map_or(Scalar::Null, term_to_scalar))
                .collect::<Row>()
        })
        .collect();

    Ok(RawResult::new(columns, rows))
}

fn term_to_scalar(term: Term) -> Scalar {
    match term.kind.as_str() {
        "uri" => Scalar::Iri(term.value),
        "bnode" => Scalar::BlankNode(term.value),
        _ => literal_to_scalar(term.value, term.datatype.as_deref()),
    }
}

fn literal_to_scalar(value: String, datatype: Option<&str>) -> Scalar {
    let Some(local) = datatype.and_then(|d| d.strip_prefix(XSD)) else {
        return Scalar::Str(value);
    };
    match local {
        "integer" | "int" | "long" | "short" | "byte" | "nonNegativeInteger"
        | "positiveInteger" | "negativeInteger" | "nonPositiveInteger" | "unsignedInt"
        | "unsignedLong" | "unsignedShort" | "unsignedByte" => match value.trim().parse::<i64>() {
            Ok(i) => Scalar::Int(i),
            Err(_) => Scalar::Str(value),
        },
        "decimal" | "double" | "float" => match value.trim().parse::<f64>() {
            Ok(f) => Scalar::Float(f),
            Err(_) => Scalar::Str(value),
        },
        "boolean" => match value.trim() {
            "true" | "1" => Scalar::Bool(true),
            "false" | "0" => Scalar::Bool(false),
            _ => Scalar::Str(value),
        },
        _ => Scalar::Str(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select_results() {
        let body = br#"{
            "head": {"vars": ["s", "n", "label", "score", "flag", "b"]},
            "results": {"bindings": [
                {
                    "s": {"type": "uri", "value": "http://example.org/a"},
                    "n": {"type": "literal", "datatype": "http://www.w3.org/2001/XMLSchema#integer", "value": "42"},
                    "label": {"type": "literal", "xml:lang": "en", "value": "Alpha"},
                    "score": {"type": "literal", "datatype": "http://www.w3.org/2001/XMLSchema#decimal", "value": "2.5"},
                    "flag": {"type": "literal", "datatype": "http://www.w3.org/2001/XMLSchema#boolean", "value": "true"},
                    "b": {"type": "bnode", "value": "b0"}
                },
                {
                    "s": {"type": "uri", "value": "http://example.org/b"}
                }
            ]}
        }"#;

        let raw = parse_sparql_results(body).unwrap();
        assert_eq!(raw.columns, vec!["s", "n", "label", "score", "flag", "b"]);
        assert_eq!(
            raw.rows[0],
            vec![
                Scalar::iri("http://example.org/a"),
                Scalar::Int(42),
                Scalar::string("Alpha"),
                Scalar::Float(2.5),
                Scalar::Bool(true),
                Scalar::BlankNode("b0".to_string()),
            ]
        );
        assert_eq!(raw.rows[1][0], Scalar::iri("http://example.org/b"));
        assert!(raw.rows[1][1..].iter().all(Scalar::is_null));
    }

    #[test]
    fn test_parse_ask_result() {
        let raw = parse_sparql_results(br#"{"head": {}, "boolean": true}"#).unwrap();
        assert_eq!(raw.columns, vec!["boolean"]);
        assert_eq!(raw.rows, vec![vec![Scalar::Bool(true)]]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_sparql_results(b"<html>oops</html>").unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Protocol);
    }

    #[test]
    fn test_malformed_typed_literal_falls_back_to_string() {
        assert_eq!(
            literal_to_scalar("abc".to_string(), Some("http://www.w3.org/2001/XMLSchema#integer")),
            Scalar::string("abc")
        );
    }

    #[tokio::test]
    async fn test_cancelled_request_returns_promptly() {
        // Unroutable endpoint: the request would hang until the client timeout
        let engine = SparqlHttpEngine::new(&EngineConfig {
            endpoint: "http://10.255.255.1:9/query".to_string(),
            request_timeout_ms: 30_000,
        })
        .unwrap();
        let cancel = CancelHandle::new();
        cancel.cancel();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run("SELECT * WHERE { ?s ?p ?o }", &[], &cancel),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Timeout);
    }
}
