//! # Aggregation Guard
//!
//! Some graph engines answer aggregate queries (`COUNT`, `SUM`, ...) under
//! certain shapes with entity identifiers in the aggregate column instead of
//! numbers. This module detects that defect and provides the pieces for the
//! local fallback:
//!
//! 1. [`detect`] flags a raw result as defective
//! 2. [`rewrite`] strips aggregation from the query so the engine returns one
//!    raw row per underlying match
//! 3. [`AggregationPlan::aggregate`] groups those raw rows and computes the
//!    aggregates locally
//!
//! Everything here is a pure function of its inputs. The query handling is a
//! pattern match over the text, not a parser: nested aggregate expressions
//! and keywords inside string literals are not understood.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::query::RawResult;

macro_rules! static_regex {
    ($name:ident, $pattern:literal) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| {
                Regex::new($pattern).unwrap_or_else(|e| unreachable!("static regex: {e}"))
            })
        }
    };
}

mod plan;

pub use plan::{AggregateFunction, AggregateTerm, AggregationPlan, OrderKey, ProjectionItem};

/// Column-name tokens that mark a column as holding an aggregate value.
pub const AGGREGATE_ALIASES: &[&str] = &["count", "sum", "avg", "min", "max", "total", "average"];

static_regex!(aggregate_call_re, r"(?i)\b(?:COUNT|SUM|AVG|MIN|MAX)\s*\(");
static_regex!(select_re, r"(?i)\bSELECT\b");
static_regex!(projection_end_re, r"(?i)\bWHERE\b|\{");
static_regex!(select_modifier_re, r"(?i)^\s*(?:DISTINCT|REDUCED)\b");
static_regex!(
    aliased_aggregate_re,
    r"(?i)\(\s*(?:COUNT|SUM|AVG|MIN|MAX)\s*\(\s*(?:DISTINCT\s+)?([?$]\w+|\*)\s*\)\s+AS\s+[?$]\w+\s*\)"
);
static_regex!(
    bare_aggregate_re,
    r"(?i)\b(?:COUNT|SUM|AVG|MIN|MAX)\s*\(\s*(?:DISTINCT\s+)?([?$]\w+|\*)\s*\)"
);
static_regex!(
    solution_modifier_re,
    r"(?i)\b(?:GROUP\s+BY|HAVING|ORDER\s+BY|LIMIT|OFFSET)\b"
);
static_regex!(group_by_re, r"(?is)\bGROUP\s+BY\s+(.*?)(?:\bHAVING\b|\bORDER\s+BY\b|\bLIMIT\b|\bOFFSET\b|$)");
static_regex!(variable_re, r"[?$](\w+)");

/// True when the query uses an aggregate function and a column named like an
/// aggregate holds at least one identifier value.
pub fn detect(query_text: &str, raw: &RawResult) -> bool {
    if !aggregate_call_re().is_match(query_text) {
        return false;
    }
    raw.columns
        .iter()
        .enumerate()
        .filter(|(_, name)| is_aggregate_alias(name))
        .any(|(i, _)| {
            raw.rows
                .iter()
                .any(|row| row.get(i).is_some_and(|v| v.is_identifier()))
        })
}

/// Whether a column name reads as an aggregate alias: `count`, `?total`,
/// `paper_count` and `avg-score` do; `counter` and `maximum` do not.
pub fn is_aggregate_alias(column: &str) -> bool {
    let name = column.trim_start_matches(['?', '$']).to_lowercase();
    name.split(['_', '-'])
        .any(|token| AGGREGATE_ALIASES.contains(&token))
}

/// Strip aggregation from a query so it returns raw tuples.
///
/// `(FUNC([DISTINCT] ?x) AS ?alias)` and bare `FUNC(?x)` become `?x`,
/// `COUNT(*)` disappears, and the solution modifiers that only make sense on
/// grouped solutions (GROUP BY, HAVING, ORDER BY, LIMIT, OFFSET) are removed.
/// GROUP BY variables missing from the projection are added to it, and an
/// empty projection becomes `*`.
pub fn rewrite(query_text: &str) -> String {
    let (body, tail) = split_solution_modifiers(query_text);
    let group_vars: Vec<String> = group_by_re()
        .captures(tail)
        .and_then(|c| c.get(1))
        .map(|m| {
            variable_re()
                .captures_iter(m.as_str())
                .map(|c| format!("?{}", &c[1]))
                .collect()
        })
        .unwrap_or_default();

    let Some((start, end)) = projection_span(body) else {
        return body.trim_end().to_string();
    };

    let projection = rewrite_projection(&body[start..end], &group_vars);
    format!(
        "{} {} {}",
        body[..start].trim_end(),
        projection,
        body[end..].trim()
    )
}

fn rewrite_projection(projection: &str, group_vars: &[String]) -> String {
    let without_modifier = select_modifier_re().replace(projection, "");
    let unaliased = aliased_aggregate_re().replace_all(&without_modifier, inner_variable);
    let unwrapped = bare_aggregate_re().replace_all(&unaliased, inner_variable);

    let mut seen = HashSet::new();
    let mut terms: Vec<String> = Vec::new();
    for term in unwrapped.split_whitespace() {
        if is_plain_variable(term) && !seen.insert(term.trim_start_matches(['?', '$']).to_string()) {
            continue;
        }
        terms.push(term.to_string());
    }
    if terms.iter().any(|t| t == "*") {
        return "*".to_string();
    }
    for var in group_vars {
        if seen.insert(var.trim_start_matches('?').to_string()) {
            terms.push(var.clone());
        }
    }
    if terms.is_empty() {
        "*".to_string()
    } else {
        terms.join(" ")
    }
}

fn inner_variable(caps: &Captures<'_>) -> String {
    match &caps[1] {
        "*" => String::new(),
        var => format!(" {var} "),
    }
}

fn is_plain_variable(term: &str) -> bool {
    let mut chars = term.chars();
    matches!(chars.next(), Some('?' | '$'))
        && !term[1..].is_empty()
        && term[1..].chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Byte range of the outer SELECT projection, between `SELECT` and the
/// `WHERE` keyword or the opening brace of the pattern.
pub(crate) fn projection_span(text: &str) -> Option<(usize, usize)> {
    let select = select_re().find(text)?;
    let start = select.end();
    let end = projection_end_re()
        .find(&text[start..])
        .map_or(text.len(), |m| start + m.start());
    Some((start, end))
}

/// Split a query into the part up to the closing brace of its outer pattern
/// and the trailing solution modifiers.
pub(crate) fn split_solution_modifiers(text: &str) -> (&str, &str) {
    let Some(close) = text.rfind('}') else {
        return (text, "");
    };
    let after = close + 1;
    match solution_modifier_re().find(&text[after..]) {
        Some(m) => (&text[..after + m.start()], &text[after + m.start()..]),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Scalar;

    const GROUPED_COUNT: &str =
        "SELECT ?g (COUNT(?x) AS ?count) WHERE { ?x <http://ex.org/inGroup> ?g } GROUP BY ?g";

    fn raw(columns: &[&str], rows: Vec<Vec<Scalar>>) -> RawResult {
        RawResult::new(columns.iter().map(|c| (*c).to_string()).collect(), rows)
    }

    #[test]
    fn test_detect_identifier_in_count_column() {
        let result = raw(
            &["g", "count"],
            vec![vec![
                Scalar::iri("http://ex.org/g1"),
                Scalar::string("http://ex.org/Paper_12"),
            ]],
        );
        assert!(detect(GROUPED_COUNT, &result));
    }

    #[test]
    fn test_detect_numeric_count_is_fine() {
        let result = raw(
            &["g", "count"],
            vec![vec![Scalar::iri("http://ex.org/g1"), Scalar::Int(3)]],
        );
        assert!(!detect(GROUPED_COUNT, &result));
    }

    #[test]
    fn test_detect_requires_aggregate_in_query() {
        let result = raw(&["count"], vec![vec![Scalar::iri("http://ex.org/a")]]);
        assert!(!detect("SELECT ?count WHERE { ?count ?p ?o }", &result));
    }

    #[test]
    fn test_detect_ignores_non_alias_columns() {
        let result = raw(
            &["g", "label"],
            vec![vec![Scalar::iri("http://ex.org/g1"), Scalar::iri("http://ex.org/x")]],
        );
        assert!(!detect(
            "SELECT ?g (SAMPLE(?l) AS ?label) (COUNT(?x) AS ?n) WHERE { ?x ?p ?g }",
            &result
        ));
    }

    #[test]
    fn test_detect_table() {
        let cases: &[(&str, &[&str], Scalar, bool)] = &[
            ("SELECT (SUM(?v) AS ?total) WHERE { ?s ?p ?v }", &["total"], Scalar::BlankNode("b1".into()), true),
            ("SELECT (AVG(?v) AS ?avg_score) WHERE { ?s ?p ?v }", &["avg_score"], Scalar::string("urn:x:1"), true),
            ("select (max(?v) as ?max) where { ?s ?p ?v }", &["max"], Scalar::iri("http://x/1"), true),
            ("SELECT (COUNT(?v) AS ?count) WHERE { ?s ?p ?v }", &["count"], Scalar::string("12"), false),
            ("SELECT (COUNT(?v) AS ?count) WHERE { ?s ?p ?v }", &["count"], Scalar::Null, false),
            ("SELECT (MIN(?name) AS ?min) WHERE { ?s ?p ?name }", &["min"], Scalar::string("Alice"), false),
            ("SELECT (COUNT(?v) AS ?counter) WHERE { ?s ?p ?v }", &["counter"], Scalar::iri("http://x/1"), false),
        ];
        for (query, columns, value, expected) in cases {
            let result = raw(columns, vec![vec![value.clone()]]);
            assert_eq!(detect(query, &result), *expected, "query: {query}");
        }
    }

    #[test]
    fn test_alias_matching() {
        assert!(is_aggregate_alias("count"));
        assert!(is_aggregate_alias("?COUNT"));
        assert!(is_aggregate_alias("paper_count"));
        assert!(is_aggregate_alias("avg-score"));
        assert!(is_aggregate_alias("total"));
        assert!(is_aggregate_alias("average"));
        assert!(!is_aggregate_alias("counter"));
        assert!(!is_aggregate_alias("maximum"));
        assert!(!is_aggregate_alias("name"));
    }

    #[test]
    fn test_rewrite_grouped_count() {
        let rewritten = rewrite(GROUPED_COUNT);
        assert!(!rewritten.contains("COUNT("));
        assert!(!rewritten.contains("GROUP BY"));
        assert!(!rewritten.contains("AS ?count"));
        assert_eq!(
            rewritten,
            "SELECT ?g ?x WHERE { ?x <http://ex.org/inGroup> ?g }"
        );
    }

    #[test]
    fn test_rewrite_table() {
        let cases: &[(&str, &str)] = &[
            (
                "SELECT (COUNT(*) AS ?n) WHERE { ?s a <http://x/T> }",
                "SELECT * WHERE { ?s a <http://x/T> }",
            ),
            (
                "SELECT ?g (COUNT(DISTINCT ?x) AS ?c) (SUM(?v) AS ?total) WHERE { ?x ?p ?g . ?x ?q ?v } GROUP BY ?g ORDER BY DESC(?c) LIMIT 5",
                "SELECT ?g ?x ?v WHERE { ?x ?p ?g . ?x ?q ?v }",
            ),
            (
                "SELECT DISTINCT ?g (COUNT(?x) AS ?count) WHERE { ?x ?p ?g } GROUP BY ?g HAVING (COUNT(?x) > 2)",
                "SELECT ?g ?x WHERE { ?x ?p ?g }",
            ),
            (
                "select ?g (max(?x) as ?max) { ?x ?p ?g } group by ?g",
                "select ?g ?x { ?x ?p ?g }",
            ),
            (
                "SELECT (COUNT(?x) AS ?count) WHERE { ?x ?p ?g } GROUP BY ?g",
                "SELECT ?x ?g WHERE { ?x ?p ?g }",
            ),
            (
                "SELECT ?x (COUNT(?x) AS ?n) WHERE { ?x ?p ?o } GROUP BY ?x",
                "SELECT ?x WHERE { ?x ?p ?o }",
            ),
            (
                "PREFIX ex: <http://ex.org/>\nSELECT ?g (AVG(?v) AS ?avg) WHERE { ?s ex:g ?g ; ex:v ?v } GROUP BY ?g",
                "PREFIX ex: <http://ex.org/>\nSELECT ?g ?v WHERE { ?s ex:g ?g ; ex:v ?v }",
            ),
        ];
        for (before, after) in cases {
            assert_eq!(rewrite(before), *after, "rewriting: {before}");
        }
    }

    #[test]
    fn test_rewrite_without_aggregates_only_drops_modifiers() {
        assert_eq!(
            rewrite("SELECT ?s WHERE { ?s ?p ?o } LIMIT 10"),
            "SELECT ?s WHERE { ?s ?p ?o }"
        );
    }

    #[test]
    fn test_split_solution_modifiers() {
        let (body, tail) = split_solution_modifiers("SELECT * { ?s ?p ?o } ORDER BY ?s LIMIT 3");
        assert_eq!(body, "SELECT * { ?s ?p ?o } ");
        assert_eq!(tail, "ORDER BY ?s LIMIT 3");

        let (body, tail) = split_solution_modifiers("SELECT * { ?s ?p ?o }");
        assert_eq!(body, "SELECT * { ?s ?p ?o }");
        assert_eq!(tail, "");
    }
}
