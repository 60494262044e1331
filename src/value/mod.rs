//! # Value Type System
//!
//! Typed scalars carried in query results and bound as query parameters.
//!
//! ## Design Decisions
//!
//! - **Graph-aware**: IRIs and blank nodes are distinct from plain strings, so
//!   the aggregation guard can tell an entity identifier from a number
//! - **Exact round-trip**: the serde representation keeps the variant, so a
//!   cached result reads back identical to what was stored
//! - **Deterministic ordering**: [`Scalar::total_cmp`] orders values across
//!   variants for grouping and local `ORDER BY`

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single typed value in a result row or parameter list.
///
/// Equality treats every NaN as equal to every other NaN, so results holding
/// NaN compare equal after a cache round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    /// Non-finite values serialize as `"NaN"`, `"INF"` or `"-INF"`
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    /// Absolute IRI, stored without angle brackets
    Iri(String),
    /// Engine-local entity handle (blank node label without `_:`)
    BlankNode(String),
}

/// A result row; its length always equals the column count of its result.
pub type Row = Vec<Scalar>;

fn uri_shape() -> &'static Regex {
    static URI: OnceLock<Regex> = OnceLock::new();
    URI.get_or_init(|| {
        Regex::new(r"^(?:<[^<>\s]+>|[A-Za-z][A-Za-z0-9+.\-]*://\S+|urn:\S+|_:\S+)$")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => true,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Scalar::Str(a), Scalar::Str(b))
            | (Scalar::Iri(a), Scalar::Iri(b))
            | (Scalar::BlankNode(a), Scalar::BlankNode(b)) => a == b,
            _ => false,
        }
    }
}

/// JSON has no literal for NaN or the infinities; they travel as the
/// xsd:double lexical forms instead of collapsing to `null`.
pub(crate) mod float_repr {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "INF" } else { "-INF" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(FloatVisitor)
    }

    struct FloatVisitor;

    impl Visitor<'_> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"INF\" or \"-INF\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                "NaN" => Ok(f64::NAN),
                "INF" | "+INF" => Ok(f64::INFINITY),
                "-INF" => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }
    }
}

impl Scalar {
    pub fn string(s: impl Into<String>) -> Self {
        Scalar::Str(s.into())
    }

    pub fn iri(s: impl Into<String>) -> Self {
        Scalar::Iri(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// True for numeric variants only (not numeric-looking strings).
    pub fn is_numeric(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_))
    }

    /// Numeric view of the value; strings are parsed when they hold a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Str(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// True when the value is a dereferenceable identifier rather than data:
    /// an IRI, a blank node, or a string shaped like a URI or entity handle.
    pub fn is_identifier(&self) -> bool {
        match self {
            Scalar::Iri(_) | Scalar::BlankNode(_) => true,
            Scalar::Str(s) => uri_shape().is_match(s.trim()),
            _ => false,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Bool(_) => 1,
            Scalar::Int(_) | Scalar::Float(_) => 2,
            Scalar::Str(_) => 3,
            Scalar::Iri(_) => 4,
            Scalar::BlankNode(_) => 5,
        }
    }

    /// Total order across all variants.
    ///
    /// Null < Bool < numbers < strings < IRIs < blank nodes. Ints and floats
    /// compare numerically; NaN sorts after every other number.
    pub fn total_cmp(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                x.total_cmp(&y)
            }
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Str(a), Scalar::Str(b))
            | (Scalar::Iri(a), Scalar::Iri(b))
            | (Scalar::BlankNode(a), Scalar::BlankNode(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    /// Canonical text used as a grouping key. Distinct variants never collide.
    pub fn key(&self) -> String {
        match self {
            Scalar::Null => "n:".to_string(),
            Scalar::Bool(b) => format!("b:{b}"),
            Scalar::Int(i) => format!("i:{i}"),
            Scalar::Float(f) => format!("f:{}", f.to_bits()),
            Scalar::Str(s) => format!("s:{s}"),
            Scalar::Iri(s) => format!("u:{s}"),
            Scalar::BlankNode(s) => format!("_:{s}"),
        }
    }

    /// Render as a SPARQL term for parameter binding.
    pub fn to_sparql_literal(&self) -> String {
        match self {
            Scalar::Null => "UNDEF".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) if f.is_finite() => {
                let text = f.to_string();
                if text.contains(['.', 'e', 'E']) {
                    text
                } else {
                    format!("{text}.0")
                }
            }
            Scalar::Float(f) => format!("\"{f}\"^^<http://www.w3.org/2001/XMLSchema#double>"),
            Scalar::Str(s) => format!("\"{}\"", escape_literal(s)),
            Scalar::Iri(s) => format!("<{s}>"),
            Scalar::BlankNode(s) => format!("_:{s}"),
        }
    }

    /// Approximate in-memory size, used for cheap payload estimates.
    pub fn approx_size(&self) -> usize {
        match self {
            Scalar::Null | Scalar::Bool(_) => 1,
            Scalar::Int(_) | Scalar::Float(_) => 8,
            Scalar::Str(s) | Scalar::Iri(s) | Scalar::BlankNode(s) => s.len(),
        }
    }
}

fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Str(s) => write!(f, "{s}"),
            Scalar::Iri(s) => write!(f, "<{s}>"),
            Scalar::BlankNode(s) => write!(f, "_:{s}"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_detection() {
        assert!(Scalar::iri("http://example.org/a").is_identifier());
        assert!(Scalar::BlankNode("b0".into()).is_identifier());
        assert!(Scalar::string("http://example.org/Paper_12").is_identifier());
        assert!(Scalar::string("urn:uuid:1234").is_identifier());
        assert!(Scalar::string("<http://example.org/x>").is_identifier());
        assert!(Scalar::string("_:node7").is_identifier());

        assert!(!Scalar::string("42").is_identifier());
        assert!(!Scalar::string("hello world").is_identifier());
        assert!(!Scalar::Int(3).is_identifier());
        assert!(!Scalar::Null.is_identifier());
    }

    #[test]
    fn test_as_f64() {
        assert_eq!(Scalar::Int(3).as_f64(), Some(3.0));
        assert_eq!(Scalar::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Scalar::string(" 7.5 ").as_f64(), Some(7.5));
        assert_eq!(Scalar::string("NaN").as_f64(), None);
        assert_eq!(Scalar::iri("http://x/1").as_f64(), None);
    }

    #[test]
    fn test_total_cmp_mixed_numbers() {
        assert_eq!(Scalar::Int(2).total_cmp(&Scalar::Float(2.5)), Ordering::Less);
        assert_eq!(Scalar::Float(3.0).total_cmp(&Scalar::Int(3)), Ordering::Equal);
        assert_eq!(Scalar::Null.total_cmp(&Scalar::Int(0)), Ordering::Less);
        assert_eq!(
            Scalar::string("b").total_cmp(&Scalar::iri("a")),
            Ordering::Less
        );
    }

    #[test]
    fn test_keys_do_not_collide_across_variants() {
        assert_ne!(Scalar::Int(1).key(), Scalar::string("1").key());
        assert_ne!(Scalar::string("x").key(), Scalar::iri("x").key());
    }

    #[test]
    fn test_sparql_literal_rendering() {
        assert_eq!(Scalar::Int(5).to_sparql_literal(), "5");
        assert_eq!(Scalar::Float(2.0).to_sparql_literal(), "2.0");
        assert_eq!(Scalar::string("a\"b").to_sparql_literal(), "\"a\\\"b\"");
        assert_eq!(Scalar::iri("http://x/y").to_sparql_literal(), "<http://x/y>");
        assert_eq!(Scalar::Null.to_sparql_literal(), "UNDEF");
    }

    #[test]
    fn test_serde_keeps_variant() {
        let values = vec![Scalar::Int(1), Scalar::string("1"), Scalar::iri("http://x")];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<Scalar> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_serde_non_finite_floats() {
        let values = vec![
            Scalar::Float(f64::INFINITY),
            Scalar::Float(f64::NEG_INFINITY),
            Scalar::Float(f64::NAN),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[{"float":"INF"},{"float":"-INF"},{"float":"NaN"}]"#);
        let back: Vec<Scalar> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
        assert!(matches!(back[2], Scalar::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_serde_finite_floats_are_exact() {
        for x in [1.071_566_039_146_582_6e-75, 0.1, f64::MAX, f64::MIN_POSITIVE, 5e-324] {
            let json = serde_json::to_string(&Scalar::Float(x)).unwrap();
            let Scalar::Float(back) = serde_json::from_str(&json).unwrap() else {
                panic!("variant changed: {json}");
            };
            assert_eq!(back.to_bits(), x.to_bits(), "{json}");
        }
    }

    #[test]
    fn test_float_equality() {
        assert_eq!(Scalar::Float(f64::NAN), Scalar::Float(f64::NAN));
        assert_ne!(Scalar::Float(f64::NAN), Scalar::Float(1.0));
        assert_ne!(Scalar::Float(1.0), Scalar::Int(1));
    }
}
