//! Structural sanity checks run before a query is scheduled.
//!
//! This is not a parser. It only scans for the cheap structural problems the
//! engine would otherwise reject after occupying a worker slot.

use std::time::Duration;

use crate::config::GatewayConfig;
use crate::error::{ValidationError, ValidationRule};
use crate::query::{placeholder_count, Query};

/// Run every check against `query`, returning the first violated rule.
pub fn validate_query(query: &Query, config: &GatewayConfig) -> Result<(), ValidationError> {
    let text = &query.text;
    if text.trim().is_empty() {
        return Err(ValidationRule::EmptyQuery.into());
    }
    if text.len() > config.max_query_length {
        return Err(ValidationRule::TooLong {
            length: text.len(),
            max: config.max_query_length,
        }
        .into());
    }

    let code = scan(text)?;

    if let Some(construct) = find_denied(&code, &config.denied_constructs) {
        return Err(ValidationRule::DeniedConstruct { construct }.into());
    }

    let expected = placeholder_count(text);
    if expected != query.parameters.len() {
        return Err(ValidationRule::ParameterMismatch {
            expected,
            got: query.parameters.len(),
        }
        .into());
    }

    if query.timeout_seconds == Some(0) {
        return Err(ValidationRule::InvalidTimeout { seconds: 0 }.into());
    }
    Ok(())
}

/// Effective budget for a query: its own timeout clamped to the maximum, or
/// the configured default.
pub fn effective_timeout(query: &Query, config: &GatewayConfig) -> Duration {
    match query.timeout_seconds {
        Some(secs) => Duration::from_secs(secs.min(config.max_timeout_secs)),
        None => config.default_timeout(),
    }
}

/// Check bracket balance and literal termination.
///
/// Returns the query text with string literals, IRIs and comments blanked
/// out, keeping byte offsets, so keyword checks only see query structure.
fn scan(text: &str) -> Result<String, ValidationError> {
    let bytes = text.as_bytes();
    let mut code = bytes.to_vec();
    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'"' | b'\'') => {
                let start = i;
                let long = bytes[i..].starts_with(&[quote, quote, quote]);
                i += if long { 3 } else { 1 };
                let mut closed = false;
                while i < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if long {
                        if bytes[i..].starts_with(&[quote, quote, quote]) {
                            i += 3;
                            closed = true;
                            break;
                        }
                    } else if bytes[i] == quote {
                        i += 1;
                        closed = true;
                        break;
                    } else if bytes[i] == b'\n' {
                        break;
                    }
                    i += 1;
                }
                if !closed {
                    return Err(ValidationRule::UnterminatedLiteral { position: start }.into());
                }
                blank(&mut code, start, i);
            }
            b'<' => {
                // IRI reference: `<` followed by non-space up to `>`
                let end = bytes[i + 1..]
                    .iter()
                    .position(|b| matches!(b, b'>' | b' ' | b'\t' | b'\n' | b'\r' | b'<'))
                    .map(|p| i + 1 + p);
                match end {
                    Some(e) if bytes[e] == b'>' => {
                        blank(&mut code, i, e + 1);
                        i = e + 1;
                    }
                    _ => i += 1,
                }
            }
            b'#' => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |p| i + p);
                blank(&mut code, i, end);
                i = end;
            }
            open @ (b'(' | b'{' | b'[') => {
                stack.push((open, i));
                i += 1;
            }
            close @ (b')' | b'}' | b']') => {
                let expected = match close {
                    b')' => b'(',
                    b'}' => b'{',
                    _ => b'[',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => {
                        return Err(ValidationRule::Unbalanced {
                            bracket: close as char,
                            position: i,
                        }
                        .into())
                    }
                }
                i += 1;
            }
            _ => i += 1,
        }
    }

    if let Some((open, position)) = stack.pop() {
        return Err(ValidationRule::Unbalanced {
            bracket: open as char,
            position,
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&code).into_owned())
}

fn blank(code: &mut [u8], start: usize, end: usize) {
    let end = end.min(code.len());
    for b in &mut code[start..end] {
        *b = b' ';
    }
}

/// First denied keyword appearing as a whole word, case-insensitively.
fn find_denied(code: &str, denied: &[String]) -> Option<String> {
    let upper = code.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'?' || b == b'$' || b == b':';

    for keyword in denied {
        let needle = keyword.to_ascii_uppercase();
        if needle.is_empty() {
            continue;
        }
        let mut from = 0;
        while let Some(pos) = upper[from..].find(&needle) {
            let start = from + pos;
            let end = start + needle.len();
            let before_ok = start == 0 || !is_word(bytes[start - 1]);
            let after_ok = end >= bytes.len() || !is_word(bytes[end]);
            if before_ok && after_ok {
                return Some(keyword.clone());
            }
            from = start + 1;
        }
    }
    None
}
