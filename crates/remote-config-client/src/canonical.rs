//! Canonical JSON encoding used for targets signature verification.
//!
//! The backend signs `targets.signed` over a byte-exact canonical form:
//! object keys sorted case-insensitively, no insignificant whitespace, only
//! `"` and `\` escaped inside strings, and integers only. The encoder works on
//! the untyped [`serde_json::Value`] tree exactly as it was received.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Errors raised when a value cannot be expressed in canonical form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonicalError {
    /// Floating point values have no canonical representation in this scheme.
    #[error("non-integral number {0} cannot be canonicalized")]
    NonIntegralNumber(String),
}

/// Encodes `value` into its canonical byte form.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut out = Vec::with_capacity(256);
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(number) => write_number(out, number)?,
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(out, map)?,
    }
    Ok(())
}

fn write_object(out: &mut Vec<u8>, map: &Map<String, Value>) -> Result<(), CanonicalError> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| compare_keys(a, b));

    out.push(b'{');
    for (idx, (key, value)) in entries.into_iter().enumerate() {
        if idx > 0 {
            out.push(b',');
        }
        write_string(out, key);
        out.push(b':');
        write_value(out, value)?;
    }
    out.push(b'}');
    Ok(())
}

/// Case-insensitive ordering, falling back to exact ordering so keys that only
/// differ by case still sort deterministically.
fn compare_keys(a: &str, b: &str) -> Ordering {
    let folded_a = a.chars().flat_map(char::to_lowercase);
    let folded_b = b.chars().flat_map(char::to_lowercase);
    folded_a.cmp(folded_b).then_with(|| a.cmp(b))
}

fn write_number(out: &mut Vec<u8>, number: &Number) -> Result<(), CanonicalError> {
    if let Some(n) = number.as_i64() {
        out.extend_from_slice(n.to_string().as_bytes());
        return Ok(());
    }
    if let Some(n) = number.as_u64() {
        out.extend_from_slice(n.to_string().as_bytes());
        return Ok(());
    }
    // Parsers may surface integers written as `3.0` as floats; those are accepted
    // as long as they round-trip through i64 exactly.
    match number.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            out.extend_from_slice((f as i64).to_string().as_bytes());
            Ok(())
        }
        _ => Err(CanonicalError::NonIntegralNumber(number.to_string())),
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}
