//! Lenient JSON field helpers.
//!
//! Upstream feeds encode numbers either as JSON strings (`"30000.5"`) or as
//! native numbers. Every helper returns `None` instead of failing.

use serde_json::Value;

/// Parse a JSON value (string or number) as a finite `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    let f: f64 = if let Some(s) = v.as_str() { fast_float2::parse(s.trim()).ok()? } else { v.as_f64()? };
    f.is_finite().then_some(f)
}

/// Parse a JSON value (string or number) as `i64`.
#[inline]
pub fn parse_str_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    if let Some(s) = v.as_str() { s.trim().parse().ok() } else { v.as_i64() }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn parse_f64_field(v: &Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

/// Render an identifier (string or integer) as a non-empty string.
pub fn id_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_u64() || n.is_i64() => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_from_strings_or_numbers() {
        assert_eq!(parse_str_f64(Some(&json!("43250.5"))), Some(43250.5));
        assert_eq!(parse_str_f64(Some(&json!(1.25))), Some(1.25));
        assert_eq!(parse_str_f64(Some(&json!("abc"))), None);
        assert_eq!(parse_str_f64(Some(&json!("NaN"))), None);
        assert_eq!(parse_str_f64(Some(&json!(true))), None);
        assert_eq!(parse_str_f64(None), None);
        assert_eq!(parse_str_i64(Some(&json!("1672515782136"))), Some(1_672_515_782_136));
        assert_eq!(parse_str_i64(Some(&json!(42))), Some(42));
    }

    #[test]
    fn ids() {
        assert_eq!(id_string(Some(&json!(12345))), Some("12345".into()));
        assert_eq!(id_string(Some(&json!("abc"))), Some("abc".into()));
        assert_eq!(id_string(Some(&json!(""))), None);
        assert_eq!(id_string(Some(&json!(1.5))), None);
        assert_eq!(id_string(Some(&json!(null))), None);
    }
}
