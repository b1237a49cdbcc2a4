//! Permissive numeric-annotation coercion (spec.md §4.3, §9 Open Question b).
//!
//! The write API accepts numeric annotations as JSON integers,
//! floating-point numbers (truncated toward zero), or decimal strings. A
//! value that cannot be coerced is dropped silently from the resulting map
//! -- an intentional concession to permissive clients that this module
//! documents rather than hides.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::attribute::NumericValue;

/// Coerces one JSON value into a [`NumericValue`], following the same rules
/// as [`coerce_numeric_map`]. Returns `None` if the value cannot be
/// interpreted as an unsigned integer.
#[must_use]
pub fn coerce_numeric(value: &JsonValue) -> Option<NumericValue> {
    match value {
        JsonValue::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else {
                // Truncate toward zero; negative or non-finite floats have
                // no valid unsigned representation and are dropped.
                n.as_f64().and_then(|f| {
                    if f.is_finite() && f >= 0.0 {
                        Some(f.trunc() as u64)
                    } else {
                        None
                    }
                })
            }
        }
        JsonValue::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Converts a client-supplied JSON object of numeric annotations into a
/// `key -> u64` map, dropping any entry whose value cannot be parsed.
///
/// This is the permissive conversion named in spec.md §4.3: implementations
/// MUST document it, which this doc comment and its tests do.
#[must_use]
pub fn coerce_numeric_map(raw: &HashMap<String, JsonValue>) -> HashMap<String, NumericValue> {
    raw.iter()
        .filter_map(|(k, v)| coerce_numeric(v).map(|n| (k.clone(), n)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_passes_through() {
        assert_eq!(coerce_numeric(&json!(42)), Some(42));
    }

    #[test]
    fn float_truncates_toward_zero() {
        assert_eq!(coerce_numeric(&json!(5.9)), Some(5));
    }

    #[test]
    fn negative_float_is_dropped() {
        assert_eq!(coerce_numeric(&json!(-1.5)), None);
    }

    #[test]
    fn decimal_string_parses() {
        assert_eq!(coerce_numeric(&json!("123")), Some(123));
    }

    #[test]
    fn string_with_whitespace_parses() {
        assert_eq!(coerce_numeric(&json!(" 77 ")), Some(77));
    }

    #[test]
    fn unparseable_string_is_dropped() {
        assert_eq!(coerce_numeric(&json!("not-a-number")), None);
    }

    #[test]
    fn bool_and_null_are_dropped() {
        assert_eq!(coerce_numeric(&json!(true)), None);
        assert_eq!(coerce_numeric(&json!(null)), None);
    }

    #[test]
    fn map_drops_unparseable_entries_silently() {
        let mut raw = HashMap::new();
        raw.insert("cpu".to_string(), json!(8));
        raw.insert("ratio".to_string(), json!(2.7));
        raw.insert("garbage".to_string(), json!("nope"));

        let coerced = coerce_numeric_map(&raw);
        assert_eq!(coerced.get("cpu"), Some(&8));
        assert_eq!(coerced.get("ratio"), Some(&2));
        assert_eq!(coerced.get("garbage"), None);
        assert_eq!(coerced.len(), 2);
    }
}
