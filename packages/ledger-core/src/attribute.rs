//! Attribute value types and the synthetic-key reservation policy.
//!
//! Attribute keys are UTF-8. Keys prefixed with `$` are *synthetic*: reserved
//! and set only by the system (spec.md §3.1). Every synthetic key this
//! system writes is listed in [`synthetic`].

use serde::{Deserialize, Serialize};

/// Well-known synthetic attribute keys (spec.md §3.1, §4.1).
pub mod synthetic {
    pub const KEY: &str = "$key";
    pub const OWNER: &str = "$owner";
    pub const CREATOR: &str = "$creator";
    pub const EXPIRATION: &str = "$expiration";
    pub const CREATED_AT_BLOCK: &str = "$createdAtBlock";
    pub const SEQUENCE: &str = "$sequence";
    pub const TX_INDEX: &str = "$txIndex";
    pub const OP_INDEX: &str = "$opIndex";

    pub use super::is_synthetic;
}

/// Returns `true` if `key` is reserved for system use (begins with `$`).
///
/// C2 rejects any client-supplied string or numeric annotation map that
/// contains a synthetic key (spec.md §9).
#[must_use]
pub fn is_synthetic(key: &str) -> bool {
    key.starts_with('$')
}

/// The value half of a string-attribute row.
pub type StringValue = String;

/// The value half of a numeric-attribute row. Always an unsigned 64-bit
/// integer once stored; see [`crate::numeric`] for the permissive input
/// coercion applied before a value reaches this type.
pub type NumericValue = u64;

/// Tagged union of the two attribute value domains, used where a single
/// value needs to carry its own kind (e.g. query results).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(StringValue),
    Numeric(NumericValue),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_prefixed_keys_are_synthetic() {
        assert!(is_synthetic("$owner"));
        assert!(is_synthetic("$anything"));
    }

    #[test]
    fn plain_keys_are_not_synthetic() {
        assert!(!is_synthetic("owner"));
        assert!(!is_synthetic(""));
    }

    #[test]
    fn attribute_value_json_is_untagged() {
        let s = serde_json::to_string(&AttributeValue::String("x".into())).unwrap();
        assert_eq!(s, "\"x\"");
        let n = serde_json::to_string(&AttributeValue::Numeric(5)).unwrap();
        assert_eq!(n, "5");
    }
}
