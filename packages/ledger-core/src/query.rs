//! Query expression language: conjunctions of equality and range predicates
//! over attribute keys (spec.md §4.5).

use serde::{Deserialize, Serialize};

use crate::attribute::{NumericValue, StringValue};

/// Numeric comparison operators for range predicates (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

impl ComparisonOp {
    /// Parses the operator prefix accepted by the HTTP filter body
    /// (spec.md §6.2, e.g. `">=5"`). Returns `None` (equality) when no
    /// recognized prefix is present.
    #[must_use]
    pub fn parse_prefix(s: &str) -> (Option<Self>, &str) {
        for (prefix, op) in [
            (">=", Self::Ge),
            ("<=", Self::Le),
            ("!=", Self::Ne),
            (">", Self::Gt),
            ("<", Self::Lt),
        ] {
            if let Some(rest) = s.strip_prefix(prefix) {
                return (Some(op), rest);
            }
        }
        (None, s)
    }

    /// Evaluates `lhs OP rhs`.
    #[must_use]
    pub fn apply(self, lhs: NumericValue, rhs: NumericValue) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Ne => lhs != rhs,
        }
    }
}

/// A single predicate over one attribute key (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// `key = "literal"`
    StringEq { key: String, value: StringValue },
    /// `key = N`
    NumericEq { key: String, value: NumericValue },
    /// `key OP N` for `OP in {<,<=,>,>=,!=}`
    NumericCmp {
        key: String,
        op: ComparisonOp,
        value: NumericValue,
    },
}

impl Predicate {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::StringEq { key, .. } | Self::NumericEq { key, .. } | Self::NumericCmp { key, .. } => key,
        }
    }
}

/// A conjunction of predicates -- the only combinator the language supports
/// (spec.md §4.5: "combined by `AND` only").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryExpr {
    pub predicates: Vec<Predicate>,
}

impl QueryExpr {
    #[must_use]
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    /// The point-lookup shortcut: `true` when the only predicate is
    /// `$key = X`, which must execute as an O(log n) single-entity lookup
    /// rather than a full join (spec.md §4.5).
    #[must_use]
    pub fn is_key_point_lookup(&self) -> Option<&str> {
        match self.predicates.as_slice() {
            [Predicate::StringEq { key, value }] if key == crate::attribute::synthetic::KEY => {
                Some(value.as_str())
            }
            _ => None,
        }
    }
}

/// Bitmask of which `EntityData` fields a query should materialize
/// (spec.md §4.5). Missing fields are omitted from results, never nulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeMask {
    pub key: bool,
    pub attributes: bool,
    pub synthetic_attributes: bool,
    pub payload: bool,
    pub content_type: bool,
    pub expiration: bool,
    pub owner: bool,
    pub created_at_block: bool,
    pub last_modified_at_block: bool,
    pub tx_index: bool,
    pub op_index: bool,
}

impl IncludeMask {
    /// Materializes every field.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            key: true,
            attributes: true,
            synthetic_attributes: true,
            payload: true,
            content_type: true,
            expiration: true,
            owner: true,
            created_at_block: true,
            last_modified_at_block: true,
            tx_index: true,
            op_index: true,
        }
    }

    /// A lean default: key and non-synthetic attributes only.
    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            key: true,
            attributes: true,
            synthetic_attributes: false,
            payload: false,
            content_type: false,
            expiration: false,
            owner: false,
            created_at_block: false,
            last_modified_at_block: false,
            tx_index: false,
            op_index: false,
        }
    }
}

impl Default for IncludeMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Default page size when `results_per_page` is not specified.
pub const DEFAULT_RESULTS_PER_PAGE: usize = 100;

/// Options controlling a [`QueryExpr`] execution (spec.md §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Bi-temporal snapshot block. `None` means "the latest committed block".
    pub at_block: Option<u64>,
    pub results_per_page: usize,
    pub offset: usize,
    pub include: IncludeMask,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            at_block: None,
            results_per_page: DEFAULT_RESULTS_PER_PAGE,
            offset: 0,
            include: IncludeMask::default(),
        }
    }
}
