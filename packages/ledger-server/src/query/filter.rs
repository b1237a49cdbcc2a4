//! Parses the HTTP `POST /entities/query` filter body into a [`QueryExpr`]
//! (spec.md §6.2: "owner, string annotations, numeric annotations with
//! optional operator prefixes like `>=5`, limit, offset").

use std::collections::HashMap;

use ledger_core::{synthetic, ComparisonOp, IncludeMask, Predicate, QueryExpr, QueryOptions, DEFAULT_RESULTS_PER_PAGE};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterParseError {
    #[error("numeric filter on {key:?} has unparseable value {value:?}")]
    BadNumericValue { key: String, value: String },
}

/// Raw JSON shape of a query request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterBody {
    pub owner: Option<String>,
    pub string_annotations: HashMap<String, String>,
    /// Values are strings so an optional comparison-operator prefix
    /// (`">=5"`) can be recognized before parsing the numeric remainder.
    pub numeric_annotations: HashMap<String, String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub at_block: Option<u64>,
}

impl Default for FilterBody {
    fn default() -> Self {
        Self {
            owner: None,
            string_annotations: HashMap::new(),
            numeric_annotations: HashMap::new(),
            limit: None,
            offset: None,
            at_block: None,
        }
    }
}

/// Converts a decoded [`FilterBody`] into a [`QueryExpr`] + [`QueryOptions`]
/// pair ready for [`crate::store::BiTemporalStore::query_entities`].
pub fn parse(body: FilterBody) -> Result<(QueryExpr, QueryOptions), FilterParseError> {
    let mut predicates = Vec::new();

    if let Some(owner) = body.owner {
        predicates.push(Predicate::StringEq { key: synthetic::OWNER.to_string(), value: owner });
    }

    for (key, value) in body.string_annotations {
        predicates.push(Predicate::StringEq { key, value });
    }

    for (key, raw) in body.numeric_annotations {
        let (op, rest) = ComparisonOp::parse_prefix(&raw);
        let value: u64 = rest
            .trim()
            .parse()
            .map_err(|_| FilterParseError::BadNumericValue { key: key.clone(), value: raw.clone() })?;
        predicates.push(match op {
            Some(op) => Predicate::NumericCmp { key, op, value },
            None => Predicate::NumericEq { key, value },
        });
    }

    let options = QueryOptions {
        at_block: body.at_block,
        results_per_page: body.limit.unwrap_or(DEFAULT_RESULTS_PER_PAGE),
        offset: body.offset.unwrap_or(0),
        include: IncludeMask::all(),
    };

    Ok((QueryExpr::new(predicates), options))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_filter_becomes_synthetic_string_eq() {
        let body = FilterBody { owner: Some("deadbeef".to_string()), ..FilterBody::default() };
        let (expr, _) = parse(body).unwrap();
        assert_eq!(expr.predicates, vec![Predicate::StringEq { key: synthetic::OWNER.to_string(), value: "deadbeef".to_string() }]);
    }

    #[test]
    fn numeric_filter_with_operator_prefix_parses_as_cmp() {
        let mut numeric = HashMap::new();
        numeric.insert("views".to_string(), ">=5".to_string());
        let body = FilterBody { numeric_annotations: numeric, ..FilterBody::default() };
        let (expr, _) = parse(body).unwrap();
        assert_eq!(expr.predicates, vec![Predicate::NumericCmp { key: "views".to_string(), op: ComparisonOp::Ge, value: 5 }]);
    }

    #[test]
    fn numeric_filter_without_prefix_parses_as_eq() {
        let mut numeric = HashMap::new();
        numeric.insert("views".to_string(), "5".to_string());
        let body = FilterBody { numeric_annotations: numeric, ..FilterBody::default() };
        let (expr, _) = parse(body).unwrap();
        assert_eq!(expr.predicates, vec![Predicate::NumericEq { key: "views".to_string(), value: 5 }]);
    }

    #[test]
    fn unparseable_numeric_value_is_an_error() {
        let mut numeric = HashMap::new();
        numeric.insert("views".to_string(), "not-a-number".to_string());
        let body = FilterBody { numeric_annotations: numeric, ..FilterBody::default() };
        assert!(parse(body).is_err());
    }

    #[test]
    fn limit_and_offset_populate_options() {
        let body = FilterBody { limit: Some(10), offset: Some(20), ..FilterBody::default() };
        let (_, options) = parse(body).unwrap();
        assert_eq!(options.results_per_page, 10);
        assert_eq!(options.offset, 20);
    }
}
