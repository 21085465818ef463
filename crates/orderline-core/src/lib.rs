use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Fields every order record must carry at the top level.
pub const ORDER_REQUIRED_FIELDS: [&str; 4] = ["id", "created", "products", "user"];
/// Fields every nested user object must carry.
pub const USER_REQUIRED_FIELDS: [&str; 3] = ["id", "name", "city"];
/// Fields every nested product object must carry.
pub const PRODUCT_REQUIRED_FIELDS: [&str; 3] = ["id", "name", "price"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("created timestamp out of range: {0}")]
    TimestampOutOfRange(i64),
}

/// A line that is not valid JSON. This is the only fatal condition in a load:
/// the rest of the file is never processed.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("line {line}: invalid JSON: {detail}")]
pub struct ParseError {
    pub line: usize,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldScope {
    Order,
    User,
    Product,
}

impl FieldScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::User => "user",
            Self::Product => "product",
        }
    }
}

/// One non-fatal problem found while loading a record. Validation failures are
/// reported but the record is still processed with whatever partial data it
/// has; store failures roll back their own transaction and the load moves on.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    MissingField {
        line: usize,
        scope: FieldScope,
        field: &'static str,
        order_id: Option<i64>,
    },
    InvalidTimestamp {
        line: usize,
        order_id: Option<i64>,
        seconds: i64,
    },
    StoreFailure {
        line: usize,
        operation: String,
        detail: String,
    },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField { line, scope: FieldScope::Order, field, .. } => {
                write!(f, "line {line}: order is missing the \"{field}\" property")
            }
            Self::MissingField { line, scope: FieldScope::User, field, order_id } => {
                write!(
                    f,
                    "line {line}: user in order {} is missing the \"{field}\" property",
                    DisplayId(*order_id)
                )
            }
            Self::MissingField { line, scope: FieldScope::Product, field, order_id } => {
                write!(
                    f,
                    "line {line}: product in order {} is missing the \"{field}\" attribute",
                    DisplayId(*order_id)
                )
            }
            Self::InvalidTimestamp { line, order_id, seconds } => {
                write!(
                    f,
                    "line {line}: order {} has an out-of-range \"created\" timestamp: {seconds}",
                    DisplayId(*order_id)
                )
            }
            Self::StoreFailure { line, operation, detail } => {
                write!(f, "line {line}: {operation} failed: {detail}")
            }
        }
    }
}

struct DisplayId(Option<i64>);

impl Display for DisplayId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(id) => write!(f, "\"{id}\""),
            None => write!(f, "\"?\""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub name: Option<String>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: i64,
    pub user_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// One association row: how many units of a product one order contains.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrderProductRow {
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i64,
}

/// An order record as read from one NDJSON line. Every field is optional:
/// missing or wrong-typed values are reported as diagnostics and the record
/// keeps flowing through the pipeline with whatever is present.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOrder {
    pub id: Option<i64>,
    pub created_epoch: Option<i64>,
    pub user: Option<ParsedUser>,
    pub products: Option<Vec<ParsedProduct>>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUser {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProduct {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub price: Option<f64>,
}

impl ParsedOrder {
    /// Decode one input line and collect missing-field diagnostics.
    ///
    /// # Errors
    /// Returns [`ParseError`] when the line is not valid JSON.
    pub fn from_line(line: usize, raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| ParseError { line, detail: err.to_string() })?;
        Ok(Self::from_value(line, &value))
    }

    /// Extract best-effort fields from a decoded JSON value. Presence checks
    /// look at the JSON keys, so an explicit `null` counts as present (and
    /// lands as a NULL column); a wrong-typed value counts as absent for the
    /// step that needs it.
    #[must_use]
    pub fn from_value(line: usize, value: &Value) -> Self {
        let mut diagnostics = Vec::new();

        for field in ORDER_REQUIRED_FIELDS {
            if !has_key(value, field) {
                diagnostics.push(Diagnostic::MissingField {
                    line,
                    scope: FieldScope::Order,
                    field,
                    order_id: None,
                });
            }
        }

        let id = value.get("id").and_then(Value::as_i64);
        let created_epoch = value.get("created").and_then(epoch_seconds);

        let user = value.get("user").and_then(Value::as_object).map(|object| {
            for field in USER_REQUIRED_FIELDS {
                if !object.contains_key(field) {
                    diagnostics.push(Diagnostic::MissingField {
                        line,
                        scope: FieldScope::User,
                        field,
                        order_id: id,
                    });
                }
            }
            ParsedUser {
                id: object.get("id").and_then(Value::as_i64),
                name: object.get("name").and_then(Value::as_str).map(str::to_owned),
                city: object.get("city").and_then(Value::as_str).map(str::to_owned),
            }
        });

        let products = value.get("products").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .map(|item| {
                    for field in PRODUCT_REQUIRED_FIELDS {
                        if !has_key(item, field) {
                            diagnostics.push(Diagnostic::MissingField {
                                line,
                                scope: FieldScope::Product,
                                field,
                                order_id: id,
                            });
                        }
                    }
                    ParsedProduct {
                        id: item.get("id").and_then(Value::as_i64),
                        name: item.get("name").and_then(Value::as_str).map(str::to_owned),
                        price: item.get("price").and_then(Value::as_f64),
                    }
                })
                .collect()
        });

        Self { id, created_epoch, user, products, diagnostics }
    }
}

/// Count how many times each product id appears in an order's product list.
/// Returns `(product_id, quantity)` pairs in first-occurrence order, so a
/// product listed non-contiguously still yields a single pair. Products with
/// no usable id are skipped.
#[must_use]
pub fn product_quantities(products: &[ParsedProduct]) -> Vec<(i64, i64)> {
    let mut first_seen: Vec<i64> = Vec::new();
    let mut counts: BTreeMap<i64, i64> = BTreeMap::new();

    for product in products {
        let Some(id) = product.id else { continue };
        if !counts.contains_key(&id) {
            first_seen.push(id);
        }
        *counts.entry(id).or_insert(0) += 1;
    }

    first_seen
        .into_iter()
        .map(|id| (id, counts.get(&id).copied().unwrap_or_default()))
        .collect()
}

/// Convert a Unix epoch seconds value from the source record into the
/// `created` timestamp of an [`Order`].
///
/// # Errors
/// Returns [`DomainError::TimestampOutOfRange`] when the value does not map
/// to a representable timestamp.
pub fn created_from_epoch(seconds: i64) -> Result<OffsetDateTime, DomainError> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| DomainError::TimestampOutOfRange(seconds))
}

fn has_key(value: &Value, key: &str) -> bool {
    value.as_object().is_some_and(|object| object.contains_key(key))
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_seconds(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|seconds| seconds.trunc() as i64))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn well_formed_line_has_no_diagnostics() -> Result<()> {
        let line = r#"{"id":1,"created":1540000000,"user":{"id":1,"name":"Alice","city":"Prague"},"products":[{"id":10,"name":"Pen","price":1.5}]}"#;
        let parsed = ParsedOrder::from_line(1, line)?;

        assert!(parsed.diagnostics.is_empty());
        assert_eq!(parsed.id, Some(1));
        assert_eq!(parsed.created_epoch, Some(1_540_000_000));
        let user = parsed.user.ok_or_else(|| anyhow::anyhow!("user missing"))?;
        assert_eq!(user.name.as_deref(), Some("Alice"));
        assert_eq!(user.city.as_deref(), Some("Prague"));
        let products = parsed.products.ok_or_else(|| anyhow::anyhow!("products missing"))?;
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].price, Some(1.5));
        Ok(())
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let result = ParsedOrder::from_line(3, "{not json");
        let Err(err) = result else { panic!("expected parse error") };
        assert_eq!(err.line, 3);
    }

    #[test]
    fn missing_order_fields_are_reported_but_rest_is_extracted() -> Result<()> {
        let line = r#"{"id":7,"user":{"id":2,"name":"Bob","city":"Brno"}}"#;
        let parsed = ParsedOrder::from_line(1, line)?;

        let missing: Vec<&str> = parsed
            .diagnostics
            .iter()
            .filter_map(|diag| match diag {
                Diagnostic::MissingField { scope: FieldScope::Order, field, .. } => Some(*field),
                _ => None,
            })
            .collect();
        assert_eq!(missing, vec!["created", "products"]);
        assert_eq!(parsed.id, Some(7));
        assert!(parsed.user.is_some());
        Ok(())
    }

    #[test]
    fn missing_user_city_is_reported_and_left_unset() -> Result<()> {
        let line = r#"{"id":4,"created":1540000000,"products":[],"user":{"id":9,"name":"Eve"}}"#;
        let parsed = ParsedOrder::from_line(2, line)?;

        assert_eq!(
            parsed.diagnostics,
            vec![Diagnostic::MissingField {
                line: 2,
                scope: FieldScope::User,
                field: "city",
                order_id: Some(4),
            }]
        );
        let user = parsed.user.ok_or_else(|| anyhow::anyhow!("user missing"))?;
        assert_eq!(user.id, Some(9));
        assert_eq!(user.city, None);
        Ok(())
    }

    #[test]
    fn explicit_null_counts_as_present() -> Result<()> {
        let line = r#"{"id":4,"created":1540000000,"products":[],"user":{"id":9,"name":"Eve","city":null}}"#;
        let parsed = ParsedOrder::from_line(1, line)?;

        assert!(parsed.diagnostics.is_empty());
        let user = parsed.user.ok_or_else(|| anyhow::anyhow!("user missing"))?;
        assert_eq!(user.city, None);
        Ok(())
    }

    #[test]
    fn product_missing_price_is_reported_per_occurrence() -> Result<()> {
        let line = r#"{"id":5,"created":1540000000,"user":{"id":1,"name":"A","city":"B"},"products":[{"id":10,"name":"Pen"},{"id":11,"name":"Ink","price":2.0}]}"#;
        let parsed = ParsedOrder::from_line(1, line)?;

        assert_eq!(
            parsed.diagnostics,
            vec![Diagnostic::MissingField {
                line: 1,
                scope: FieldScope::Product,
                field: "price",
                order_id: Some(5),
            }]
        );
        Ok(())
    }

    #[test]
    fn quantities_count_repeated_products_once_per_id() {
        let products = vec![
            ParsedProduct { id: Some(10), name: None, price: None },
            ParsedProduct { id: Some(11), name: None, price: None },
            ParsedProduct { id: Some(10), name: None, price: None },
            ParsedProduct { id: None, name: None, price: None },
        ];

        assert_eq!(product_quantities(&products), vec![(10, 2), (11, 1)]);
    }

    #[test]
    fn quantities_keep_first_occurrence_order() {
        let products = vec![
            ParsedProduct { id: Some(30), name: None, price: None },
            ParsedProduct { id: Some(20), name: None, price: None },
            ParsedProduct { id: Some(30), name: None, price: None },
            ParsedProduct { id: Some(20), name: None, price: None },
            ParsedProduct { id: Some(30), name: None, price: None },
        ];

        assert_eq!(product_quantities(&products), vec![(30, 3), (20, 2)]);
    }

    #[test]
    fn created_from_epoch_converts_seconds() -> Result<()> {
        let created = created_from_epoch(1_540_000_000)?;
        assert_eq!(created.unix_timestamp(), 1_540_000_000);
        Ok(())
    }

    #[test]
    fn diagnostics_render_order_context() {
        let diag = Diagnostic::MissingField {
            line: 12,
            scope: FieldScope::User,
            field: "city",
            order_id: Some(3),
        };
        assert_eq!(diag.to_string(), "line 12: user in order \"3\" is missing the \"city\" property");
    }
}
