//! Unwrapping of nested response envelopes.
//!
//! Buckets wrap rows under `rows` and each row's payload under `value`, nested one or
//! two levels deep. [`flatten`] and [`flatten_one`] peel every such layer; [`rows`]
//! and [`first_row`] peel exactly one per row and are what hydration uses. None of
//! these fail.

use serde_json::Value;

fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    value.get(name).filter(|v| !v.is_null())
}

/// Unwraps `rows` and `value` layers until neither is present.
pub fn flatten(response: &Value) -> Value {
    if let Some(rows) = field(response, "rows") {
        return flatten(rows);
    }
    if let Some(value) = field(response, "value") {
        return flatten(value);
    }
    response.clone()
}

/// Flattens, then keeps descending into the first element of any list.
///
/// An empty list yields `Null`.
pub fn flatten_one(response: &Value) -> Value {
    match flatten(response) {
        Value::Array(items) => items.first().map(flatten_one).unwrap_or(Value::Null),
        other => other,
    }
}

/// How the rows of a response carry their documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// View and spatial rows, `{id, key | geometry, value}`. The document is `value`.
    Enveloped,
    /// N1QL result rows. Each row is the document itself.
    Bare,
}

fn row_list(response: &Value) -> Vec<&Value> {
    if let Some(rows) = field(response, "rows") {
        return row_list(rows);
    }
    match response {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    }
}

fn document(row: &Value, shape: RowShape) -> Value {
    match shape {
        RowShape::Enveloped => field(row, "value").unwrap_or(row).clone(),
        RowShape::Bare => row.clone(),
    }
}

/// The documents of a response, one per row.
///
/// Only the `rows` envelope and each row's own envelope are removed; the
/// documents themselves are never unwrapped, whatever fields they carry.
pub fn rows(response: &Value, shape: RowShape) -> Vec<Value> {
    row_list(response).into_iter().map(|row| document(row, shape)).collect()
}

/// The document of the first row, if there is one.
pub fn first_row(response: &Value, shape: RowShape) -> Option<Value> {
    row_list(response).first().map(|row| document(row, shape))
}
