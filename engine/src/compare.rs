//! Total ordering over JSON values.
//!
//! Indexes, order-by clauses and limited snapshots all sort item values with
//! [`compare_values`]. The ordering is total: any two JSON values compare, with
//! values of different kinds ranked `bool < number < string < array < object`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }
}

/// Where nulls sort relative to other values. Independent of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    #[default]
    First,
    Last,
}

/// How strings compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StringSort {
    /// Byte-wise comparison.
    #[default]
    Lexical,
    /// Compare lowercased forms first, breaking ties lexically.
    CaseInsensitive,
}

/// Options controlling [`compare_values`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareOptions {
    pub direction: Direction,
    pub nulls: Nulls,
    pub string_sort: StringSort,
}

impl CompareOptions {
    pub fn descending() -> Self {
        Self {
            direction: Direction::Desc,
            ..Self::default()
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_nulls(mut self, nulls: Nulls) -> Self {
        self.nulls = nulls;
        self
    }

    pub fn with_string_sort(mut self, string_sort: StringSort) -> Self {
        self.string_sort = string_sort;
        self
    }

    /// Whether two option sets order values identically up to direction.
    pub fn matches_ignoring_direction(&self, other: &CompareOptions) -> bool {
        self.nulls == other.nulls && self.string_sort == other.string_sort
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.total_cmp(&y)
}

fn compare_strings(a: &str, b: &str, sort: StringSort) -> Ordering {
    match sort {
        StringSort::Lexical => a.cmp(b),
        StringSort::CaseInsensitive => a
            .to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b)),
    }
}

fn compare_ascending(a: &Value, b: &Value, options: &CompareOptions) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => match options.nulls {
            Nulls::First => Ordering::Less,
            Nulls::Last => Ordering::Greater,
        },
        (_, Value::Null) => match options.nulls {
            Nulls::First => Ordering::Greater,
            Nulls::Last => Ordering::Less,
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => compare_strings(x, y, options.string_sort),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_ascending(l, r, options);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Compare two JSON values under the given options.
///
/// Null placement follows [`CompareOptions::nulls`] regardless of direction.
pub fn compare_values(a: &Value, b: &Value, options: &CompareOptions) -> Ordering {
    if a.is_null() || b.is_null() {
        return compare_ascending(a, b, options);
    }
    let ord = compare_ascending(a, b, options);
    match options.direction {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
    }
}

/// A JSON value bundled with the options that order it.
///
/// Every `SortKey` stored in one index carries the same options, which makes
/// the derived `Ord` a valid total order for that index.
#[derive(Debug, Clone)]
pub struct SortKey {
    value: Value,
    options: CompareOptions,
}

impl SortKey {
    pub fn new(value: Value, options: CompareOptions) -> Self {
        Self { value, options }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.value, &other.value, &self.options)
    }
}
