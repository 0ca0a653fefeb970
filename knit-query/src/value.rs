//! Row values, identity keys and value equality.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde_json::Value;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::filter::FilterValue;

/// A row as returned by the database or attached to a loaded tree.
pub type Record = serde_json::Map<String, Value>;

/// Hashable identity of a row: its key column values in canonical form.
///
/// Numbers are normalised so that `1`, `1.0` and `"1"` identify the same row,
/// since drivers disagree on how they return integer keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(SmallVec<[SmolStr; 2]>);

impl IdentityKey {
    /// Build a key from values; `None` if any value is null or not a scalar.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<Self> {
        let parts = values
            .into_iter()
            .map(key_part)
            .collect::<Option<SmallVec<[SmolStr; 2]>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts))
    }

    /// Key of `record` over `columns`; `None` if any column is missing or null.
    pub fn from_record(record: &Record, columns: &[impl AsRef<str>]) -> Option<Self> {
        let values = columns
            .iter()
            .map(|c| record.get(c.as_ref()))
            .collect::<Option<Vec<_>>>()?;
        Self::from_values(values)
    }

    /// Canonical key parts.
    pub fn parts(&self) -> &[SmolStr] {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(part)?;
        }
        f.write_str(")")
    }
}

fn key_part(value: &Value) -> Option<SmolStr> {
    match value {
        Value::Bool(b) => Some(SmolStr::new(if *b { "true" } else { "false" })),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SmolStr::new(i.to_string()))
            } else if let Some(u) = n.as_u64() {
                Some(SmolStr::new(u.to_string()))
            } else {
                n.as_f64().map(canonical_float)
            }
        }
        Value::String(s) => match s.parse::<i64>() {
            Ok(i) if i.to_string() == *s => Some(SmolStr::new(s)),
            _ => Some(SmolStr::new(format!("'{s}'"))),
        },
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn canonical_float(f: f64) -> SmolStr {
    if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
        SmolStr::new((f as i64).to_string())
    } else {
        SmolStr::new(f.to_string())
    }
}

/// Key column values of `record` as statement parameters.
pub fn key_values(record: &Record, columns: &[impl AsRef<str>]) -> Option<Vec<FilterValue>> {
    columns
        .iter()
        .map(|c| match record.get(c.as_ref()) {
            None | Some(Value::Null) => None,
            Some(v) => Some(FilterValue::from(v)),
        })
        .collect()
}

/// Compare two stored values the way a diff should.
///
/// Numbers compare numerically, also against numeric strings (`"1.50"` equals
/// `1.5`). Strings that both parse as timestamps compare by instant. Arrays
/// and objects compare element-wise with the same rules.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::String(x), Value::String(y)) => x == y || timestamps_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// A number read from a value: integers stay exact, everything else is `f64`.
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i128),
    Float(f64),
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Number::Int(x), Number::Int(y)) => x == y,
            (Number::Float(x), Number::Float(y)) => x == y,
            (Number::Int(i), Number::Float(f)) | (Number::Float(f), Number::Int(i)) => {
                f.fract() == 0.0 && f.abs() < 1.7e38 && f as i128 == i
            }
        }
    }
}

fn as_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .map(Number::Int)
            .or_else(|| n.as_f64().map(Number::Float)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i128>().map(Number::Int).ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Number::Float)
            })
        }
        _ => None,
    }
}

fn timestamps_equal(a: &str, b: &str) -> bool {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    // Naive timestamps are read as UTC
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().fixed_offset())
}
