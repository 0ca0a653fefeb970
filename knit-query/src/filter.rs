//! Filter types for building WHERE clauses.
//!
//! Filters render into a [`SqlBuilder`], so placeholders follow the target
//! database and columns can be qualified with a table alias.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sql::{DatabaseType, SqlBuilder};

/// A value bound as a statement parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// String value.
    String(String),
    /// JSON value (arrays and objects).
    Json(Value),
}

impl FilterValue {
    /// Check if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert back into a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
        }
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for FilterValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<&Value> for FilterValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<Value> for FilterValue {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => Self::String(s),
            other => Self::from(&other),
        }
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// A filter that can be rendered as a SQL condition.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// No filter (always true).
    #[default]
    None,

    /// Equals comparison.
    Equals(String, FilterValue),
    /// Not equals comparison.
    NotEquals(String, FilterValue),

    /// Less than comparison.
    Lt(String, FilterValue),
    /// Less than or equal comparison.
    Lte(String, FilterValue),
    /// Greater than comparison.
    Gt(String, FilterValue),
    /// Greater than or equal comparison.
    Gte(String, FilterValue),

    /// In a list of values.
    In(String, Vec<FilterValue>),
    /// Not in a list of values.
    NotIn(String, Vec<FilterValue>),
    /// Column tuple in a list of value tuples: `(a, b) IN ((1, 2), (3, 4))`.
    InTuple(Vec<String>, Vec<Vec<FilterValue>>),

    /// Contains (LIKE %value%).
    Contains(String, FilterValue),
    /// Starts with (LIKE value%).
    StartsWith(String, FilterValue),

    /// Is null check.
    IsNull(String),
    /// Is not null check.
    IsNotNull(String),

    /// Logical AND of multiple filters.
    And(Vec<Filter>),
    /// Logical OR of multiple filters.
    Or(Vec<Filter>),
    /// Logical NOT of a filter.
    Not(Box<Filter>),
}

impl Filter {
    /// Create an empty filter (matches everything).
    pub fn none() -> Self {
        Self::None
    }

    /// Check if this filter is empty.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Equality on one column.
    pub fn equals(column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::Equals(column.into(), value.into())
    }

    /// Match rows whose key columns equal one of `keys`.
    ///
    /// A single key column renders as a plain `IN`, several as a tuple `IN`.
    pub fn keys_in(columns: &[impl AsRef<str>], keys: Vec<Vec<FilterValue>>) -> Self {
        if columns.len() == 1 {
            let values = keys.into_iter().filter_map(|k| k.into_iter().next()).collect();
            Self::In(columns[0].as_ref().to_string(), values)
        } else {
            Self::InTuple(columns.iter().map(|c| c.as_ref().to_string()).collect(), keys)
        }
    }

    /// Match the row whose key columns equal `key`.
    pub fn key_equals(columns: &[impl AsRef<str>], key: &[FilterValue]) -> Self {
        Self::and(
            columns
                .iter()
                .zip(key)
                .map(|(c, v)| Self::Equals(c.as_ref().to_string(), v.clone())),
        )
    }

    /// Create an AND filter.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut filters: Vec<_> = filters.into_iter().filter(|f| !f.is_none()).collect();
        match filters.len() {
            0 => Self::None,
            1 => filters.remove(0),
            _ => Self::And(filters),
        }
    }

    /// Create an OR filter.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut filters: Vec<_> = filters.into_iter().filter(|f| !f.is_none()).collect();
        match filters.len() {
            0 => Self::None,
            1 => filters.remove(0),
            _ => Self::Or(filters),
        }
    }

    /// Create a NOT filter.
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        if filter.is_none() {
            return Self::None;
        }
        Self::Not(Box::new(filter))
    }

    /// Combine with another filter using AND.
    pub fn and_then(self, other: Filter) -> Self {
        if self.is_none() {
            return other;
        }
        if other.is_none() {
            return self;
        }
        match self {
            Self::And(mut filters) => {
                filters.push(other);
                Self::And(filters)
            }
            _ => Self::And(vec![self, other]),
        }
    }

    /// Render with PostgreSQL placeholders; returns (sql, params).
    pub fn to_sql(&self) -> (String, Vec<FilterValue>) {
        let mut builder = SqlBuilder::new(DatabaseType::PostgreSQL);
        self.write_sql(&mut builder, None);
        builder.build()
    }

    /// Render into `builder`, qualifying columns with `qualifier`.
    pub fn write_sql(&self, builder: &mut SqlBuilder, qualifier: Option<&str>) {
        match self {
            Self::None => {
                builder.push("TRUE");
            }

            Self::Equals(col, val) => {
                builder.push_column(qualifier, col);
                if val.is_null() {
                    builder.push(" IS NULL");
                } else {
                    builder.push(" = ").push_param(val.clone());
                }
            }
            Self::NotEquals(col, val) => {
                builder.push_column(qualifier, col);
                if val.is_null() {
                    builder.push(" IS NOT NULL");
                } else {
                    builder.push(" <> ").push_param(val.clone());
                }
            }

            Self::Lt(col, val) => Self::write_comparison(builder, qualifier, col, " < ", val),
            Self::Lte(col, val) => Self::write_comparison(builder, qualifier, col, " <= ", val),
            Self::Gt(col, val) => Self::write_comparison(builder, qualifier, col, " > ", val),
            Self::Gte(col, val) => Self::write_comparison(builder, qualifier, col, " >= ", val),

            Self::In(col, values) => {
                if values.is_empty() {
                    builder.push("FALSE");
                    return;
                }
                builder.push_column(qualifier, col).push(" IN (");
                Self::write_list(builder, values);
                builder.push(")");
            }
            Self::NotIn(col, values) => {
                if values.is_empty() {
                    builder.push("TRUE");
                    return;
                }
                builder.push_column(qualifier, col).push(" NOT IN (");
                Self::write_list(builder, values);
                builder.push(")");
            }
            Self::InTuple(cols, keys) => {
                if keys.is_empty() {
                    builder.push("FALSE");
                    return;
                }
                builder.push_column_tuple(qualifier, cols.as_slice()).push(" IN (");
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.push("(");
                    Self::write_list(builder, key);
                    builder.push(")");
                }
                builder.push(")");
            }

            Self::Contains(col, val) => {
                let pattern = match val {
                    FilterValue::String(s) => FilterValue::String(format!("%{}%", s)),
                    other => other.clone(),
                };
                Self::write_comparison(builder, qualifier, col, " LIKE ", &pattern);
            }
            Self::StartsWith(col, val) => {
                let pattern = match val {
                    FilterValue::String(s) => FilterValue::String(format!("{}%", s)),
                    other => other.clone(),
                };
                Self::write_comparison(builder, qualifier, col, " LIKE ", &pattern);
            }

            Self::IsNull(col) => {
                builder.push_column(qualifier, col).push(" IS NULL");
            }
            Self::IsNotNull(col) => {
                builder.push_column(qualifier, col).push(" IS NOT NULL");
            }

            Self::And(filters) => Self::write_joined(builder, qualifier, filters, " AND ", "TRUE"),
            Self::Or(filters) => Self::write_joined(builder, qualifier, filters, " OR ", "FALSE"),
            Self::Not(filter) => {
                builder.push("NOT (");
                filter.write_sql(builder, qualifier);
                builder.push(")");
            }
        }
    }

    fn write_comparison(
        builder: &mut SqlBuilder,
        qualifier: Option<&str>,
        col: &str,
        op: &str,
        val: &FilterValue,
    ) {
        builder.push_column(qualifier, col).push(op).push_param(val.clone());
    }

    fn write_list(builder: &mut SqlBuilder, values: &[FilterValue]) {
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push_param(value.clone());
        }
    }

    fn write_joined(
        builder: &mut SqlBuilder,
        qualifier: Option<&str>,
        filters: &[Filter],
        sep: &str,
        empty: &str,
    ) {
        if filters.is_empty() {
            builder.push(empty);
            return;
        }
        builder.push("(");
        for (i, filter) in filters.iter().enumerate() {
            if i > 0 {
                builder.push(sep);
            }
            filter.write_sql(builder, qualifier);
        }
        builder.push(")");
    }
}
