//! Ordering and column selection used by relation queries.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::sql::{escape_identifier, qualified};

/// Sort order for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending order (A-Z, 0-9, oldest first).
    #[default]
    Asc,
    /// Descending order (Z-A, 9-0, newest first).
    Desc,
}

impl SortOrder {
    /// Get the SQL keyword for this sort order.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// Ordering on a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByField {
    /// The column name to order by.
    pub column: Cow<'static, str>,
    /// The sort order.
    pub order: SortOrder,
}

impl OrderByField {
    /// Create a new order by field.
    pub fn new(column: impl Into<Cow<'static, str>>, order: SortOrder) -> Self {
        Self {
            column: column.into(),
            order,
        }
    }

    /// Create an ascending order.
    pub fn asc(column: impl Into<Cow<'static, str>>) -> Self {
        Self::new(column, SortOrder::Asc)
    }

    /// Create a descending order.
    pub fn desc(column: impl Into<Cow<'static, str>>) -> Self {
        Self::new(column, SortOrder::Desc)
    }

    /// Write the SQL for this field, qualifying the column when asked.
    pub fn write_sql(&self, buffer: &mut String, qualifier: Option<&str>) {
        match qualifier {
            Some(q) => buffer.push_str(&qualified(q, &self.column)),
            None => buffer.push_str(&escape_identifier(&self.column)),
        }
        buffer.push(' ');
        buffer.push_str(self.order.as_sql());
    }
}

/// Ordered list of sort columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderBy {
    fields: Vec<OrderByField>,
}

impl OrderBy {
    /// Create an empty order by (no ordering).
    pub fn none() -> Self {
        Self::default()
    }

    /// Check if the order by is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Add a field to the order by.
    pub fn then(mut self, field: OrderByField) -> Self {
        self.fields.push(field);
        self
    }

    /// Append a field in place.
    pub fn push(&mut self, field: OrderByField) {
        self.fields.push(field);
    }

    /// Create an OrderBy from multiple fields.
    pub fn from_fields(fields: impl IntoIterator<Item = OrderByField>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// Fields in priority order.
    pub fn fields(&self) -> &[OrderByField] {
        &self.fields
    }

    /// Write the clause body (without `ORDER BY`).
    ///
    /// ```rust
    /// use knit_query::types::{OrderBy, OrderByField};
    ///
    /// let order = OrderBy::from_fields([OrderByField::desc("name"), OrderByField::asc("id")]);
    /// let mut buffer = String::from("ORDER BY ");
    /// order.write_sql(&mut buffer, Some("pets"));
    /// assert_eq!(buffer, r#"ORDER BY "pets"."name" DESC, "pets"."id" ASC"#);
    /// ```
    pub fn write_sql(&self, buffer: &mut String, qualifier: Option<&str>) {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                buffer.push_str(", ");
            }
            field.write_sql(buffer, qualifier);
        }
    }

    /// Render the clause body without a qualifier.
    pub fn to_sql(&self) -> String {
        let mut sql = String::new();
        self.write_sql(&mut sql, None);
        sql
    }
}

/// Columns a relation query selects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Select {
    /// Every column.
    #[default]
    All,
    /// Only these columns. Key columns needed to attach rows are added back.
    Columns(Vec<String>),
}

impl Select {
    /// Select specific columns.
    pub fn columns(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Columns(columns.into_iter().map(Into::into).collect())
    }

    /// Whether every column is selected.
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Make sure `column` is selected.
    pub fn ensure(&mut self, column: &str) {
        if let Self::Columns(columns) = self {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }
    }

    /// Whether `column` is selected.
    pub fn includes(&self, column: &str) -> bool {
        match self {
            Self::All => true,
            Self::Columns(columns) => columns.iter().any(|c| c == column),
        }
    }

    /// Write the select list, qualifying columns when asked.
    pub fn write_sql(&self, buffer: &mut String, qualifier: Option<&str>) {
        match self {
            Self::All => match qualifier {
                Some(q) => {
                    buffer.push_str(&escape_identifier(q));
                    buffer.push_str(".*");
                }
                None => buffer.push('*'),
            },
            Self::Columns(columns) => {
                for (i, column) in columns.iter().enumerate() {
                    if i > 0 {
                        buffer.push_str(", ");
                    }
                    match qualifier {
                        Some(q) => buffer.push_str(&qualified(q, column)),
                        None => buffer.push_str(&escape_identifier(column)),
                    }
                }
            }
        }
    }
}
