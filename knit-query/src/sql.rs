//! SQL generation utilities.
//!
//! Generated statements always quote identifiers: join aliases contain `:`
//! and `$`, and table names are whatever the model declares.

use knit_schema::Dialect;

use crate::filter::FilterValue;

/// Quote an identifier, doubling embedded quotes.
pub fn escape_identifier(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote `qualifier.column`.
pub fn qualified(qualifier: &str, column: &str) -> String {
    format!("{}.{}", escape_identifier(qualifier), escape_identifier(column))
}

/// Placeholder style of the target database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseType {
    /// PostgreSQL uses $1, $2, etc.
    #[default]
    PostgreSQL,
    /// MySQL uses ?, ?, etc.
    MySQL,
    /// SQLite uses ?, ?, etc.
    SQLite,
}

impl DatabaseType {
    /// Get the parameter placeholder for this database type.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${}", index),
            Self::MySQL | Self::SQLite => "?".to_string(),
        }
    }
}

impl From<Dialect> for DatabaseType {
    fn from(dialect: Dialect) -> Self {
        match dialect {
            Dialect::PostgreSql => Self::PostgreSQL,
            Dialect::MySql => Self::MySQL,
            Dialect::Sqlite => Self::SQLite,
        }
    }
}

/// A SQL builder that numbers placeholders as parameters are pushed.
#[derive(Debug, Clone)]
pub struct SqlBuilder {
    db_type: DatabaseType,
    sql: String,
    params: Vec<FilterValue>,
}

impl SqlBuilder {
    /// Create a new SQL builder.
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            sql: String::with_capacity(128),
            params: Vec::new(),
        }
    }

    /// Create a PostgreSQL SQL builder.
    pub fn postgres() -> Self {
        Self::new(DatabaseType::PostgreSQL)
    }

    /// Target database type.
    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Push a literal SQL string.
    pub fn push(&mut self, sql: impl AsRef<str>) -> &mut Self {
        self.sql.push_str(sql.as_ref());
        self
    }

    /// Push a parameter placeholder and record its value.
    pub fn push_param(&mut self, value: impl Into<FilterValue>) -> &mut Self {
        self.params.push(value.into());
        let placeholder = self.db_type.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    /// Push a quoted identifier.
    pub fn push_identifier(&mut self, name: &str) -> &mut Self {
        self.sql.push_str(&escape_identifier(name));
        self
    }

    /// Push a column, qualified when `qualifier` is given.
    pub fn push_column(&mut self, qualifier: Option<&str>, column: &str) -> &mut Self {
        if let Some(qualifier) = qualifier {
            self.sql.push_str(&qualified(qualifier, column));
        } else {
            self.push_identifier(column);
        }
        self
    }

    /// Push `(a, b)` for several columns, or the bare column for one.
    pub fn push_column_tuple(&mut self, qualifier: Option<&str>, columns: &[impl AsRef<str>]) -> &mut Self {
        if columns.len() == 1 {
            return self.push_column(qualifier, columns[0].as_ref());
        }
        self.push("(");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.push_column(qualifier, column.as_ref());
        }
        self.push(")")
    }

    /// Build the final SQL string and parameters.
    pub fn build(self) -> (String, Vec<FilterValue>) {
        (self.sql, self.params)
    }

    /// Get the current SQL string.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get the current parameters.
    pub fn params(&self) -> &[FilterValue] {
        &self.params
    }

    /// Get the next parameter index.
    pub fn next_param_index(&self) -> usize {
        self.params.len() + 1
    }
}

impl Default for SqlBuilder {
    fn default() -> Self {
        Self::postgres()
    }
}
