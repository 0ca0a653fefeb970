//! Error types for eager loading and graph writes, with actionable messages.
//!
//! Every error carries a code for programmatic handling, the model, relation
//! and identity it concerns when known, and suggestions for fixing it.
//!
//! # Error Codes
//!
//! Error codes follow a pattern: K{category}{number}
//! - 1xxx: Expression and model errors (syntax, unknown relation, modifier)
//! - 2xxx: Graph shape errors (duplicate alias or `#id`, cycles, missing rows)
//! - 3xxx: Reference errors (`#ref`, `#ref{..}` templates)
//! - 5xxx: Execution errors (database failures, unexpected results)
//! - 7xxx: Configuration errors
//! - 9xxx: Internal errors
//!
//! ```rust
//! use knit_query::{ErrorCode, QueryError};
//!
//! let err = QueryError::relation_not_found("Person", "pals");
//! assert_eq!(err.code, ErrorCode::RelationNotFound);
//! assert_eq!(err.code.code(), "K1003");
//! assert!(err.to_string().contains("pals"));
//! ```

use std::fmt;

use knit_schema::SchemaError;
use thiserror::Error;

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Expression and model errors (1xxx)
    /// Malformed relation expression string (K1001).
    ExpressionSyntax = 1001,
    /// Malformed object-notation expression (K1002).
    InvalidExpression = 1002,
    /// Relation not declared on a model (K1003).
    RelationNotFound = 1003,
    /// Model not registered (K1004).
    UnknownModel = 1004,
    /// Modifier not registered (K1005).
    InvalidModifier = 1005,
    /// Invalid relation or model declaration (K1006).
    InvalidRelation = 1006,

    // Graph shape errors (2xxx)
    /// Sibling relations share an alias (K2001).
    DuplicateAlias = 2001,
    /// Recursion on a relation that does not point back to its model (K2002).
    InvalidRecursion = 2002,
    /// Two graph nodes declare the same `#id` (K2003).
    DuplicateId = 2003,
    /// Writes depend on each other in a cycle (K2004).
    CyclicGraph = 2004,
    /// Input is not a valid object graph (K2005).
    InvalidGraph = 2005,
    /// A referenced row does not exist (K2006).
    RecordNotFound = 2006,

    // Reference errors (3xxx)
    /// A reference names an unknown or unresolved label (K3001).
    UnresolvedReference = 3001,
    /// A `#ref{..}` template is not allowed or malformed (K3002).
    InvalidReference = 3002,

    // Execution errors (5xxx)
    /// The database rejected a statement (K5001).
    DatabaseError = 5001,
    /// A value cannot be bound as a parameter (K5002).
    InvalidParameter = 5002,
    /// A statement returned an unexpected result (K5003).
    UnexpectedResult = 5003,

    // Configuration errors (7xxx)
    /// Invalid configuration (K7001).
    InvalidConfiguration = 7001,

    // Internal errors (9xxx)
    /// Internal error (K9001).
    Internal = 9001,
}

impl ErrorCode {
    /// Get the error code string (e.g., "K1001").
    pub fn code(&self) -> String {
        format!("K{}", *self as u16)
    }

    /// Get a short description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ExpressionSyntax => "Relation expression syntax error",
            Self::InvalidExpression => "Invalid relation expression",
            Self::RelationNotFound => "Relation not found",
            Self::UnknownModel => "Unknown model",
            Self::InvalidModifier => "Unknown modifier",
            Self::InvalidRelation => "Invalid relation declaration",
            Self::DuplicateAlias => "Duplicate relation alias",
            Self::InvalidRecursion => "Invalid recursion",
            Self::DuplicateId => "Duplicate #id",
            Self::CyclicGraph => "Cyclic graph",
            Self::InvalidGraph => "Invalid graph",
            Self::RecordNotFound => "Record not found",
            Self::UnresolvedReference => "Unresolved reference",
            Self::InvalidReference => "Invalid reference",
            Self::DatabaseError => "Database error",
            Self::InvalidParameter => "Invalid parameter",
            Self::UnexpectedResult => "Unexpected result",
            Self::InvalidConfiguration => "Invalid configuration",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Additional context for an error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// The operation that was being performed.
    pub operation: Option<String>,
    /// The model involved.
    pub model: Option<String>,
    /// The relation or field involved.
    pub field: Option<String>,
    /// The table a failed statement wrote to.
    pub table: Option<String>,
    /// Identity of the row involved, rendered as `(1, 'a')`.
    pub identity: Option<String>,
    /// The SQL statement (if available).
    pub sql: Option<String>,
    /// Suggestions for fixing the error.
    pub suggestions: Vec<String>,
    /// Help text.
    pub help: Option<String>,
}

/// Errors that can occur while loading or writing relation graphs.
#[derive(Error, Debug)]
pub struct QueryError {
    /// The error code.
    pub code: ErrorCode,
    /// The error message.
    pub message: String,
    /// Additional context.
    pub context: ErrorContext,
    /// The source error (if any).
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl QueryError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Add context about the operation.
    pub fn with_context(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    /// Add a suggestion for fixing the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.context.suggestions.push(suggestion.into());
        self
    }

    /// Add help text.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.context.help = Some(help.into());
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.context.model = Some(model.into());
        self
    }

    /// Set the relation or field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.context.field = Some(field.into());
        self
    }

    /// Set the table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.context.table = Some(table.into());
        self
    }

    /// Set the row identity.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.context.identity = Some(identity.into());
        self
    }

    /// Set the SQL statement.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.context.sql = Some(sql.into());
        self
    }

    /// Set the source error.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // ============== Constructor Functions ==============

    /// Create a relation-not-found error.
    pub fn relation_not_found(model: impl Into<String>, relation: impl Into<String>) -> Self {
        let model = model.into();
        let relation = relation.into();
        Self::new(
            ErrorCode::RelationNotFound,
            format!("Model {} has no relation named {}", model, relation),
        )
        .with_model(&model)
        .with_field(&relation)
        .with_suggestion(format!("Declare `{}` on the {} model descriptor", relation, model))
    }

    /// Create an unknown modifier error.
    pub fn invalid_modifier(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::InvalidModifier, format!("Unknown modifier {}", name))
            .with_suggestion(format!("Register `{}` in the modifier registry", name))
    }

    /// Create a duplicate `#id` error.
    pub fn duplicate_id(label: impl Into<String>) -> Self {
        let label = label.into();
        Self::new(
            ErrorCode::DuplicateId,
            format!("#id `{}` is declared by more than one node", label),
        )
        .with_suggestion("Give every labelled node a unique #id")
    }

    /// Create a cyclic graph error listing the models taking part.
    pub fn cyclic_graph(models: &[String]) -> Self {
        Self::new(
            ErrorCode::CyclicGraph,
            format!("Graph writes form a cycle between {}", models.join(", ")),
        )
        .with_help("A row cannot be inserted before a row that needs its key, and vice versa")
    }

    /// Create an invalid graph error.
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidGraph, message.into())
    }

    /// Create a record-not-found error.
    pub fn record_not_found(model: impl Into<String>, identity: impl Into<String>) -> Self {
        let model = model.into();
        let identity = identity.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("No {} record with id {}", model, identity),
        )
        .with_model(&model)
        .with_identity(&identity)
        .with_suggestion("Enable `relate` to attach existing rows")
        .with_suggestion("Enable `insert_missing` to insert rows with explicit ids")
    }

    /// Create an unresolved reference error.
    pub fn unresolved_reference(label: impl Into<String>) -> Self {
        let label = label.into();
        Self::new(
            ErrorCode::UnresolvedReference,
            format!("Reference to `{}` cannot be resolved", label),
        )
        .with_suggestion(format!("Declare a node with \"#id\": \"{}\" in the same graph", label))
    }

    /// Create an invalid reference error.
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidReference, message.into())
    }

    /// Create a general database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message.into())
    }

    /// Create an invalid parameter error.
    pub fn invalid_parameter(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        let message = message.into();
        Self::new(
            ErrorCode::InvalidParameter,
            format!("Invalid value for {}: {}", field, message),
        )
        .with_field(&field)
    }

    /// Create an unexpected result error.
    pub fn unexpected_result(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnexpectedResult, message.into())
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorCode::Internal, format!("Internal error: {}", message))
    }

    // ============== Error Checks ==============

    /// Check if this is a record-not-found error.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::RecordNotFound
    }

    /// Check if the error was raised while validating input, before any write.
    pub fn is_graph_error(&self) -> bool {
        matches!(self.code as u16, 1000..=3999)
    }

    /// Check if this is a reference error.
    pub fn is_reference_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::UnresolvedReference | ErrorCode::InvalidReference
        )
    }

    /// Check if the database rejected a statement.
    pub fn is_database_error(&self) -> bool {
        self.code == ErrorCode::DatabaseError
    }

    // ============== Display Functions ==============

    /// Display the full error with all context and suggestions.
    pub fn display_full(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!("Error [{}]: {}\n", self.code.code(), self.message));

        if let Some(ref op) = self.context.operation {
            output.push_str(&format!("  → While: {}\n", op));
        }
        if let Some(ref model) = self.context.model {
            output.push_str(&format!("  → Model: {}\n", model));
        }
        if let Some(ref field) = self.context.field {
            output.push_str(&format!("  → Relation: {}\n", field));
        }
        if let Some(ref table) = self.context.table {
            output.push_str(&format!("  → Table: {}\n", table));
        }
        if let Some(ref identity) = self.context.identity {
            output.push_str(&format!("  → Identity: {}\n", identity));
        }

        if let Some(ref sql) = self.context.sql {
            let sql_display = if sql.len() > 200 {
                let cut = (0..=200).rev().find(|i| sql.is_char_boundary(*i)).unwrap_or(0);
                format!("{}...", &sql[..cut])
            } else {
                sql.clone()
            };
            output.push_str(&format!("  → SQL: {}\n", sql_display));
        }

        if !self.context.suggestions.is_empty() {
            output.push_str("\nSuggestions:\n");
            for (i, suggestion) in self.context.suggestions.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, suggestion));
            }
        }

        if let Some(ref help) = self.context.help {
            output.push_str(&format!("\nHelp: {}\n", help));
        }

        output
    }
}

impl From<SchemaError> for QueryError {
    fn from(err: SchemaError) -> Self {
        let message = err.to_string();
        let base = match &err {
            SchemaError::SyntaxError { .. } => QueryError::new(ErrorCode::ExpressionSyntax, message),
            SchemaError::InvalidExpression { .. } => {
                QueryError::new(ErrorCode::InvalidExpression, message)
            }
            SchemaError::DuplicateAlias { alias, .. } => {
                QueryError::new(ErrorCode::DuplicateAlias, message).with_field(alias)
            }
            SchemaError::InvalidRecursion {
                model, relation, ..
            } => QueryError::new(ErrorCode::InvalidRecursion, message)
                .with_model(model)
                .with_field(relation),
            SchemaError::RelationNotFound { model, relation } => {
                QueryError::relation_not_found(model, relation)
            }
            SchemaError::UnknownModel { name } => {
                QueryError::new(ErrorCode::UnknownModel, message).with_model(name)
            }
            SchemaError::InvalidRelation { model, field, .. } => {
                QueryError::new(ErrorCode::InvalidRelation, message)
                    .with_model(model)
                    .with_field(field)
            }
            SchemaError::Duplicate { .. } | SchemaError::MissingId { .. } => {
                QueryError::new(ErrorCode::InvalidRelation, message)
            }
            SchemaError::IoError { .. }
            | SchemaError::ConfigError { .. }
            | SchemaError::TomlError { .. } => {
                QueryError::new(ErrorCode::InvalidConfiguration, message)
            }
        };
        base.with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ExpressionSyntax.code(), "K1001");
        assert_eq!(ErrorCode::CyclicGraph.code(), "K2004");
        assert_eq!(ErrorCode::UnresolvedReference.code(), "K3001");
        assert_eq!(ErrorCode::DatabaseError.to_string(), "K5001");
    }

    #[test]
    fn test_relation_not_found() {
        let err = QueryError::relation_not_found("Person", "pals");
        assert_eq!(err.context.model.as_deref(), Some("Person"));
        assert_eq!(err.context.field.as_deref(), Some("pals"));
        assert!(err.is_graph_error());
        assert!(!err.context.suggestions.is_empty());
    }

    #[test]
    fn test_predicates() {
        assert!(QueryError::record_not_found("Animal", "(10)").is_not_found());
        assert!(QueryError::duplicate_id("p").is_graph_error());
        assert!(QueryError::unresolved_reference("p").is_reference_error());
        assert!(QueryError::database("boom").is_database_error());
        assert!(!QueryError::database("boom").is_graph_error());
    }

    #[test]
    fn test_cyclic_graph_lists_models() {
        let err = QueryError::cyclic_graph(&["Person".to_string(), "Animal".to_string()]);
        assert!(err.message.contains("Person, Animal"));
    }

    #[test]
    fn test_from_schema_error() {
        let err: QueryError = SchemaError::syntax("pets.[", 6, "expected relation name").into();
        assert_eq!(err.code, ErrorCode::ExpressionSyntax);
        assert!(err.message.contains("position 6"));
        assert!(err.source.is_some());

        let err: QueryError = SchemaError::relation_not_found("Person", "pals").into();
        assert_eq!(err.code, ErrorCode::RelationNotFound);
        assert_eq!(err.context.field.as_deref(), Some("pals"));

        let err: QueryError = SchemaError::duplicate_alias("pets", "root").into();
        assert_eq!(err.code, ErrorCode::DuplicateAlias);
    }

    #[test]
    fn test_display_full() {
        let err = QueryError::database("duplicate key")
            .with_context("insert")
            .with_table("animals")
            .with_identity("(10)")
            .with_sql("INSERT INTO \"animals\" (\"id\") VALUES ($1) RETURNING *");

        let output = err.display_full();
        assert!(output.contains("K5001"));
        assert!(output.contains("Table: animals"));
        assert!(output.contains("Identity: (10)"));
        assert!(output.contains("INSERT INTO"));
    }
}
