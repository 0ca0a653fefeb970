//! Error types for relation models, relation expressions and configuration.

// These warnings are false positives - the fields are used by derive macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors that can occur while declaring models or parsing relation expressions.
#[derive(Error, Debug, Diagnostic)]
pub enum SchemaError {
    /// Error reading a file.
    #[error("failed to read file: {path}")]
    #[diagnostic(code(knit::schema::io_error))]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed relation expression string.
    #[error("invalid relation expression at position {}: {message} (found `{found}`)", .span.offset())]
    #[diagnostic(code(knit::expr::syntax_error))]
    SyntaxError {
        #[source_code]
        src: String,
        #[label("error here")]
        span: miette::SourceSpan,
        message: String,
        found: String,
    },

    /// Malformed object-notation relation expression.
    #[error("invalid relation expression: {message}")]
    #[diagnostic(code(knit::expr::invalid_expression))]
    InvalidExpression { message: String },

    /// Two siblings in a relation expression share the same alias.
    #[error("duplicate alias `{alias}` under `{parent}`")]
    #[diagnostic(
        code(knit::expr::duplicate_alias),
        help("give one of the relations a different alias with `alias:relation`")
    )]
    DuplicateAlias { alias: String, parent: String },

    /// Recursion marker on a relation that does not point back to its own model.
    #[error("relation `{model}.{relation}` targets `{related}` and cannot be recursive")]
    #[diagnostic(
        code(knit::expr::invalid_recursion),
        help("only self-referential relations may use `.^` or `$recursive`")
    )]
    InvalidRecursion {
        model: String,
        relation: String,
        related: String,
    },

    /// Expression or graph references an undeclared relation.
    #[error("model `{model}` has no relation named `{relation}`")]
    #[diagnostic(code(knit::schema::relation_not_found))]
    RelationNotFound { model: String, relation: String },

    /// Unknown model name.
    #[error("unknown model `{name}`")]
    #[diagnostic(code(knit::schema::unknown_model))]
    UnknownModel { name: String },

    /// Invalid relation definition.
    #[error("invalid relation `{model}.{field}`: {message}")]
    #[diagnostic(code(knit::schema::invalid_relation))]
    InvalidRelation {
        model: String,
        field: String,
        message: String,
    },

    /// Duplicate definition.
    #[error("duplicate {kind} `{name}`")]
    #[diagnostic(code(knit::schema::duplicate))]
    Duplicate { kind: String, name: String },

    /// Model declared without identifier columns.
    #[error("model `{model}` declares no id columns")]
    #[diagnostic(code(knit::schema::missing_id))]
    MissingId { model: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    #[diagnostic(code(knit::config::config_error))]
    ConfigError { message: String },

    /// TOML parsing error.
    #[error("failed to parse TOML")]
    #[diagnostic(code(knit::config::toml_error))]
    TomlError {
        #[source]
        source: toml::de::Error,
    },
}

impl SchemaError {
    /// Create a syntax error pointing at `offset` in `src`.
    ///
    /// The offending substring runs from `offset` to the next delimiter.
    pub fn syntax(src: impl Into<String>, offset: usize, message: impl Into<String>) -> Self {
        let src = src.into();
        let offset = offset.min(src.len());
        let found: String = src[offset..]
            .chars()
            .take_while(|c| !c.is_whitespace() && !matches!(c, ',' | ']' | ')'))
            .collect();
        let len = found.len().max(1).min(src.len().saturating_sub(offset).max(1));
        let found = if found.is_empty() {
            if offset >= src.len() {
                "end of input".to_string()
            } else {
                src[offset..].chars().take(1).collect()
            }
        } else {
            found
        };
        Self::SyntaxError {
            src,
            span: (offset, len).into(),
            message: message.into(),
            found,
        }
    }

    /// Create an invalid object-notation error.
    pub fn invalid_expression(message: impl Into<String>) -> Self {
        Self::InvalidExpression {
            message: message.into(),
        }
    }

    /// Create a duplicate alias error.
    pub fn duplicate_alias(alias: impl Into<String>, parent: impl Into<String>) -> Self {
        Self::DuplicateAlias {
            alias: alias.into(),
            parent: parent.into(),
        }
    }

    /// Create a relation-not-found error.
    pub fn relation_not_found(model: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::RelationNotFound {
            model: model.into(),
            relation: relation.into(),
        }
    }

    /// Create an invalid relation error.
    pub fn invalid_relation(
        model: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidRelation {
            model: model.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a duplicate definition error.
    pub fn duplicate(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Duplicate {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Position of a syntax error, if this is one.
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::SyntaxError { span, .. } => Some(span.offset()),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(unused_assignments)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_points_at_offending_text() {
        let err = SchemaError::syntax("pets.[a, %b]", 9, "expected identifier");

        match &err {
            SchemaError::SyntaxError {
                span,
                found,
                message,
                ..
            } => {
                assert_eq!(span.offset(), 9);
                assert_eq!(found, "%b");
                assert_eq!(message, "expected identifier");
            }
            _ => panic!("Expected SyntaxError"),
        }
        assert_eq!(err.position(), Some(9));
        assert!(err.to_string().contains("position 9"));
    }

    #[test]
    fn test_syntax_error_at_end_of_input() {
        let err = SchemaError::syntax("pets.", 5, "expected identifier");
        if let SchemaError::SyntaxError { found, .. } = err {
            assert_eq!(found, "end of input");
        } else {
            panic!("Expected SyntaxError");
        }
    }

    #[test]
    fn test_duplicate_alias_display() {
        let err = SchemaError::duplicate_alias("pets", "children");
        let display = err.to_string();
        assert!(display.contains("pets"));
        assert!(display.contains("children"));
    }

    #[test]
    fn test_relation_not_found_display() {
        let err = SchemaError::relation_not_found("Person", "pals");
        assert_eq!(err.to_string(), "model `Person` has no relation named `pals`");
    }

    #[test]
    fn test_invalid_recursion_display() {
        let err = SchemaError::InvalidRecursion {
            model: "Person".to_string(),
            relation: "pets".to_string(),
            related: "Animal".to_string(),
        };
        assert!(err.to_string().contains("Person.pets"));
    }
}
