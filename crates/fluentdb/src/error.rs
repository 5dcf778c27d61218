//! Error types for fluentdb

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::value::Value;

/// Result type alias for fluentdb operations
pub type DbResult<T> = Result<T, DbError>;

/// Structured failure record attached to execution errors and to `last_error()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    /// Connection name the statement ran on.
    pub connection: String,
    /// SQL text that failed.
    pub sql: String,
    /// Sanitized bound parameters.
    pub params: Vec<Value>,
    /// Time spent before the failure surfaced.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Human readable failure message.
    pub message: String,
    /// Failure kind (`execution`, `driver`, ...).
    pub kind: String,
    /// Driver specific error code (e.g. SQLSTATE), if the driver reported one.
    pub code: Option<String>,
}

impl ErrorContext {
    /// Duration in fractional milliseconds, as passed to hooks.
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (sql: {}, {} params, {:.3}ms)",
            self.connection,
            self.message,
            self.sql,
            self.params.len(),
            self.duration_ms()
        )
    }
}

pub(crate) fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Error reported by a driver adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    /// Driver message.
    pub message: String,
    /// Optional driver/SQLSTATE code.
    pub code: Option<String>,
}

impl DriverError {
    /// Create a driver error without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attach a driver specific error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Error types for query building and execution
#[derive(Debug, Error)]
pub enum DbError {
    /// Missing or invalid connection configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unsafe table/column/alias name
    #[error("Invalid identifier '{name}': {reason}")]
    Identifier { name: String, reason: String },

    /// Comparison operator outside the supported set
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// Join condition that is not a plain `identifier op identifier` comparison
    #[error("Unsafe join expression: {0}")]
    UnsafeJoinExpression(String),

    /// Empty or mismatched data for insert/insert_multi/update, or a bad operand
    #[error("Argument error: {0}")]
    Argument(String),

    /// Mutation without a WHERE predicate
    #[error("Policy violation: {0}")]
    Policy(String),

    /// Transaction state error (e.g. nesting without savepoint support)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Statement execution failed
    #[error("Execution error: {0}")]
    Execution(Box<ErrorContext>),

    /// Driver failure outside statement execution (connect, begin, commit, ...)
    #[error("Driver error on connection '{connection}': {source}")]
    Driver {
        connection: String,
        #[source]
        source: DriverError,
    },
}

impl DbError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an identifier error
    pub fn identifier(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Identifier {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an argument error
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    /// Create a policy error
    pub fn policy(message: impl Into<String>) -> Self {
        Self::Policy(message.into())
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    /// Wrap a driver failure that happened outside statement execution
    pub fn driver(connection: impl Into<String>, source: DriverError) -> Self {
        Self::Driver {
            connection: connection.into(),
            source,
        }
    }

    /// Short machine readable kind, used in logs and hook contexts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Identifier { .. } => "identifier",
            Self::UnsupportedOperator(_) => "unsupported_operator",
            Self::UnsafeJoinExpression(_) => "unsafe_join_expression",
            Self::Argument(_) => "argument",
            Self::Policy(_) => "policy",
            Self::Transaction(_) => "transaction",
            Self::Execution(_) => "execution",
            Self::Driver { .. } => "driver",
        }
    }

    /// Execution context, if this is an execution failure.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Execution(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Structured diagnostic fields for any variant.
    pub fn diagnostics(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("kind".into(), self.kind().into());
        map.insert("message".into(), self.to_string().into());
        match self {
            Self::Identifier { name, .. } => {
                map.insert("identifier".into(), name.clone().into());
            }
            Self::Driver { connection, source } => {
                map.insert("connection".into(), connection.clone().into());
                if let Some(code) = &source.code {
                    map.insert("code".into(), code.clone().into());
                }
            }
            Self::Execution(ctx) => {
                if let Ok(value) = serde_json::to_value(ctx.as_ref()) {
                    map.insert("context".into(), value);
                }
            }
            _ => {}
        }
        serde_json::Value::Object(map)
    }

    /// Check if this is an identifier error
    pub fn is_identifier(&self) -> bool {
        matches!(self, Self::Identifier { .. })
    }

    /// Check if this is an argument error
    pub fn is_argument(&self) -> bool {
        matches!(self, Self::Argument(_))
    }

    /// Check if this is a policy error
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Policy(_))
    }

    /// Check if this is a transaction error
    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// Check if this is an execution error
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }
}
