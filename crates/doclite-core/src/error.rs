//! Error taxonomy for the doclite database.
//!
//! All public operations return [`Result`]; business failures are values,
//! never panics. Driver-level errors are mapped into [`DbError`] at the
//! storage boundary so no driver type escapes the public surface.

/// The transaction step during which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    /// Opening the transaction (`BEGIN IMMEDIATE`).
    Begin,
    /// Committing.
    Commit,
    /// Rolling back.
    Rollback,
    /// Attempting to open a transaction inside an active one.
    Nest,
}

impl TxStep {
    /// Lowercase name used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Nest => "nest",
        }
    }
}

impl std::fmt::Display for TxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A document failed validation before any statement was issued.
    #[error("validation error: {message}")]
    Validation {
        /// The offending field, when known.
        field: Option<String>,
        /// Description of the validation failure.
        message: String,
    },

    /// A schema was malformed, or disagreed with an existing table or
    /// registration.
    #[error("schema validation error: {message}")]
    SchemaValidation {
        /// Description of the schema problem.
        message: String,
    },

    /// A unique constraint was violated.
    #[error("unique constraint violated on {field}: {value}")]
    UniqueConstraint {
        /// The unique field (or comma-joined fields of a compound index).
        field: String,
        /// The conflicting value, rendered as JSON.
        value: String,
    },

    /// A non-unique constraint was violated.
    #[error("constraint violated: {message}")]
    Constraint {
        /// Driver-provided description.
        message: String,
    },

    /// A filter or options tree could not be translated or executed.
    #[error("query error: {message}")]
    Query {
        /// Description of the query problem.
        message: String,
        /// The SQL under translation or execution, when available.
        sql: Option<String>,
    },

    /// An unclassified driver error.
    #[error("database error: {message}")]
    Database {
        /// Driver-provided description.
        message: String,
        /// The driver's extended result code, when available.
        driver_code: Option<i32>,
    },

    /// The connection is unavailable or has been closed.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the connection problem.
        message: String,
    },

    /// A transaction could not begin, commit, roll back, or nest.
    #[error("transaction {step} failed: {message}")]
    Transaction {
        /// Description of the failure.
        message: String,
        /// Which step failed.
        step: TxStep,
    },

    /// A document body could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// The offending field, when known.
        field: Option<String>,
        /// Description of the failure.
        message: String,
    },

    /// A find-and-modify with `ReturnDocument::Before` matched nothing.
    #[error("document not found: {id}")]
    NotFound {
        /// The id or filter description that matched nothing.
        id: String,
    },

    /// The operation was cancelled through its cancellation handle.
    #[error("operation aborted")]
    Aborted {
        /// The caller-supplied cancellation reason, when given.
        reason: Option<String>,
    },

    /// The API was misused (e.g. operating on a dropped collection).
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the misuse.
        message: String,
    },
}

/// Convenience alias used throughout the doclite crates.
pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    // -- Constructors --------------------------------------------------------

    /// Creates a [`DbError::Validation`] without a field.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    /// Creates a [`DbError::Validation`] naming the offending field.
    pub fn validation_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Creates a [`DbError::SchemaValidation`].
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            message: message.into(),
        }
    }

    /// Creates a [`DbError::UniqueConstraint`].
    pub fn unique(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::UniqueConstraint {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates a [`DbError::Query`] without SQL context.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    /// Creates a [`DbError::Query`] carrying the SQL under execution.
    pub fn query_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Creates a [`DbError::Connection`].
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a [`DbError::Transaction`] for the given step.
    pub fn transaction(step: TxStep, message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            step,
        }
    }

    /// Creates a [`DbError::Serialization`] without a field.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            field: None,
            message: message.into(),
        }
    }

    /// Creates a [`DbError::NotFound`].
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a [`DbError::Aborted`] with an optional reason.
    pub fn aborted(reason: Option<String>) -> Self {
        Self::Aborted { reason }
    }

    /// Creates a [`DbError::InvalidOperation`].
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    // -- Predicates ----------------------------------------------------------

    /// Returns `true` if the error is transient and the operation may succeed
    /// on retry: busy/locked driver codes, connection failures, and
    /// transaction failures other than nesting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database {
                driver_code: Some(code),
                ..
            } => {
                // Primary code lives in the low byte of the extended code.
                let primary = code & 0xff;
                primary == 5 || primary == 6 // SQLITE_BUSY, SQLITE_LOCKED
            }
            Self::Connection { .. } => true,
            Self::Transaction { step, .. } => *step != TxStep::Nest,
            _ => false,
        }
    }

    /// Returns `true` if this is a [`DbError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a [`DbError::Aborted`].
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            field: None,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_locked_codes_are_retryable() {
        let busy = DbError::Database {
            message: "database is locked".into(),
            driver_code: Some(5),
        };
        let busy_snapshot = DbError::Database {
            message: "busy".into(),
            driver_code: Some(517), // SQLITE_BUSY_SNAPSHOT = 5 | (2 << 8)
        };
        let locked = DbError::Database {
            message: "locked".into(),
            driver_code: Some(6),
        };
        assert!(busy.is_retryable());
        assert!(busy_snapshot.is_retryable());
        assert!(locked.is_retryable());
    }

    #[test]
    fn business_errors_are_not_retryable() {
        assert!(!DbError::validation("bad").is_retryable());
        assert!(!DbError::unique("email", "a@x").is_retryable());
        assert!(!DbError::aborted(None).is_retryable());
        assert!(
            !DbError::Constraint {
                message: "check failed".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn nested_transaction_is_not_retryable() {
        assert!(!DbError::transaction(TxStep::Nest, "nested").is_retryable());
        assert!(DbError::transaction(TxStep::Begin, "busy").is_retryable());
        assert!(DbError::transaction(TxStep::Commit, "busy").is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let e = DbError::unique("email", "a@x");
        assert_eq!(e.to_string(), "unique constraint violated on email: a@x");
        let t = DbError::transaction(TxStep::Nest, "transaction already active");
        assert_eq!(t.to_string(), "transaction nest failed: transaction already active");
    }

    #[test]
    fn serde_json_errors_map_to_serialization() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let e: DbError = bad.into();
        assert!(matches!(e, DbError::Serialization { field: None, .. }));
    }
}
