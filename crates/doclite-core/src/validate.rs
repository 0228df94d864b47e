//! Validator contract consumed by the collection runtime.
//!
//! A validator is a pure function from a candidate body to either a
//! (possibly transformed) body or a typed failure. The runtime invokes it
//! before every insert, update, and replace, without consulting the driver.

use crate::error::DbError;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// The offending field, when known.
    pub field: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl ValidationFailure {
    /// Creates a failure without a field.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    /// Creates a failure naming the offending field.
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

impl From<ValidationFailure> for DbError {
    fn from(f: ValidationFailure) -> Self {
        DbError::Validation {
            field: f.field,
            message: f.message,
        }
    }
}

/// Validates candidate documents of type `T`.
pub trait Validator<T>: Send + Sync {
    /// Returns the validated (possibly transformed) document, or a failure.
    fn validate(&self, doc: T) -> Result<T, ValidationFailure>;
}

/// Adapter turning a closure into a [`Validator`].
pub struct FnValidator<F>(F);

impl<F> FnValidator<F> {
    /// Wraps the closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<T, F> Validator<T> for FnValidator<F>
where
    F: Fn(T) -> Result<T, ValidationFailure> + Send + Sync,
{
    fn validate(&self, doc: T) -> Result<T, ValidationFailure> {
        (self.0)(doc)
    }
}
