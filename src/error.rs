//! Error taxonomy of the query pipeline.
//!
//! Compilation failures surface as [`TranslationError`] and are never cached.
//! Failures of the data connection pass through unchanged as
//! [`ExecutionError`]. Cancellation is its own outcome, distinct from both.

use thiserror::Error;

use crate::dialect::DialectError;
use crate::expr::ExprRef;

pub use crate::db::{DatabaseError, ErrorCategory, ExecutionError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Cast(#[from] CastError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("query execution was cancelled")]
    Cancelled,
    #[error("sequence contains no elements")]
    NoElements,
    #[error("sequence contains more than one element")]
    MoreThanOneElement,
}

impl QueryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }

    pub fn is_translation(&self) -> bool {
        matches!(self, QueryError::Translation(_))
    }
}

/// A query that could not be compiled. `expression` is the query as the
/// caller passed it, `node` the sub-expression that failed.
#[derive(Debug, Clone, Error)]
#[error("cannot translate `{node}`: {cause}")]
pub struct TranslationError {
    pub expression: ExprRef,
    pub node: ExprRef,
    pub cause: TranslationCause,
}

impl TranslationError {
    pub fn new(node: &ExprRef, cause: TranslationCause) -> Self {
        Self {
            expression: node.clone(),
            node: node.clone(),
            cause,
        }
    }

    /// Attribute the failure to the whole query `expression`.
    pub fn within(mut self, expression: &ExprRef) -> Self {
        self.expression = expression.clone();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranslationCause {
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
    #[error("`{entity}` has no member `{member}`")]
    UnknownMember { entity: String, member: String },
    #[error("parameter `{0}` is not bound by an enclosing lambda")]
    UnboundParameter(String),
    #[error("operator {0} is not supported here")]
    UnsupportedOperator(&'static str),
    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),
    #[error("unknown function `{0}`")]
    UnsupportedFunction(String),
    #[error("dialect `{dialect}` does not support {capability}")]
    Capability {
        dialect: String,
        capability: &'static str,
    },
    #[error(transparent)]
    Dialect(#[from] DialectError),
}

/// A result that cannot be converted to the type the caller asked for.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert {actual} to {expected}")]
pub struct CastError {
    pub expected: &'static str,
    pub actual: String,
}

impl CastError {
    pub fn new<T>(actual: impl Into<String>) -> Self {
        Self {
            expected: std::any::type_name::<T>(),
            actual: actual.into(),
        }
    }
}
