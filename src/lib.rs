//! Compiles query expressions into parameterized SQL and caches the
//! resulting execution plans.
//!
//! An expression is translated into a relational form, handed to a dialect
//! for command text, and wrapped in an [`ExecutionPlan`] that is cached under
//! the expression's value-independent [`Fingerprint`]. Expressions that only
//! differ in constants share one plan; constants are bound per call.
//!
//! ```ignore
//! let provider = QueryProvider::new(Arc::new(ProviderContext::new(catalog)));
//! let query = entity("Customer")
//!     .filter("c", param("c").member("age").greater_or_equal(constant(18)))
//!     .select("c", param("c").member("name"))
//!     .build();
//! let names: Vec<Row> = provider.execute_typed(&connection, &query)?;
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod dialect;
pub mod error;
pub mod execution;
pub mod expr;
pub mod provider;
pub mod relational;

#[cfg(test)]
mod testing;

pub use config::{CacheOptions, ProviderConfig, TranslateOptions};
pub use context::{ProviderContext, QueryContext};
pub use db::{DataConnection, FromQueryValue, FromRow, PgConnection, QueryValue, Row};
pub use dialect::{DialectRegistry, DialectTranslator, PostgresDialect, TranslateResult};
pub use error::{CastError, ExecutionError, QueryError, TranslationCause, TranslationError};
pub use execution::{CacheStats, ExecutionPlan, PlanMode, SignatureDescriptor};
pub use expr::{entity, DataSegment, ExprRef, Fingerprint};
pub use provider::QueryProvider;
