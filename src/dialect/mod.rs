//! Backend-specific command generation.
//!
//! A dialect turns one [`SelectQuery`] into command text plus the ordered
//! parameters that text refers to. Dialects are looked up by name through
//! [`DialectRegistry`], which ships with the built-in PostgreSQL dialect.

mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::TranslateOptions;
use crate::expr::{DataSegment, Value};
use crate::relational::{ParamSource, SelectQuery};

pub use postgres::PostgresDialect;

/// What a dialect can express. The translator rejects constructs a dialect
/// cannot handle instead of producing commands that fail at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectCapabilities {
    /// LIMIT/OFFSET style paging.
    pub paging: bool,
    /// `SELECT EXISTS (...)` as a projection.
    pub exists_projection: bool,
    /// Unknown scalar functions are emitted verbatim.
    pub passthrough_functions: bool,
}

impl Default for DialectCapabilities {
    fn default() -> Self {
        Self {
            paging: true,
            exists_projection: true,
            passthrough_functions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DialectError {
    #[error("{dialect} cannot emit {construct}")]
    Unsupported { dialect: String, construct: String },
    #[error("no value for constant slot {0}")]
    MissingConstant(usize),
    #[error("query is paged but no segment was supplied")]
    MissingSegment,
}

/// Inputs for one dialect translation.
#[derive(Debug, Clone, Copy)]
pub struct TranslateContext<'a> {
    /// Constant values of the expression being translated, by slot.
    pub constants: &'a [Value],
    pub segment: Option<DataSegment>,
    pub options: &'a TranslateOptions,
}

impl TranslateContext<'_> {
    pub fn values(&self) -> ParameterValues<'_> {
        ParameterValues {
            constants: self.constants,
            segment: self.segment,
        }
    }

    pub fn resolve(&self, source: ParamSource) -> Result<Value, DialectError> {
        self.values().resolve(source)
    }
}

/// The values one invocation supplies for a command's parameter sources.
#[derive(Debug, Clone, Copy)]
pub struct ParameterValues<'a> {
    pub constants: &'a [Value],
    pub segment: Option<DataSegment>,
}

impl ParameterValues<'_> {
    pub fn resolve(&self, source: ParamSource) -> Result<Value, DialectError> {
        match source {
            ParamSource::Constant(slot) => self
                .constants
                .get(slot)
                .cloned()
                .ok_or(DialectError::MissingConstant(slot)),
            ParamSource::SegmentStart => self
                .segment
                .map(|s| s.start_value())
                .ok_or(DialectError::MissingSegment),
            ParamSource::SegmentLength => self
                .segment
                .map(|s| s.length_value())
                .ok_or(DialectError::MissingSegment),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    /// Placeholder as it appears in the command text.
    pub name: String,
    pub source: ParamSource,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranslateResult {
    pub command_text: String,
    pub parameters: Vec<BoundParameter>,
    /// Nested selects, in discovery order. Only filled on the `translate`
    /// introspection path.
    pub nested_results: Vec<TranslateResult>,
}

impl TranslateResult {
    pub fn parameter_values(&self) -> Vec<Value> {
        self.parameters.iter().map(|p| p.value.clone()).collect()
    }

    pub fn sources(&self) -> Vec<ParamSource> {
        self.parameters.iter().map(|p| p.source).collect()
    }
}

pub trait DialectTranslator: Send + Sync {
    /// Name used in cache keys and error messages.
    fn name(&self) -> &str;

    fn capabilities(&self) -> DialectCapabilities;

    /// Native name of a portable scalar function (`to_lower` → `LOWER`).
    fn function_name(&self, name: &str) -> Option<&'static str>;

    fn translate(
        &self,
        select: &SelectQuery,
        ctx: &TranslateContext<'_>,
    ) -> Result<TranslateResult, DialectError>;
}

/// Dialects by configured name.
pub struct DialectRegistry {
    dialects: HashMap<String, Arc<dyn DialectTranslator>>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        let mut registry = Self {
            dialects: HashMap::new(),
        };
        let postgres: Arc<dyn DialectTranslator> = Arc::new(PostgresDialect::new());
        registry.register("postgres", postgres.clone());
        registry.register("postgresql", postgres);
        registry
    }
}

impl DialectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, dialect: Arc<dyn DialectTranslator>) {
        self.dialects.insert(name.to_ascii_lowercase(), dialect);
    }

    /// Case-insensitive lookup.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn DialectTranslator>> {
        self.dialects.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dialects.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}
