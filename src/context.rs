//! What a provider needs from its surroundings: the dialect to emit, the
//! entity catalog and the options that shape translation and caching.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::config::{CacheOptions, ProviderConfig, TranslateOptions};
use crate::dialect::{DialectRegistry, DialectTranslator, PostgresDialect};
use crate::relational::Catalog;

pub trait QueryContext: Send + Sync {
    fn dialect(&self) -> Arc<dyn DialectTranslator>;

    fn catalog(&self) -> &Catalog;

    /// A fresh copy; callers may adjust it for a single translation.
    fn translate_options(&self) -> TranslateOptions;

    fn cache_options(&self) -> CacheOptions;
}

/// Static [`QueryContext`] built in code or from a [`ProviderConfig`].
#[derive(Clone)]
pub struct ProviderContext {
    dialect: Arc<dyn DialectTranslator>,
    catalog: Catalog,
    translate: TranslateOptions,
    cache: CacheOptions,
}

impl ProviderContext {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            dialect: Arc::new(PostgresDialect::new()),
            catalog,
            translate: TranslateOptions::default(),
            cache: CacheOptions::default(),
        }
    }

    pub fn with_dialect(mut self, dialect: Arc<dyn DialectTranslator>) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_translate_options(mut self, options: TranslateOptions) -> Self {
        self.translate = options;
        self
    }

    pub fn with_cache_options(mut self, options: CacheOptions) -> Self {
        self.cache = options;
        self
    }

    pub fn from_config(config: &ProviderConfig, registry: &DialectRegistry) -> Result<Self> {
        let dialect = registry.resolve(&config.dialect).ok_or_else(|| {
            anyhow!(
                "unknown dialect `{}` (available: {})",
                config.dialect,
                registry.names().join(", ")
            )
        })?;
        Ok(Self {
            dialect,
            catalog: config.entities.iter().cloned().collect(),
            translate: config.translate.clone(),
            cache: config.cache.clone(),
        })
    }
}

impl QueryContext for ProviderContext {
    fn dialect(&self) -> Arc<dyn DialectTranslator> {
        self.dialect.clone()
    }

    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn translate_options(&self) -> TranslateOptions {
        self.translate.clone()
    }

    fn cache_options(&self) -> CacheOptions {
        self.cache.clone()
    }
}
