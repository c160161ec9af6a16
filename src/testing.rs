//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::db::{Command, DataConnection, ExecutionError, Row};
use crate::dialect::{
    DialectCapabilities, DialectError, DialectTranslator, PostgresDialect, TranslateContext,
    TranslateResult,
};
use crate::relational::{Catalog, DataType, EntityMetadata, SelectQuery};

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub(crate) fn sample_catalog() -> Catalog {
    Catalog::new()
        .with(
            EntityMetadata::new("Customer", "customers")
                .key("id", DataType::Int)
                .property("name", DataType::Text)
                .property("active", DataType::Bool)
                .property("age", DataType::Int)
                .nullable_property("email", DataType::Text)
                .property("city", DataType::Text),
        )
        .with(
            EntityMetadata::new("Order", "orders")
                .key("id", DataType::Int)
                .property("customer_id", DataType::Int)
                .property("total", DataType::Float)
                .nullable_property("placed_at", DataType::Timestamp)
                .property("status", DataType::Text),
        )
}

/// In-memory connection returning the same rows for every command.
pub(crate) struct MemoryConnection {
    rows: Vec<Row>,
    failure: Option<ExecutionError>,
    delay: Option<Duration>,
    /// Rows handed out by streams so far.
    pub fetched: AtomicUsize,
    commands: Mutex<Vec<Command>>,
}

impl MemoryConnection {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            failure: None,
            delay: None,
            fetched: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: ExecutionError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new(Vec::new())
        }
    }

    /// Delay before async and streaming calls return.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    fn record(&self, command: &Command) -> Result<(), ExecutionError> {
        self.commands.lock().unwrap().push(command.clone());
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataConnection for MemoryConnection {
    fn query(&self, command: &Command) -> Result<Vec<Row>, ExecutionError> {
        self.record(command)?;
        Ok(self.rows.clone())
    }

    async fn query_async(&self, command: &Command) -> Result<Vec<Row>, ExecutionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.record(command)?;
        Ok(self.rows.clone())
    }

    async fn query_stream<'a>(
        &'a self,
        command: Command,
    ) -> Result<BoxStream<'a, Result<Row, ExecutionError>>, ExecutionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.record(&command)?;
        Ok(stream::iter(self.rows.iter())
            .map(move |row| {
                self.fetched.fetch_add(1, Ordering::SeqCst);
                Ok(row.clone())
            })
            .boxed())
    }
}

/// PostgreSQL dialect that counts translations.
pub(crate) struct CountingDialect {
    inner: PostgresDialect,
    translations: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingDialect {
    pub fn new() -> Self {
        Self {
            inner: PostgresDialect::new(),
            translations: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Make every translation slow enough for concurrent callers to overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn translations(&self) -> usize {
        self.translations.load(Ordering::SeqCst)
    }
}

impl DialectTranslator for CountingDialect {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> DialectCapabilities {
        self.inner.capabilities()
    }

    fn function_name(&self, name: &str) -> Option<&'static str> {
        self.inner.function_name(name)
    }

    fn translate(
        &self,
        select: &SelectQuery,
        ctx: &TranslateContext<'_>,
    ) -> Result<TranslateResult, DialectError> {
        self.translations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.inner.translate(select, ctx)
    }
}
