//! The query provider: compile-or-fetch a plan for an expression, then run
//! it against a caller-supplied connection.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TranslateOptions;
use crate::context::QueryContext;
use crate::db::{
    DataConnection, DefaultRowMapper, FromQueryValue, FromRow, MapContext, QueryValue, RowMapper,
};
use crate::dialect::{DialectError, DialectTranslator, TranslateContext, TranslateResult};
use crate::error::{QueryError, TranslationCause, TranslationError};
use crate::execution::{
    build, BuildOptions, CacheStats, CachedPlan, ExecutionPlan, Invocation, OptionsKey,
    PlanCache, PlanContext, PlanKey, PlanMode, SignatureClassifier, SignatureDescriptor,
};
use crate::expr::{collect_constants, Expr, ExprRef, Fingerprint, Value};
use crate::relational::{translate, DialectContext, RelationalForm, SegmentFinder, SelectGatherer};

pub struct QueryProvider {
    context: Arc<dyn QueryContext>,
    cache: PlanCache,
    classifier: SignatureClassifier,
}

impl QueryProvider {
    /// A provider with its own plan cache and signature classifier.
    pub fn new(context: Arc<dyn QueryContext>) -> Self {
        let cache = PlanCache::new(&context.cache_options());
        info!(
            dialect = context.dialect().name(),
            entities = context.catalog().len(),
            cache_enabled = cache.is_enabled(),
            "query provider created"
        );
        Self {
            context,
            cache,
            classifier: SignatureClassifier::new(),
        }
    }

    pub fn context(&self) -> &Arc<dyn QueryContext> {
        &self.context
    }

    /// Compile `expr` for `mode`, or fetch the plan compiled for an
    /// expression of the same shape.
    pub fn plan(
        &self,
        expr: &ExprRef,
        mode: PlanMode,
    ) -> Result<Arc<CachedPlan>, TranslationError> {
        let root = Expr::unwrap_root(expr);
        let dialect = self.context.dialect();
        let options = self.context.translate_options();
        let no_tracking = !options.trace_entity_state;
        let fingerprint = Fingerprint::of(&root);
        let key = PlanKey {
            prefix: self.cache.prefix().clone(),
            dialect: Arc::from(dialect.name()),
            options: OptionsKey {
                quote_identifiers: options.quote_identifiers,
                no_tracking,
            },
            mode,
            fingerprint: fingerprint.clone(),
        };

        let started = Instant::now();
        let result = self.cache.get_or_compile(key, || {
            let plan = self.compile(
                &root,
                dialect.as_ref(),
                &options,
                BuildOptions::for_mode(mode, no_tracking),
            )?;
            let descriptor = self.classifier.classify(plan.parameter_types());
            Ok(CachedPlan { plan, descriptor })
        });

        match result {
            Ok((plan, fresh)) => {
                if fresh {
                    debug!(
                        %fingerprint,
                        ?mode,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "plan compiled"
                    );
                } else {
                    debug!(%fingerprint, ?mode, "plan cache hit");
                }
                Ok(plan)
            }
            Err(e) => {
                warn!(%fingerprint, error = %e, "query translation failed");
                Err(e.within(expr))
            }
        }
    }

    fn compile(
        &self,
        root: &ExprRef,
        dialect: &dyn DialectTranslator,
        options: &TranslateOptions,
        build_options: BuildOptions,
    ) -> Result<ExecutionPlan, TranslationError> {
        let form = self.relational_form(root, dialect)?;
        let constants = collect_constants(root);
        build(
            &form,
            |form| {
                dialect.translate(
                    &form.select,
                    &TranslateContext {
                        constants: &constants,
                        segment: form.segment,
                        options,
                    },
                )
            },
            build_options,
        )
    }

    fn relational_form(
        &self,
        root: &ExprRef,
        dialect: &dyn DialectTranslator,
    ) -> Result<RelationalForm, TranslationError> {
        translate(
            root,
            &DialectContext {
                catalog: self.context.catalog(),
                dialect,
            },
        )
    }

    /// Blocking execution.
    pub fn execute(
        &self,
        connection: &dyn DataConnection,
        expr: &ExprRef,
    ) -> Result<QueryValue, QueryError> {
        let cached = self.plan(expr, PlanMode::Sync)?;
        let invocation = invocation(cached.descriptor, connection, expr, None);
        cached.plan.invoke(invocation)
    }

    /// Blocking execution with the result converted to `T`.
    pub fn execute_typed<T: FromQueryValue>(
        &self,
        connection: &dyn DataConnection,
        expr: &ExprRef,
    ) -> Result<T, QueryError> {
        let value = self.execute(connection, expr)?;
        Ok(T::from_query_value(value)?)
    }

    pub async fn execute_async<T: FromQueryValue>(
        &self,
        connection: &dyn DataConnection,
        expr: &ExprRef,
        cancel: CancellationToken,
    ) -> Result<T, QueryError> {
        let cached = self.plan(expr, PlanMode::Async)?;
        let descriptor = cached.descriptor;
        let invocation = invocation(descriptor, connection, expr, Some(cancel));
        let value = if descriptor.is_async {
            cached.plan.invoke_async(invocation).await?
        } else {
            cached.plan.invoke(invocation)?
        };
        Ok(T::from_query_value(value)?)
    }

    /// Rows as a lazy stream of entities. Translation errors are returned
    /// before any row is fetched; execution errors and cancellation arrive
    /// through the stream.
    pub fn execute_stream<'a, T>(
        &self,
        connection: &'a dyn DataConnection,
        expr: &ExprRef,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'a, Result<T, QueryError>>, QueryError>
    where
        T: FromRow + Send + 'a,
    {
        self.execute_stream_with(connection, expr, cancel, DefaultRowMapper::<T>::new())
    }

    pub fn execute_stream_with<'a, T, M>(
        &self,
        connection: &'a dyn DataConnection,
        expr: &ExprRef,
        cancel: CancellationToken,
        mapper: M,
    ) -> Result<BoxStream<'a, Result<T, QueryError>>, QueryError>
    where
        T: Send + 'a,
        M: RowMapper<T> + 'a,
    {
        let cached = self.plan(expr, PlanMode::Stream)?;
        let ctx = MapContext {
            no_tracking: cached.plan.no_tracking(),
        };
        let invocation = invocation(cached.descriptor, connection, expr, Some(cancel));
        let rows = cached.plan.stream(invocation);
        Ok(rows
            .map(move |row| row.and_then(|row| Ok(mapper.map(row, &ctx)?)))
            .boxed())
    }

    /// Command text and parameters for `expr`, with every nested select
    /// translated on its own, outer first. Never touches the plan cache.
    pub fn translate(
        &self,
        expr: &ExprRef,
        options: Option<TranslateOptions>,
    ) -> Result<TranslateResult, TranslationError> {
        let root = Expr::unwrap_root(expr);
        let dialect = self.context.dialect();
        let options = options.unwrap_or_else(|| self.context.translate_options());
        let form = self
            .relational_form(&root, dialect.as_ref())
            .map_err(|e| e.within(expr))?;
        let constants = collect_constants(&root);
        let ctx = TranslateContext {
            constants: &constants,
            segment: form.segment,
            options: &options,
        };
        let dialect_error = |e: DialectError| {
            TranslationError::new(&root, TranslationCause::Dialect(e)).within(expr)
        };

        let mut result = dialect.translate(&form.select, &ctx).map_err(dialect_error)?;
        for nested in SelectGatherer::gather(&form.select, &root).into_iter().skip(1) {
            result
                .nested_results
                .push(dialect.translate(nested, &ctx).map_err(dialect_error)?);
        }
        Ok(result)
    }

    /// Compile a plan for `expr` without consulting or filling the cache.
    /// `is_async` of `None` compiles a synchronous plan.
    pub fn get_execution_plan(
        &self,
        expr: &ExprRef,
        is_async: Option<bool>,
    ) -> Result<ExecutionPlan, TranslationError> {
        let root = Expr::unwrap_root(expr);
        let dialect = self.context.dialect();
        let options = self.context.translate_options();
        let build_options = BuildOptions {
            is_async,
            is_enumerable: false,
            is_no_tracking: !options.trace_entity_state,
        };
        self.compile(&root, dialect.as_ref(), &options, build_options)
            .map_err(|e| e.within(expr))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Distinct invocation signatures seen so far.
    pub fn signature_count(&self) -> usize {
        self.classifier.len()
    }
}

/// Arguments for one call of a plan with the given signature. Constants and
/// the segment are taken from the caller's expression, not from the one the
/// plan was compiled for.
fn invocation<'a>(
    descriptor: SignatureDescriptor,
    connection: &'a dyn DataConnection,
    expr: &ExprRef,
    cancel: Option<CancellationToken>,
) -> Invocation<'a> {
    let root = Expr::unwrap_root(expr);
    let constants: Vec<Value> = collect_constants(&root);
    let ctx = PlanContext {
        connection,
        constants,
    };
    let segment = SegmentFinder::find(&root).unwrap_or_default();
    let cancel = cancel.unwrap_or_default();
    match (descriptor.is_async, descriptor.has_segment) {
        (false, false) => Invocation::Context(ctx),
        (false, true) => Invocation::ContextSegment(ctx, segment),
        (true, false) => Invocation::ContextCancel(ctx, cancel),
        (true, true) => Invocation::ContextSegmentCancel(ctx, segment, cancel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheOptions;
    use crate::context::ProviderContext;
    use crate::db::{CellValue, ColumnInfo, ExecutionError, Row};
    use crate::dialect::PostgresDialect;
    use crate::expr::builder::*;
    use crate::expr::DataSegment;
    use crate::relational::ParamSource;
    use crate::testing::{init_tracing, sample_catalog, CountingDialect, MemoryConnection};
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;
    use std::time::Duration;

    fn provider_with(dialect: Arc<CountingDialect>, cache: CacheOptions) -> QueryProvider {
        init_tracing();
        let context = ProviderContext::new(sample_catalog())
            .with_dialect(dialect)
            .with_cache_options(cache);
        QueryProvider::new(Arc::new(context))
    }

    fn provider() -> (QueryProvider, Arc<CountingDialect>) {
        let dialect = Arc::new(CountingDialect::new());
        (provider_with(dialect.clone(), CacheOptions::default()), dialect)
    }

    fn adults(min_age: i64) -> ExprRef {
        entity("Customer")
            .filter("c", param("c").member("age").greater_or_equal(constant(min_age)))
            .select("c", param("c").member("name"))
            .build()
    }

    fn name_rows(names: &[&str]) -> Vec<Row> {
        let columns: Arc<[ColumnInfo]> = vec![ColumnInfo::new("name", "text")].into();
        names
            .iter()
            .map(|n| Row::new(columns.clone(), vec![CellValue::Text(n.to_string())]))
            .collect()
    }

    fn count_rows(n: i64) -> Vec<Row> {
        vec![Row::new(
            vec![ColumnInfo::new("count", "int8")].into(),
            vec![CellValue::Int64(n)],
        )]
    }

    #[derive(Debug, PartialEq)]
    struct Name(String);

    impl FromRow for Name {
        fn from_row(row: &Row) -> Result<Self, crate::error::CastError> {
            Ok(Name(row.get_as("name")?))
        }
    }

    #[test]
    fn test_where_select_translation() {
        let (provider, _) = provider();
        let expr = entity("Customer")
            .filter("c", param("c").member("active"))
            .select("c", param("c").member("name"))
            .build();
        let result = provider.translate(&expr, None).unwrap();
        assert_eq!(
            result.command_text,
            "SELECT t0.name FROM customers AS t0 WHERE t0.active"
        );
        assert!(result.parameters.is_empty());
        assert!(result.nested_results.is_empty());
    }

    #[test]
    fn test_translate_bypasses_cache() {
        let (provider, dialect) = provider();
        provider.translate(&adults(18), None).unwrap();
        provider.translate(&adults(18), None).unwrap();
        assert_eq!(dialect.translations(), 2);
        assert_eq!(provider.cache_stats().entries, 0);
    }

    #[test]
    fn test_translate_with_options_override() {
        let (provider, _) = provider();
        let options = TranslateOptions {
            quote_identifiers: true,
            ..TranslateOptions::default()
        };
        let result = provider.translate(&adults(21), Some(options)).unwrap();
        assert_eq!(
            result.command_text,
            r#"SELECT "t0"."name" FROM "customers" AS "t0" WHERE "t0"."age" >= $1"#
        );
        assert_eq!(result.parameter_values(), vec![Value::Int(21)]);
    }

    #[test]
    fn test_nested_results_in_source_order() {
        let (provider, _) = provider();
        let orders_of_c = || {
            entity("Order").filter(
                "o",
                param("o").member("customer_id").equal(param("c").member("id")),
            )
        };
        let expr = entity("Customer")
            .filter("c", orders_of_c().any().build())
            .select(
                "c",
                new_object(vec![
                    ("name", param("c").member("name")),
                    ("orders", orders_of_c().count().build()),
                ]),
            )
            .build();
        let result = provider.translate(&expr, None).unwrap();
        assert!(result.command_text.contains("EXISTS (SELECT 1 FROM orders"));
        assert_eq!(result.nested_results.len(), 2);
        assert!(result.nested_results[0]
            .command_text
            .starts_with("SELECT 1 FROM orders"));
        assert!(result.nested_results[1]
            .command_text
            .starts_with("SELECT COUNT(*) FROM orders"));
    }

    #[test]
    fn test_paged_query_descriptor() {
        let (provider, _) = provider();
        let expr = entity("Customer")
            .order_by("c", param("c").member("id"))
            .skip(20)
            .take(10)
            .build();
        let cached = provider.plan(&expr, PlanMode::Sync).unwrap();
        assert!(cached.descriptor.has_segment);
        assert!(!cached.descriptor.is_async);
        assert_eq!(
            SegmentFinder::find(&expr),
            Some(DataSegment::new(20, 10))
        );
        assert_eq!(
            cached.plan.command().sources,
            vec![ParamSource::SegmentLength, ParamSource::SegmentStart]
        );
    }

    #[test]
    fn test_paged_execution_binds_callers_segment() {
        let (provider, dialect) = provider();
        let conn = MemoryConnection::new(name_rows(&["Ann"]));
        for (skip, take) in [(20, 10), (40, 5)] {
            let expr = entity("Customer")
                .order_by("c", param("c").member("id"))
                .skip(skip)
                .take(take)
                .select("c", param("c").member("name"))
                .build();
            provider.execute(&conn, &expr).unwrap();
        }
        assert_eq!(dialect.translations(), 1);
        let executed = conn.executed();
        assert_eq!(executed[0].parameters, vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(executed[1].parameters, vec![Value::Int(5), Value::Int(40)]);
    }

    #[test]
    fn test_oversized_skip_clamps_offset() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(name_rows(&[]));
        let expr = entity("Customer")
            .order_by("c", param("c").member("id"))
            .skip(i64::MAX)
            .skip(i64::MAX)
            .take(10)
            .build();
        provider.execute(&conn, &expr).unwrap();
        assert_eq!(
            conn.executed()[0].parameters,
            vec![Value::Int(10), Value::Int(i64::MAX)]
        );
    }

    #[test]
    fn test_repeated_execution_uses_cached_plan() {
        let (provider, dialect) = provider();
        let conn = MemoryConnection::new(name_rows(&["Ann", "Bob"]));
        let first = provider.plan(&adults(18), PlanMode::Sync).unwrap();
        let second = provider.plan(&adults(65), PlanMode::Sync).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        provider.execute(&conn, &adults(30)).unwrap();
        assert_eq!(dialect.translations(), 1);
        assert_eq!(conn.executed()[0].parameters, vec![Value::Int(30)]);
        let stats = provider.cache_stats();
        assert_eq!(stats.compiles, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn test_disabled_cache_translates_every_call() {
        let dialect = Arc::new(CountingDialect::new());
        let provider = provider_with(dialect.clone(), CacheOptions::disabled());
        let conn = MemoryConnection::new(name_rows(&["Ann"]));
        for age in [18, 30, 45] {
            provider.execute(&conn, &adults(age)).unwrap();
        }
        assert_eq!(dialect.translations(), 3);
        assert_eq!(provider.cache_stats().entries, 0);
    }

    #[test]
    fn test_concurrent_first_compile_runs_once() {
        let dialect = Arc::new(CountingDialect::new().with_delay(Duration::from_millis(25)));
        let provider = Arc::new(provider_with(dialect.clone(), CacheOptions::default()));
        let threads = 64;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let provider = provider.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    provider.plan(&adults(i as i64), PlanMode::Sync).unwrap()
                })
            })
            .collect();
        let plans: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(plans.iter().all(|p| Arc::ptr_eq(p, &plans[0])));
        assert_eq!(dialect.translations(), 1);
        assert_eq!(provider.cache_stats().compiles, 1);
    }

    #[test]
    fn test_concurrent_execute_translates_once() {
        let dialect = Arc::new(CountingDialect::new().with_delay(Duration::from_millis(25)));
        let provider = Arc::new(provider_with(dialect.clone(), CacheOptions::default()));
        let conn = Arc::new(MemoryConnection::new(name_rows(&["Ann"])));
        let threads = 64;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let provider = provider.clone();
                let conn = conn.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let names: Vec<Name> = provider
                        .execute_typed(conn.as_ref(), &adults(i as i64))
                        .unwrap();
                    names
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![Name("Ann".into())]);
        }
        assert_eq!(dialect.translations(), 1);

        let mut ages: Vec<Value> = conn
            .executed()
            .into_iter()
            .flat_map(|command| command.parameters)
            .collect();
        ages.sort_by_key(|v| match v {
            Value::Int(n) => *n,
            _ => -1,
        });
        let expected: Vec<Value> = (0..threads as i64).map(Value::Int).collect();
        assert_eq!(ages, expected);
    }

    #[test]
    fn test_classifier_shared_across_queries() {
        let (provider, _) = provider();
        provider.plan(&adults(18), PlanMode::Sync).unwrap();
        provider
            .plan(&entity("Order").build(), PlanMode::Sync)
            .unwrap();
        provider
            .plan(&entity("Customer").count().build(), PlanMode::Sync)
            .unwrap();
        assert_eq!(provider.signature_count(), 1);
        provider.plan(&adults(18), PlanMode::Async).unwrap();
        assert_eq!(provider.signature_count(), 2);
    }

    #[test]
    fn test_execute_typed_scalar_and_cast_error() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(count_rows(3));
        let expr = entity("Customer").count().build();
        let count: i64 = provider.execute_typed(&conn, &expr).unwrap();
        assert_eq!(count, 3);

        let err = provider.execute_typed::<String>(&conn, &expr).unwrap_err();
        match err {
            QueryError::Cast(cast) => {
                assert!(cast.expected.contains("String"));
                assert_eq!(cast.actual, "int8");
            }
            other => panic!("expected cast error, got {other:?}"),
        }
    }

    #[test]
    fn test_translation_error_names_original_expression() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(Vec::new());
        let expr = entity("Customer")
            .filter("c", param("c").member("nickname").equal(constant("x")))
            .build();
        let err = provider.execute(&conn, &expr).unwrap_err();
        let QueryError::Translation(err) = err else {
            panic!("expected translation error");
        };
        assert!(Arc::ptr_eq(&err.expression, &expr));
        assert_eq!(err.node.to_string(), "c.nickname");
        assert!(conn.executed().is_empty());
        assert_eq!(provider.cache_stats().entries, 0);
    }

    #[test]
    fn test_execution_error_passes_through() {
        let (provider, _) = provider();
        let conn = MemoryConnection::failing(ExecutionError::Connection("reset by peer".into()));
        let err = provider.execute(&conn, &adults(18)).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Execution(ExecutionError::Connection(ref msg)) if msg == "reset by peer"
        ));
    }

    #[test]
    fn test_first_on_empty_result() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(Vec::new());
        let first = entity("Customer").first().build();
        assert!(matches!(
            provider.execute(&conn, &first),
            Err(QueryError::NoElements)
        ));
        let first_or_default = entity("Customer").first_or_default().build();
        let row: Option<Row> = provider.execute_typed(&conn, &first_or_default).unwrap();
        assert_eq!(row, None);
    }

    #[test]
    fn test_get_execution_plan_is_uncached() {
        let (provider, dialect) = provider();
        let plan = provider.get_execution_plan(&adults(18), Some(true)).unwrap();
        assert_eq!(plan.mode(), PlanMode::Async);
        let plan = provider.get_execution_plan(&adults(18), None).unwrap();
        assert_eq!(plan.mode(), PlanMode::Sync);
        assert_eq!(dialect.translations(), 2);
        assert_eq!(provider.cache_stats().entries, 0);
    }

    #[test]
    fn test_clear_cache_forces_recompile() {
        let (provider, dialect) = provider();
        provider.plan(&adults(18), PlanMode::Sync).unwrap();
        provider.clear_cache();
        provider.plan(&adults(18), PlanMode::Sync).unwrap();
        assert_eq!(dialect.translations(), 2);
    }

    #[test]
    fn test_quoted_identifiers_reach_the_plan() {
        let dialect = Arc::new(CountingDialect::new());
        let plain = Arc::new(ProviderContext::new(sample_catalog()).with_dialect(dialect.clone()));
        let provider = QueryProvider::new(plain);
        let first = provider.plan(&adults(18), PlanMode::Sync).unwrap();
        assert!(!first.plan.command().text.contains('"'));

        let quoted = ProviderContext::new(sample_catalog())
            .with_dialect(Arc::new(PostgresDialect::new()))
            .with_translate_options(TranslateOptions {
                quote_identifiers: true,
                ..TranslateOptions::default()
            });
        let provider = QueryProvider::new(Arc::new(quoted));
        let second = provider.plan(&adults(18), PlanMode::Sync).unwrap();
        assert!(second.plan.command().text.contains(r#""customers""#));
    }

    #[tokio::test]
    async fn test_execute_async_returns_rows() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(name_rows(&["Ann", "Bob"]));
        let names: Vec<Name> = provider
            .execute_async(&conn, &adults(18), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names, vec![Name("Ann".into()), Name("Bob".into())]);
    }

    #[tokio::test]
    async fn test_execute_async_cancelled_before_fetch() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(name_rows(&["Ann"]));
        let token = CancellationToken::new();
        token.cancel();
        let err = provider
            .execute_async::<QueryValue>(&conn, &adults(18), token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn test_stream_cancel_after_first_item() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(name_rows(&["Ann", "Bob", "Cid", "Dee"]));
        let token = CancellationToken::new();
        let mut names = provider
            .execute_stream::<Name>(&conn, &adults(18), token.clone())
            .unwrap();

        assert_eq!(names.next().await.unwrap().unwrap(), Name("Ann".into()));
        token.cancel();
        let err = names.next().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(names.next().await.is_none());
        assert_eq!(conn.fetched.load(Ordering::SeqCst), 1);

        let cached = provider.plan(&adults(18), PlanMode::Stream).unwrap();
        assert_eq!(cached.plan.mode(), PlanMode::Stream);
    }

    #[tokio::test]
    async fn test_stream_with_initializer_sees_no_tracking() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(name_rows(&["Ann"]));
        let mapper = DefaultRowMapper::<Name>::new().with_initializer(|name, ctx| {
            if ctx.no_tracking {
                name.0.push_str(" (detached)");
            }
        });
        let names: Vec<_> = provider
            .execute_stream_with(&conn, &adults(18), CancellationToken::new(), mapper)
            .unwrap()
            .collect()
            .await;
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].as_ref().unwrap(), &Name("Ann (detached)".into()));
    }

    #[test]
    fn test_stream_translation_error_is_eager() {
        let (provider, _) = provider();
        let conn = MemoryConnection::new(Vec::new());
        let result = provider.execute_stream::<Name>(
            &conn,
            &entity("Invoice").build(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(QueryError::Translation(_))));
    }
}
