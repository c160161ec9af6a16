//! Compiled execution plans.
//!
//! A plan owns the command text and the parameter sources the dialect
//! produced, never parameter values. Everything that varies per call (the
//! connection, the constants of the caller's expression, the segment and the
//! cancellation token) arrives through an [`Invocation`], so one plan can be
//! shared by any number of concurrent callers.

use std::sync::Arc;

use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::db::{Command, DataConnection, ExecutionError, QueryValue, Row};
use crate::dialect::ParameterValues;
use crate::error::QueryError;
use crate::expr::{DataSegment, Value};
use crate::relational::{ParamSource, ResultShape};

/// One parameter of a plan's invocation signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Connection plus bound constants.
    Context,
    Segment,
    Cancellation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanMode {
    Sync,
    Async,
    /// Rows are produced lazily as the caller polls.
    Stream,
}

impl PlanMode {
    pub fn is_async(self) -> bool {
        !matches!(self, PlanMode::Sync)
    }
}

/// Command text with the source of every placeholder, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCommand {
    pub text: String,
    pub sources: Vec<ParamSource>,
}

impl CompiledCommand {
    /// Bind the values of one invocation.
    pub fn bind(
        &self,
        constants: &[Value],
        segment: Option<DataSegment>,
    ) -> Result<Command, ExecutionError> {
        let values = ParameterValues { constants, segment };
        let parameters = self
            .sources
            .iter()
            .map(|source| values.resolve(*source))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExecutionError::Command(e.to_string()))?;
        Ok(Command::new(self.text.clone(), parameters))
    }
}

/// The four invocation signatures a plan can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Invoker {
    Context,
    ContextSegment,
    ContextCancel,
    ContextSegmentCancel,
}

impl Invoker {
    pub fn select(is_async: bool, has_segment: bool) -> Self {
        match (is_async, has_segment) {
            (false, false) => Invoker::Context,
            (false, true) => Invoker::ContextSegment,
            (true, false) => Invoker::ContextCancel,
            (true, true) => Invoker::ContextSegmentCancel,
        }
    }

    pub fn parameter_types(self) -> &'static [ParamType] {
        match self {
            Invoker::Context => &[ParamType::Context],
            Invoker::ContextSegment => &[ParamType::Context, ParamType::Segment],
            Invoker::ContextCancel => &[ParamType::Context, ParamType::Cancellation],
            Invoker::ContextSegmentCancel => &[
                ParamType::Context,
                ParamType::Segment,
                ParamType::Cancellation,
            ],
        }
    }
}

/// The connection a plan runs against plus the constants of the caller's
/// expression, by slot.
pub struct PlanContext<'a> {
    pub connection: &'a dyn DataConnection,
    pub constants: Vec<Value>,
}

/// Arguments of one plan call, one variant per [`Invoker`].
pub enum Invocation<'a> {
    Context(PlanContext<'a>),
    ContextSegment(PlanContext<'a>, DataSegment),
    ContextCancel(PlanContext<'a>, CancellationToken),
    ContextSegmentCancel(PlanContext<'a>, DataSegment, CancellationToken),
}

impl<'a> Invocation<'a> {
    pub fn invoker(&self) -> Invoker {
        match self {
            Invocation::Context(..) => Invoker::Context,
            Invocation::ContextSegment(..) => Invoker::ContextSegment,
            Invocation::ContextCancel(..) => Invoker::ContextCancel,
            Invocation::ContextSegmentCancel(..) => Invoker::ContextSegmentCancel,
        }
    }

    fn into_parts(self) -> (PlanContext<'a>, Option<DataSegment>, Option<CancellationToken>) {
        match self {
            Invocation::Context(ctx) => (ctx, None, None),
            Invocation::ContextSegment(ctx, segment) => (ctx, Some(segment), None),
            Invocation::ContextCancel(ctx, token) => (ctx, None, Some(token)),
            Invocation::ContextSegmentCancel(ctx, segment, token) => {
                (ctx, Some(segment), Some(token))
            }
        }
    }
}

struct Prepared<'a> {
    connection: &'a dyn DataConnection,
    command: Command,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    command: Arc<CompiledCommand>,
    shape: ResultShape,
    mode: PlanMode,
    invoker: Invoker,
    no_tracking: bool,
}

impl ExecutionPlan {
    pub fn new(
        command: CompiledCommand,
        shape: ResultShape,
        mode: PlanMode,
        invoker: Invoker,
        no_tracking: bool,
    ) -> Self {
        Self {
            command: Arc::new(command),
            shape,
            mode,
            invoker,
            no_tracking,
        }
    }

    pub fn command(&self) -> &CompiledCommand {
        &self.command
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    pub fn invoker(&self) -> Invoker {
        self.invoker
    }

    pub fn no_tracking(&self) -> bool {
        self.no_tracking
    }

    pub fn parameter_types(&self) -> &'static [ParamType] {
        self.invoker.parameter_types()
    }

    fn prepare<'a>(&self, invocation: Invocation<'a>) -> Result<Prepared<'a>, QueryError> {
        if invocation.invoker() != self.invoker {
            return Err(ExecutionError::Command(format!(
                "plan expects a {:?} invocation, got {:?}",
                self.invoker,
                invocation.invoker()
            ))
            .into());
        }
        let (ctx, segment, cancel) = invocation.into_parts();
        let command = self.command.bind(&ctx.constants, segment)?;
        Ok(Prepared {
            connection: ctx.connection,
            command,
            cancel,
        })
    }

    /// Blocking execution.
    pub fn invoke(&self, invocation: Invocation<'_>) -> Result<QueryValue, QueryError> {
        let prepared = self.prepare(invocation)?;
        if prepared.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(QueryError::Cancelled);
        }
        let rows = prepared.connection.query(&prepared.command)?;
        materialize(self.shape, rows)
    }

    /// Asynchronous execution. A fired token wins over a completed fetch.
    pub async fn invoke_async(&self, invocation: Invocation<'_>) -> Result<QueryValue, QueryError> {
        let Prepared {
            connection,
            command,
            cancel,
        } = self.prepare(invocation)?;
        let rows = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(QueryError::Cancelled),
                    rows = connection.query_async(&command) => rows?,
                }
            }
            None => connection.query_async(&command).await?,
        };
        materialize(self.shape, rows)
    }

    /// Lazily fetched rows. The token is checked before the command is sent
    /// and before every row fetch; once it fires the stream yields
    /// [`QueryError::Cancelled`] and ends without fetching further rows.
    pub fn stream<'a>(&self, invocation: Invocation<'a>) -> BoxStream<'a, Result<Row, QueryError>> {
        let prepared = self.prepare(invocation);
        stream! {
            let Prepared { connection, command, cancel } = match prepared {
                Ok(p) => p,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let token = cancel.unwrap_or_default();

            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => Err(QueryError::Cancelled),
                rows = connection.query_stream(command) => rows.map_err(QueryError::from),
            };
            let mut rows = match opened {
                Ok(rows) => rows,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(QueryError::Cancelled),
                    row = rows.next() => Ok(row),
                };
                match next {
                    Ok(Some(Ok(row))) => yield Ok(row),
                    Ok(Some(Err(e))) => {
                        yield Err(e.into());
                        return;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
        .boxed()
    }
}

/// Shape fetched rows into the value the query's root operator returns.
pub fn materialize(shape: ResultShape, rows: Vec<Row>) -> Result<QueryValue, QueryError> {
    match shape {
        ResultShape::Sequence => Ok(QueryValue::Rows(rows)),
        ResultShape::Single { nullable, unique } => {
            if unique && rows.len() > 1 {
                return Err(QueryError::MoreThanOneElement);
            }
            match rows.into_iter().next() {
                Some(row) => Ok(QueryValue::Row(row)),
                None if nullable => Ok(QueryValue::Null),
                None => Err(QueryError::NoElements),
            }
        }
        ResultShape::Scalar { nullable } => {
            let cell = rows
                .into_iter()
                .next()
                .and_then(|row| row.into_values().into_iter().next());
            match cell {
                Some(cell) if !cell.is_null() => Ok(QueryValue::Scalar(cell)),
                _ if nullable => Ok(QueryValue::Null),
                _ => Err(QueryError::NoElements),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CellValue, ColumnInfo};
    use crate::testing::MemoryConnection;
    use std::sync::atomic::Ordering;

    fn rows(values: &[i32]) -> Vec<Row> {
        let columns: Arc<[ColumnInfo]> = vec![ColumnInfo::new("id", "int4")].into();
        values
            .iter()
            .map(|v| Row::new(columns.clone(), vec![CellValue::Int32(*v)]))
            .collect()
    }

    fn plan(shape: ResultShape, mode: PlanMode, has_segment: bool) -> ExecutionPlan {
        let mut sources = vec![ParamSource::Constant(0)];
        if has_segment {
            sources.push(ParamSource::SegmentLength);
            sources.push(ParamSource::SegmentStart);
        }
        ExecutionPlan::new(
            CompiledCommand {
                text: "SELECT t0.id FROM customers AS t0 WHERE t0.age > $1".into(),
                sources,
            },
            shape,
            mode,
            Invoker::select(mode.is_async(), has_segment),
            true,
        )
    }

    fn ctx(conn: &MemoryConnection) -> PlanContext<'_> {
        PlanContext {
            connection: conn,
            constants: vec![Value::Int(18)],
        }
    }

    #[test]
    fn test_invoker_selection() {
        assert_eq!(Invoker::select(false, false).parameter_types(), &[ParamType::Context]);
        assert_eq!(
            Invoker::select(true, true).parameter_types(),
            &[ParamType::Context, ParamType::Segment, ParamType::Cancellation]
        );
        assert_eq!(Invoker::select(false, true), Invoker::ContextSegment);
        assert_eq!(Invoker::select(true, false), Invoker::ContextCancel);
    }

    #[test]
    fn test_bind_resolves_sources() {
        let command = CompiledCommand {
            text: "x".into(),
            sources: vec![
                ParamSource::SegmentLength,
                ParamSource::SegmentStart,
                ParamSource::Constant(1),
            ],
        };
        let bound = command
            .bind(&[Value::Int(1), Value::from("a")], Some(DataSegment::new(20, 10)))
            .unwrap();
        assert_eq!(
            bound.parameters,
            vec![Value::Int(10), Value::Int(20), Value::from("a")]
        );
        assert!(matches!(
            command.bind(&[], None),
            Err(ExecutionError::Command(_))
        ));
    }

    #[test]
    fn test_materialize_shapes() {
        assert_eq!(
            materialize(ResultShape::Sequence, rows(&[1, 2])).unwrap(),
            QueryValue::Rows(rows(&[1, 2]))
        );

        let first = ResultShape::Single {
            nullable: false,
            unique: false,
        };
        assert_eq!(
            materialize(first, rows(&[1, 2])).unwrap(),
            QueryValue::Row(rows(&[1]).remove(0))
        );
        assert!(matches!(
            materialize(first, vec![]),
            Err(QueryError::NoElements)
        ));

        let single_or_default = ResultShape::Single {
            nullable: true,
            unique: true,
        };
        assert_eq!(
            materialize(single_or_default, vec![]).unwrap(),
            QueryValue::Null
        );
        assert!(matches!(
            materialize(single_or_default, rows(&[1, 2])),
            Err(QueryError::MoreThanOneElement)
        ));

        let scalar = ResultShape::Scalar { nullable: false };
        assert_eq!(
            materialize(scalar, rows(&[7])).unwrap(),
            QueryValue::Scalar(CellValue::Int32(7))
        );
        let null_row = vec![Row::new(
            vec![ColumnInfo::new("max", "int4")].into(),
            vec![CellValue::Null],
        )];
        assert!(matches!(
            materialize(scalar, null_row.clone()),
            Err(QueryError::NoElements)
        ));
        assert_eq!(
            materialize(ResultShape::Scalar { nullable: true }, null_row).unwrap(),
            QueryValue::Null
        );
    }

    #[test]
    fn test_invoke_rejects_mismatched_invocation() {
        let conn = MemoryConnection::new(rows(&[1]));
        let plan = plan(ResultShape::Sequence, PlanMode::Sync, true);
        let err = plan.invoke(Invocation::Context(ctx(&conn))).unwrap_err();
        assert!(matches!(err, QueryError::Execution(ExecutionError::Command(_))));
        assert!(conn.executed().is_empty());
    }

    #[test]
    fn test_invoke_binds_segment() {
        let conn = MemoryConnection::new(rows(&[1, 2]));
        let plan = plan(ResultShape::Sequence, PlanMode::Sync, true);
        let value = plan
            .invoke(Invocation::ContextSegment(ctx(&conn), DataSegment::new(5, 2)))
            .unwrap();
        assert_eq!(value, QueryValue::Rows(rows(&[1, 2])));
        let executed = conn.executed();
        assert_eq!(
            executed[0].parameters,
            vec![Value::Int(18), Value::Int(2), Value::Int(5)]
        );
    }

    #[tokio::test]
    async fn test_invoke_async_honors_fired_token() {
        let conn = MemoryConnection::new(rows(&[1]));
        let plan = plan(ResultShape::Sequence, PlanMode::Async, false);
        let token = CancellationToken::new();
        token.cancel();
        let err = plan
            .invoke_async(Invocation::ContextCancel(ctx(&conn), token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_invoke_async_cancel_during_fetch() {
        let conn = MemoryConnection::new(rows(&[1])).with_delay(std::time::Duration::from_secs(30));
        let plan = plan(ResultShape::Sequence, PlanMode::Async, false);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = plan
            .invoke_async(Invocation::ContextCancel(ctx(&conn), token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_stream_stops_fetching_after_cancel() {
        let conn = MemoryConnection::new(rows(&[1, 2, 3, 4]));
        let plan = plan(ResultShape::Sequence, PlanMode::Stream, false);
        let token = CancellationToken::new();
        let mut stream = plan.stream(Invocation::ContextCancel(ctx(&conn), token.clone()));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.get(0), Some(&CellValue::Int32(1)));
        token.cancel();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(stream.next().await.is_none());
        assert_eq!(conn.fetched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_yields_all_rows() {
        let conn = MemoryConnection::new(rows(&[1, 2, 3]));
        let plan = plan(ResultShape::Sequence, PlanMode::Stream, false);
        let collected: Vec<_> = plan
            .stream(Invocation::ContextCancel(ctx(&conn), CancellationToken::new()))
            .collect()
            .await;
        assert_eq!(collected.len(), 3);
        assert!(collected.iter().all(|r| r.is_ok()));
    }
}
