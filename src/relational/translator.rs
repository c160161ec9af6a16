//! Expression → relational form.
//!
//! Sequence operators are folded into one [`SelectQuery`] as long as SQL
//! clause order allows it. When an operator has to apply on top of paging,
//! DISTINCT or grouping, the select built so far becomes a derived table and
//! translation continues on the outside.
//!
//! Lambda parameters resolve through [`Binding`]s: what a row of the current
//! sequence looks like (an entity behind an alias, an anonymous object, a
//! scalar, or a grouping). Lambda scopes stay visible to nested queries, which
//! is how correlated subqueries reference outer rows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::catalog::{Catalog, EntityMetadata};
use super::segment::SegmentFinder;
use super::types::*;
use crate::dialect::{DialectCapabilities, DialectTranslator};
use crate::error::{TranslationCause, TranslationError};
use crate::expr::{
    collect_constants, constant_slots, BinaryOp, DataSegment, Expr, ExprRef, QueryOperator,
    UnaryOp, Value,
};

type Result<T> = std::result::Result<T, TranslationError>;

/// What the translator needs from the active dialect and model.
pub struct DialectContext<'a> {
    pub catalog: &'a Catalog,
    pub dialect: &'a dyn DialectTranslator,
}

/// Translate a query expression into its relational form. Fails atomically:
/// either the whole tree translates or nothing is returned. Errors carry
/// `expr` as the query and the failing sub-expression as the node.
pub fn translate(expr: &ExprRef, ctx: &DialectContext<'_>) -> Result<RelationalForm> {
    let slots = constant_slots(expr);
    let slot_count = collect_constants(expr).len();

    let marker = SegmentFinder::locate(expr)
        .map(|m| (Arc::as_ptr(m.call), m.source.clone(), m.segment));

    let mut translator = Translator {
        catalog: ctx.catalog,
        dialect: ctx.dialect,
        caps: ctx.dialect.capabilities(),
        slots,
        marker,
        segment_used: false,
        scopes: Vec::new(),
        next_alias: 0,
    };
    let (select, shape) = translator.root(expr).map_err(|e| e.within(expr))?;
    let segment = match (&translator.marker, translator.segment_used) {
        (Some((_, _, segment)), true) => Some(*segment),
        _ => None,
    };

    Ok(RelationalForm {
        select,
        shape,
        segment,
        slot_count,
        origin: expr.clone(),
    })
}

fn fail<T>(expr: &ExprRef, cause: TranslationCause) -> Result<T> {
    Err(TranslationError::new(expr, cause))
}

fn unsupported<T>(expr: &ExprRef, message: impl Into<String>) -> Result<T> {
    fail(expr, TranslationCause::UnsupportedExpression(message.into()))
}

/// Shape of one row of the sequence being translated.
#[derive(Debug, Clone)]
enum Binding {
    Entity {
        alias: String,
        meta: Arc<EntityMetadata>,
        /// Column name prefix inside a derived table.
        prefix: String,
        /// Outer side of a left join: every column may be NULL.
        optional: bool,
    },
    Fields(Vec<(String, Binding)>),
    Scalar {
        expr: RelExpr,
        nullable: bool,
    },
    Group {
        key: Box<Binding>,
        element: Box<Binding>,
    },
}

impl Binding {
    fn optional(self) -> Self {
        match self {
            Binding::Entity {
                alias, meta, prefix, ..
            } => Binding::Entity {
                alias,
                meta,
                prefix,
                optional: true,
            },
            Binding::Fields(fields) => {
                Binding::Fields(fields.into_iter().map(|(n, b)| (n, b.optional())).collect())
            }
            Binding::Scalar { expr, .. } => Binding::Scalar {
                expr,
                nullable: true,
            },
            group => group,
        }
    }
}

struct QueryState {
    select: SelectQuery,
    row: Binding,
}

/// A terminal operator, before it is placed at the root or inside a lambda.
enum Terminal {
    Single {
        select: SelectQuery,
        row: Binding,
        nullable: bool,
        unique: bool,
    },
    Exists {
        select: SelectQuery,
        negated: bool,
    },
    Scalar {
        select: SelectQuery,
        nullable: bool,
    },
    In {
        value: RelExpr,
        select: SelectQuery,
    },
}

struct Translator<'a> {
    catalog: &'a Catalog,
    dialect: &'a dyn DialectTranslator,
    caps: DialectCapabilities,
    slots: HashMap<*const Expr, usize>,
    marker: Option<(*const Expr, ExprRef, DataSegment)>,
    segment_used: bool,
    scopes: Vec<(String, Binding)>,
    next_alias: usize,
}

impl<'a> Translator<'a> {
    fn root(&mut self, expr: &ExprRef) -> Result<(SelectQuery, ResultShape)> {
        if let Expr::Call { operator, args } = expr.as_ref() {
            if operator.is_terminal() {
                return Ok(match self.terminal(expr, *operator, args)? {
                    Terminal::Single {
                        select,
                        nullable,
                        unique,
                        ..
                    } => (select, ResultShape::Single { nullable, unique }),
                    Terminal::Exists { select, negated } => (
                        self.exists_select(select, negated, expr),
                        ResultShape::Scalar { nullable: false },
                    ),
                    Terminal::Scalar { select, nullable } => {
                        (select, ResultShape::Scalar { nullable })
                    }
                    Terminal::In { value, select } => {
                        let test = RelExpr::InSubquery {
                            expr: Box::new(value),
                            subquery: Box::new(select),
                            negated: false,
                        };
                        let projection = RelExpr::Function {
                            name: "COALESCE".to_string(),
                            args: vec![test, RelExpr::Literal(Literal::Boolean(false))],
                        };
                        (
                            SelectQuery {
                                projections: vec![item(projection, None)],
                                origin: Some(expr.clone()),
                                ..Default::default()
                            },
                            ResultShape::Scalar { nullable: false },
                        )
                    }
                });
            }
        }

        let state = self.sequence(expr)?;
        Ok((self.project(state, expr)?, ResultShape::Sequence))
    }

    fn exists_select(&self, select: SelectQuery, negated: bool, origin: &ExprRef) -> SelectQuery {
        let exists = RelExpr::Exists {
            query: Box::new(select),
            negated,
        };
        let projection = if self.caps.exists_projection {
            exists
        } else {
            RelExpr::Case {
                when_clauses: vec![(exists, RelExpr::Literal(Literal::Boolean(true)))],
                else_clause: Some(Box::new(RelExpr::Literal(Literal::Boolean(false)))),
            }
        };
        SelectQuery {
            projections: vec![item(projection, None)],
            origin: Some(origin.clone()),
            ..Default::default()
        }
    }

    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn require_paging(&self, expr: &ExprRef) -> Result<()> {
        if self.caps.paging {
            Ok(())
        } else {
            fail(
                expr,
                TranslationCause::Capability {
                    dialect: self.dialect.name().to_string(),
                    capability: "paging",
                },
            )
        }
    }

    // ---------------------------------------------------------------------
    // Sequences
    // ---------------------------------------------------------------------

    fn sequence(&mut self, expr: &ExprRef) -> Result<QueryState> {
        let marker_source = match &self.marker {
            Some((ptr, source, _)) if *ptr == Arc::as_ptr(expr) => Some(source.clone()),
            _ => None,
        };
        if let Some(source) = marker_source {
            return self.segment_marker(expr, &source);
        }

        let mut state = match expr.as_ref() {
            Expr::Entity(name) => self.entity_source(expr, name)?,
            Expr::Call { operator, args } => self.sequence_call(expr, *operator, args)?,
            Expr::Parameter(_) | Expr::Member { .. } => {
                return unsupported(expr, "navigation through a member is not a query source")
            }
            _ => return unsupported(expr, "expression is not a sequence"),
        };
        state.select.origin = Some(expr.clone());
        Ok(state)
    }

    fn entity_source(&mut self, expr: &ExprRef, name: &str) -> Result<QueryState> {
        let Some(meta) = self.catalog.entity(name) else {
            return fail(expr, TranslationCause::UnknownEntity(name.to_string()));
        };
        let alias = self.alias();
        Ok(QueryState {
            select: SelectQuery {
                from: Some(TableRef::Table {
                    schema: meta.schema.clone(),
                    name: meta.table.clone(),
                    alias: alias.clone(),
                }),
                ..Default::default()
            },
            row: Binding::Entity {
                alias,
                meta,
                prefix: String::new(),
                optional: false,
            },
        })
    }

    fn segment_marker(&mut self, call: &ExprRef, source: &ExprRef) -> Result<QueryState> {
        self.require_paging(call)?;
        let mut state = self.sequence(source)?;
        if state.select.is_paged() {
            state = self.wrap(state, call)?;
        }
        state.select.limit = Some(RelExpr::Parameter(ParamSource::SegmentLength));
        state.select.offset = Some(RelExpr::Parameter(ParamSource::SegmentStart));
        state.select.origin = Some(call.clone());
        self.segment_used = true;
        Ok(state)
    }

    fn sequence_call(
        &mut self,
        expr: &ExprRef,
        operator: QueryOperator,
        args: &[ExprRef],
    ) -> Result<QueryState> {
        let source = arg(expr, args, 0)?;
        match operator {
            QueryOperator::Where => {
                let state = self.sequence(source)?;
                self.apply_where(state, arg(expr, args, 1)?, false, expr)
            }
            QueryOperator::Select => {
                let mut state = self.sequence(source)?;
                if state.select.distinct {
                    state = self.wrap(state, expr)?;
                }
                state.row = self.lambda_binding(arg(expr, args, 1)?, &[state.row.clone()])?;
                Ok(state)
            }
            QueryOperator::OrderBy
            | QueryOperator::OrderByDescending
            | QueryOperator::ThenBy
            | QueryOperator::ThenByDescending => {
                let mut state = self.sequence(source)?;
                if state.select.is_paged() || state.select.distinct {
                    state = self.wrap(state, expr)?;
                }
                let key = self.lambda_binding(arg(expr, args, 1)?, &[state.row.clone()])?;
                let asc = matches!(operator, QueryOperator::OrderBy | QueryOperator::ThenBy);
                if matches!(
                    operator,
                    QueryOperator::OrderBy | QueryOperator::OrderByDescending
                ) {
                    state.select.order_by.clear();
                }
                for (key, _) in self.scalar_leaves(&key, expr)? {
                    state.select.order_by.push(OrderByExpr { expr: key, asc });
                }
                Ok(state)
            }
            QueryOperator::Skip | QueryOperator::Take => {
                self.require_paging(expr)?;
                let mut state = self.sequence(source)?;
                let count = arg(expr, args, 1)?;
                let (count, _) = self.scalar(count)?;
                if operator == QueryOperator::Take {
                    if state.select.limit.is_some() {
                        state = self.wrap(state, expr)?;
                    }
                    state.select.limit = Some(count);
                } else {
                    if state.select.is_paged() {
                        state = self.wrap(state, expr)?;
                    }
                    state.select.offset = Some(count);
                }
                Ok(state)
            }
            QueryOperator::Segment => {
                self.require_paging(expr)?;
                let mut state = self.sequence(source)?;
                let marker = arg(expr, args, 1)?;
                let Some(slot) = self.slots.get(&Arc::as_ptr(marker)).copied() else {
                    return unsupported(marker, "segment argument must be a segment literal");
                };
                if state.select.is_paged() {
                    state = self.wrap(state, expr)?;
                }
                state.select.offset = Some(RelExpr::Parameter(ParamSource::Constant(slot)));
                state.select.limit = Some(RelExpr::Parameter(ParamSource::Constant(slot + 1)));
                Ok(state)
            }
            QueryOperator::Distinct => {
                let mut state = self.sequence(source)?;
                if state.select.is_paged() {
                    state = self.wrap(state, expr)?;
                }
                if matches!(state.row, Binding::Group { .. }) {
                    return unsupported(expr, "a grouping must be projected before Distinct");
                }
                state.select.distinct = true;
                Ok(state)
            }
            QueryOperator::GroupBy => {
                let mut state = self.sequence(source)?;
                if state.select.is_paged() || state.select.distinct || state.select.is_grouped() {
                    state = self.wrap(state, expr)?;
                }
                let key = self.lambda_binding(arg(expr, args, 1)?, &[state.row.clone()])?;
                let element = match args.get(2) {
                    Some(selector) => self.lambda_binding(selector, &[state.row.clone()])?,
                    None => state.row.clone(),
                };
                state.select.group_by = self
                    .scalar_leaves(&key, expr)?
                    .into_iter()
                    .map(|(e, _)| e)
                    .collect();
                state.row = Binding::Group {
                    key: Box::new(key),
                    element: Box::new(element),
                };
                Ok(state)
            }
            QueryOperator::Join | QueryOperator::LeftJoin => self.join(expr, operator, args),
            _ => fail(expr, TranslationCause::UnsupportedOperator(operator.name())),
        }
    }

    fn apply_where(
        &mut self,
        mut state: QueryState,
        predicate: &ExprRef,
        negate: bool,
        expr: &ExprRef,
    ) -> Result<QueryState> {
        if matches!(state.row, Binding::Group { .. }) {
            if state.select.is_paged() || state.select.distinct {
                return unsupported(expr, "cannot filter a paged grouping");
            }
            let (pred, _) = self.lambda_scalar(predicate, &state.row)?;
            state.select.and_having(negated(pred, negate));
            return Ok(state);
        }
        if state.select.is_paged() || state.select.distinct || state.select.is_grouped() {
            state = self.wrap(state, expr)?;
        }
        let (pred, _) = self.lambda_scalar(predicate, &state.row)?;
        state.select.and_filter(negated(pred, negate));
        Ok(state)
    }

    fn join(
        &mut self,
        expr: &ExprRef,
        operator: QueryOperator,
        args: &[ExprRef],
    ) -> Result<QueryState> {
        let mut outer = self.sequence(arg(expr, args, 0)?)?;
        if outer.select.is_paged() || outer.select.distinct || outer.select.is_grouped() {
            outer = self.wrap(outer, expr)?;
        }

        let inner = self.sequence(arg(expr, args, 1)?)?;
        let inner = if inner.select.is_plain_table() {
            inner
        } else {
            self.wrap(inner, expr)?
        };
        let Some(table) = inner.select.from else {
            return unsupported(expr, "join source has no table");
        };
        let mut inner_row = inner.row;

        let outer_key = self.lambda_binding(arg(expr, args, 2)?, &[outer.row.clone()])?;
        let inner_key = self.lambda_binding(arg(expr, args, 3)?, &[inner_row.clone()])?;
        let outer_leaves = self.scalar_leaves(&outer_key, expr)?;
        let inner_leaves = self.scalar_leaves(&inner_key, expr)?;
        if outer_leaves.len() != inner_leaves.len() || outer_leaves.is_empty() {
            return unsupported(expr, "join keys have different shapes");
        }
        let condition = outer_leaves
            .into_iter()
            .zip(inner_leaves)
            .map(|((l, _), (r, _))| RelExpr::binary(l, BinaryOperator::Eq, r))
            .reduce(RelExpr::and);

        let join_type = if operator == QueryOperator::LeftJoin {
            inner_row = inner_row.optional();
            JoinType::Left
        } else {
            JoinType::Inner
        };
        outer.select.joins.push(Join {
            join_type,
            table,
            condition,
        });
        outer.row = self.lambda_binding(arg(expr, args, 4)?, &[outer.row.clone(), inner_row])?;
        Ok(outer)
    }

    /// Turn the select built so far into a derived table and continue on
    /// top of it.
    fn wrap(&mut self, state: QueryState, expr: &ExprRef) -> Result<QueryState> {
        let QueryState { mut select, row } = state;
        let leaves = named_leaves(&row, expr)?;
        select.projections = leaves
            .iter()
            .map(|(name, e, _)| item(e.clone(), Some(name)))
            .collect();
        let alias = self.alias();
        let row = rebind(&row, &alias, "");
        Ok(QueryState {
            select: SelectQuery {
                from: Some(TableRef::Subquery {
                    query: Box::new(select),
                    alias,
                }),
                origin: Some(expr.clone()),
                ..Default::default()
            },
            row,
        })
    }

    fn project(&mut self, state: QueryState, expr: &ExprRef) -> Result<SelectQuery> {
        let QueryState { mut select, row } = state;
        let leaves = named_leaves(&row, expr)?;
        select.projections = leaves
            .iter()
            .map(|(name, e, _)| item(e.clone(), Some(name)))
            .collect();
        Ok(select)
    }

    // ---------------------------------------------------------------------
    // Terminal operators
    // ---------------------------------------------------------------------

    fn terminal(
        &mut self,
        expr: &ExprRef,
        operator: QueryOperator,
        args: &[ExprRef],
    ) -> Result<Terminal> {
        let source = arg(expr, args, 0)?;
        match operator {
            QueryOperator::First
            | QueryOperator::FirstOrDefault
            | QueryOperator::Single
            | QueryOperator::SingleOrDefault => {
                let mut state = self.filtered(expr, source, args.get(1))?;
                if state.select.limit.is_some() {
                    state = self.wrap(state, expr)?;
                }
                let unique = matches!(
                    operator,
                    QueryOperator::Single | QueryOperator::SingleOrDefault
                );
                state.select.limit = Some(RelExpr::integer(if unique { 2 } else { 1 }));
                let row = state.row.clone();
                Ok(Terminal::Single {
                    select: self.project(state, expr)?,
                    row,
                    nullable: matches!(
                        operator,
                        QueryOperator::FirstOrDefault | QueryOperator::SingleOrDefault
                    ),
                    unique,
                })
            }
            QueryOperator::Count | QueryOperator::LongCount => {
                let mut state = self.filtered(expr, source, args.get(1))?;
                state = self.prepare_aggregate(state, expr)?;
                state.select.projections = vec![item(RelExpr::count_star(), None)];
                Ok(Terminal::Scalar {
                    select: state.select,
                    nullable: false,
                })
            }
            QueryOperator::Any => {
                let mut state = self.filtered(expr, source, args.get(1))?;
                if !state.select.is_paged() {
                    state.select.order_by.clear();
                }
                state.select.projections = vec![item(RelExpr::integer(1), None)];
                Ok(Terminal::Exists {
                    select: state.select,
                    negated: false,
                })
            }
            QueryOperator::All => {
                let state = self.sequence(source)?;
                let mut state = self.apply_where(state, arg(expr, args, 1)?, true, expr)?;
                if !state.select.is_paged() {
                    state.select.order_by.clear();
                }
                state.select.projections = vec![item(RelExpr::integer(1), None)];
                Ok(Terminal::Exists {
                    select: state.select,
                    negated: true,
                })
            }
            QueryOperator::Contains => {
                let mut state = self.sequence(source)?;
                let Binding::Scalar { expr: element, .. } = state.row.clone() else {
                    return unsupported(expr, "Contains needs a sequence of scalar values");
                };
                let (value, _) = self.scalar(arg(expr, args, 1)?)?;
                if !state.select.is_paged() {
                    state.select.order_by.clear();
                }
                state.select.projections = vec![item(element, None)];
                Ok(Terminal::In {
                    value,
                    select: state.select,
                })
            }
            QueryOperator::Sum
            | QueryOperator::Min
            | QueryOperator::Max
            | QueryOperator::Average => {
                let state = self.sequence(source)?;
                let mut state = self.prepare_aggregate(state, expr)?;
                let (value, nullable) = self.selector(expr, args.get(1), &state.row)?;
                let (projection, nullable) = aggregate(operator, value, nullable);
                state.select.projections = vec![item(projection, None)];
                Ok(Terminal::Scalar {
                    select: state.select,
                    nullable,
                })
            }
            _ => fail(expr, TranslationCause::UnsupportedOperator(operator.name())),
        }
    }

    /// Source sequence with an optional predicate applied, as in
    /// `First(c => ...)` or `Count(c => ...)`.
    fn filtered(
        &mut self,
        expr: &ExprRef,
        source: &ExprRef,
        predicate: Option<&ExprRef>,
    ) -> Result<QueryState> {
        let state = self.sequence(source)?;
        match predicate {
            Some(predicate) => self.apply_where(state, predicate, false, expr),
            None => Ok(state),
        }
    }

    fn prepare_aggregate(&mut self, mut state: QueryState, expr: &ExprRef) -> Result<QueryState> {
        if matches!(state.row, Binding::Group { .. }) {
            return unsupported(expr, "a grouping must be projected before aggregating it");
        }
        if state.select.is_paged() || state.select.distinct || state.select.is_grouped() {
            state = self.wrap(state, expr)?;
        }
        state.select.order_by.clear();
        Ok(state)
    }

    fn selector(
        &mut self,
        expr: &ExprRef,
        selector: Option<&ExprRef>,
        row: &Binding,
    ) -> Result<(RelExpr, bool)> {
        match selector {
            Some(lambda) => self.lambda_scalar(lambda, row),
            None => expect_scalar(expr, row.clone()),
        }
    }

    /// Aggregates over the elements of a grouping, e.g. `g.Sum(o => o.total)`.
    fn group_aggregate(
        &mut self,
        expr: &ExprRef,
        operator: QueryOperator,
        args: &[ExprRef],
    ) -> Result<Option<(RelExpr, bool)>> {
        let Some(source) = args.first() else {
            return Ok(None);
        };
        if !matches!(source.as_ref(), Expr::Parameter(_) | Expr::Member { .. }) {
            return Ok(None);
        }
        let Binding::Group { element, .. } = self.bind(source)? else {
            return Ok(None);
        };
        let element = *element;
        let result = match operator {
            QueryOperator::Count | QueryOperator::LongCount => match args.get(1) {
                None => (RelExpr::count_star(), false),
                Some(predicate) => {
                    let (pred, _) = self.lambda_scalar(predicate, &element)?;
                    let counted = RelExpr::Case {
                        when_clauses: vec![(pred, RelExpr::integer(1))],
                        else_clause: None,
                    };
                    (RelExpr::aggregate("COUNT", vec![counted]), false)
                }
            },
            QueryOperator::Sum
            | QueryOperator::Min
            | QueryOperator::Max
            | QueryOperator::Average => {
                let (value, nullable) = self.selector(expr, args.get(1), &element)?;
                aggregate(operator, value, nullable)
            }
            _ => return fail(expr, TranslationCause::UnsupportedOperator(operator.name())),
        };
        Ok(Some(result))
    }

    // ---------------------------------------------------------------------
    // Lambdas and bindings
    // ---------------------------------------------------------------------

    fn lambda_binding(&mut self, lambda: &ExprRef, inputs: &[Binding]) -> Result<Binding> {
        let Expr::Lambda { params, body } = lambda.as_ref() else {
            return unsupported(lambda, "expected a lambda");
        };
        if params.len() != inputs.len() {
            return unsupported(
                lambda,
                format!("expected a lambda with {} parameters", inputs.len()),
            );
        }
        let depth = self.scopes.len();
        self.scopes
            .extend(params.iter().cloned().zip(inputs.iter().cloned()));
        let result = self.bind(body);
        self.scopes.truncate(depth);
        result
    }

    fn lambda_scalar(&mut self, lambda: &ExprRef, input: &Binding) -> Result<(RelExpr, bool)> {
        let binding = self.lambda_binding(lambda, std::slice::from_ref(input))?;
        let body = match lambda.as_ref() {
            Expr::Lambda { body, .. } => body,
            _ => lambda,
        };
        expect_scalar(body, binding)
    }

    fn bind(&mut self, expr: &ExprRef) -> Result<Binding> {
        match expr.as_ref() {
            Expr::Parameter(name) => match self.scopes.iter().rev().find(|(p, _)| p == name) {
                Some((_, binding)) => Ok(binding.clone()),
                None => fail(expr, TranslationCause::UnboundParameter(name.clone())),
            },
            Expr::Member { target, name } => {
                let target = self.bind(target)?;
                member(expr, target, name)
            }
            Expr::New(fields) => {
                let mut bound = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    bound.push((name.clone(), self.bind(value)?));
                }
                Ok(Binding::Fields(bound))
            }
            _ => {
                let (expr, nullable) = self.scalar(expr)?;
                Ok(Binding::Scalar { expr, nullable })
            }
        }
    }

    fn scalar_leaves(&mut self, binding: &Binding, expr: &ExprRef) -> Result<Vec<(RelExpr, bool)>> {
        let mut leaves = Vec::new();
        flatten(binding, "", &mut leaves, expr)?;
        Ok(leaves.into_iter().map(|(_, e, n)| (e, n)).collect())
    }

    // ---------------------------------------------------------------------
    // Scalars
    // ---------------------------------------------------------------------

    fn scalar(&mut self, expr: &ExprRef) -> Result<(RelExpr, bool)> {
        match expr.as_ref() {
            Expr::Constant(Value::Null) => Ok((RelExpr::Literal(Literal::Null), true)),
            Expr::Constant(_) => match self.slots.get(&Arc::as_ptr(expr)) {
                Some(slot) => Ok((RelExpr::Parameter(ParamSource::Constant(*slot)), false)),
                None => unsupported(expr, "constant is not part of the translated query"),
            },
            Expr::Parameter(_) | Expr::Member { .. } | Expr::New(_) => {
                let binding = self.bind(expr)?;
                expect_scalar(expr, binding)
            }
            Expr::Binary { left, op, right } => self.binary(left, *op, right),
            Expr::Unary { op, operand } => {
                let (operand, nullable) = self.scalar(operand)?;
                let op = match op {
                    UnaryOp::Not => UnaryOperator::Not,
                    UnaryOp::Negate => UnaryOperator::Minus,
                };
                Ok((
                    RelExpr::UnaryOp {
                        op,
                        expr: Box::new(operand),
                    },
                    nullable,
                ))
            }
            Expr::Function { name, args } => self.function(expr, name, args),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let (test, _) = self.scalar(test)?;
                let (a, an) = self.scalar(if_true)?;
                let (b, bn) = self.scalar(if_false)?;
                Ok((
                    RelExpr::Case {
                        when_clauses: vec![(test, a)],
                        else_clause: Some(Box::new(b)),
                    },
                    an || bn,
                ))
            }
            Expr::Call { operator, args } => self.scalar_call(expr, *operator, args),
            Expr::Entity(_) | Expr::Lambda { .. } | Expr::Segment(_) => {
                unsupported(expr, "expression cannot be used as a value")
            }
        }
    }

    fn binary(&mut self, left: &ExprRef, op: BinaryOp, right: &ExprRef) -> Result<(RelExpr, bool)> {
        if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) {
            let operand = if is_null(right) {
                Some(left)
            } else if is_null(left) {
                Some(right)
            } else {
                None
            };
            if let Some(operand) = operand {
                let (operand, _) = self.scalar(operand)?;
                return Ok((
                    RelExpr::IsNull {
                        expr: Box::new(operand),
                        negated: op == BinaryOp::NotEqual,
                    },
                    false,
                ));
            }
        }

        let (l, ln) = self.scalar(left)?;
        let (r, rn) = self.scalar(right)?;
        let op = match op {
            BinaryOp::Equal => BinaryOperator::Eq,
            BinaryOp::NotEqual => BinaryOperator::NotEq,
            BinaryOp::LessThan => BinaryOperator::Lt,
            BinaryOp::LessThanOrEqual => BinaryOperator::LtEq,
            BinaryOp::GreaterThan => BinaryOperator::Gt,
            BinaryOp::GreaterThanOrEqual => BinaryOperator::GtEq,
            BinaryOp::And => BinaryOperator::And,
            BinaryOp::Or => BinaryOperator::Or,
            BinaryOp::Add => BinaryOperator::Plus,
            BinaryOp::Subtract => BinaryOperator::Minus,
            BinaryOp::Multiply => BinaryOperator::Multiply,
            BinaryOp::Divide => BinaryOperator::Divide,
            BinaryOp::Modulo => BinaryOperator::Modulo,
            BinaryOp::Coalesce => {
                return Ok((
                    RelExpr::Function {
                        name: "COALESCE".to_string(),
                        args: vec![l, r],
                    },
                    ln && rn,
                ))
            }
        };
        Ok((RelExpr::binary(l, op, r), ln || rn))
    }

    fn function(&mut self, expr: &ExprRef, name: &str, args: &[ExprRef]) -> Result<(RelExpr, bool)> {
        let lowered = name.to_ascii_lowercase();
        if matches!(lowered.as_str(), "contains" | "starts_with" | "ends_with") && args.len() == 2
        {
            let (text, nullable) = self.scalar(&args[0])?;
            let (needle, _) = self.scalar(&args[1])?;
            let wildcard = || RelExpr::Literal(Literal::String("%".to_string()));
            let concat = |l, r| RelExpr::binary(l, BinaryOperator::Concat, r);
            let pattern = match lowered.as_str() {
                "contains" => concat(concat(wildcard(), needle), wildcard()),
                "starts_with" => concat(needle, wildcard()),
                _ => concat(wildcard(), needle),
            };
            return Ok((RelExpr::binary(text, BinaryOperator::Like, pattern), nullable));
        }

        let mut translated = Vec::with_capacity(args.len());
        let mut nullable = false;
        for a in args {
            let (e, n) = self.scalar(a)?;
            nullable |= n;
            translated.push(e);
        }
        let name = match self.dialect.function_name(&lowered) {
            Some(mapped) => mapped.to_string(),
            None if self.caps.passthrough_functions => name.to_string(),
            None => return fail(expr, TranslationCause::UnsupportedFunction(name.to_string())),
        };
        Ok((
            RelExpr::Function {
                name,
                args: translated,
            },
            nullable,
        ))
    }

    /// A query operator used as a value inside a lambda: aggregates over a
    /// grouping, or a correlated subquery.
    fn scalar_call(
        &mut self,
        expr: &ExprRef,
        operator: QueryOperator,
        args: &[ExprRef],
    ) -> Result<(RelExpr, bool)> {
        if let Some(result) = self.group_aggregate(expr, operator, args)? {
            return Ok(result);
        }
        if !operator.is_terminal() {
            return unsupported(expr, "a sequence cannot be used as a value");
        }
        match self.terminal(expr, operator, args)? {
            Terminal::Single { select, row, .. } => match row {
                Binding::Scalar { .. } => Ok((RelExpr::Subquery(Box::new(select)), true)),
                _ => unsupported(expr, "a subquery used as a value must select a single column"),
            },
            Terminal::Exists { select, negated } => Ok((
                RelExpr::Exists {
                    query: Box::new(select),
                    negated,
                },
                false,
            )),
            Terminal::Scalar { select, nullable } => {
                Ok((RelExpr::Subquery(Box::new(select)), nullable))
            }
            Terminal::In { value, select } => Ok((
                RelExpr::InSubquery {
                    expr: Box::new(value),
                    subquery: Box::new(select),
                    negated: false,
                },
                false,
            )),
        }
    }
}

fn arg<'e>(expr: &ExprRef, args: &'e [ExprRef], index: usize) -> Result<&'e ExprRef> {
    match args.get(index) {
        Some(a) => Ok(a),
        None => unsupported(expr, format!("missing argument {}", index)),
    }
}

fn is_null(expr: &ExprRef) -> bool {
    matches!(expr.as_ref(), Expr::Constant(Value::Null))
}

fn negated(pred: RelExpr, negate: bool) -> RelExpr {
    if negate {
        RelExpr::not(pred)
    } else {
        pred
    }
}

fn item(expr: RelExpr, alias: Option<&String>) -> SelectItem {
    let alias = match (&expr, alias) {
        (RelExpr::Column { name, .. }, Some(alias)) if name == alias => None,
        (_, alias) => alias.cloned(),
    };
    SelectItem::Expression { expr, alias }
}

fn aggregate(operator: QueryOperator, value: RelExpr, nullable: bool) -> (RelExpr, bool) {
    match operator {
        QueryOperator::Sum => (
            RelExpr::Function {
                name: "COALESCE".to_string(),
                args: vec![RelExpr::aggregate("SUM", vec![value]), RelExpr::integer(0)],
            },
            false,
        ),
        QueryOperator::Min => (RelExpr::aggregate("MIN", vec![value]), nullable),
        QueryOperator::Max => (RelExpr::aggregate("MAX", vec![value]), nullable),
        _ => (RelExpr::aggregate("AVG", vec![value]), nullable),
    }
}

fn member(expr: &ExprRef, target: Binding, name: &str) -> Result<Binding> {
    match target {
        Binding::Entity {
            alias,
            meta,
            prefix,
            optional,
        } => match meta.find(name) {
            Some(prop) => Ok(Binding::Scalar {
                expr: RelExpr::column(&alias, &format!("{}{}", prefix, prop.column)),
                nullable: prop.nullable || optional,
            }),
            None => fail(
                expr,
                TranslationCause::UnknownMember {
                    entity: meta.name.clone(),
                    member: name.to_string(),
                },
            ),
        },
        Binding::Fields(fields) => {
            let found = fields
                .iter()
                .position(|(f, _)| f == name)
                .or_else(|| fields.iter().position(|(f, _)| f.eq_ignore_ascii_case(name)));
            match found {
                Some(idx) => Ok(fields[idx].1.clone()),
                None => fail(
                    expr,
                    TranslationCause::UnknownMember {
                        entity: "anonymous object".to_string(),
                        member: name.to_string(),
                    },
                ),
            }
        }
        Binding::Group { key, .. } if name.eq_ignore_ascii_case("key") => Ok(*key),
        Binding::Group { .. } => fail(
            expr,
            TranslationCause::UnknownMember {
                entity: "grouping".to_string(),
                member: name.to_string(),
            },
        ),
        Binding::Scalar { .. } => fail(
            expr,
            TranslationCause::UnknownMember {
                entity: "scalar value".to_string(),
                member: name.to_string(),
            },
        ),
    }
}

fn expect_scalar(expr: &ExprRef, binding: Binding) -> Result<(RelExpr, bool)> {
    match binding {
        Binding::Scalar { expr, nullable } => Ok((expr, nullable)),
        Binding::Entity { meta, .. } => {
            unsupported(expr, format!("entity `{}` cannot be used as a value", meta.name))
        }
        Binding::Fields(_) => unsupported(expr, "an anonymous object cannot be used as a value"),
        Binding::Group { .. } => unsupported(expr, "a grouping cannot be used as a value"),
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", path, name)
    }
}

/// Output column name of a scalar leaf.
fn leaf_name(path: &str, expr: &RelExpr) -> String {
    match (path.is_empty(), expr) {
        (false, _) => path.to_string(),
        (true, RelExpr::Column { name, .. }) => name.clone(),
        (true, _) => "value".to_string(),
    }
}

/// Every scalar column of a binding, named by its path.
fn flatten(
    binding: &Binding,
    path: &str,
    out: &mut Vec<(String, RelExpr, bool)>,
    origin: &ExprRef,
) -> Result<()> {
    match binding {
        Binding::Scalar { expr, nullable } => {
            out.push((leaf_name(path, expr), expr.clone(), *nullable));
        }
        Binding::Entity {
            alias,
            meta,
            prefix,
            optional,
        } => {
            for prop in &meta.properties {
                out.push((
                    join_path(path, &prop.column),
                    RelExpr::column(alias, &format!("{}{}", prefix, prop.column)),
                    prop.nullable || *optional,
                ));
            }
        }
        Binding::Fields(fields) => {
            for (name, value) in fields {
                flatten(value, &join_path(path, name), out, origin)?;
            }
        }
        Binding::Group { .. } => {
            return unsupported(origin, "a grouping must be projected with Select");
        }
    }
    Ok(())
}

/// Flattened output columns of `binding`. Two leaves whose paths join to the
/// same name (`a_b` and `a.b`) cannot both be projected.
fn named_leaves(binding: &Binding, origin: &ExprRef) -> Result<Vec<(String, RelExpr, bool)>> {
    let mut leaves = Vec::new();
    flatten(binding, "", &mut leaves, origin)?;
    let mut seen = HashSet::with_capacity(leaves.len());
    for (name, _, _) in &leaves {
        if !seen.insert(name.as_str()) {
            return unsupported(origin, format!("projection produces column `{}` twice", name));
        }
    }
    Ok(leaves)
}

/// The same binding, read back from the columns [`flatten`] projected into
/// a derived table.
fn rebind(binding: &Binding, alias: &str, path: &str) -> Binding {
    match binding {
        Binding::Scalar { expr, nullable } => Binding::Scalar {
            expr: RelExpr::column(alias, &leaf_name(path, expr)),
            nullable: *nullable,
        },
        Binding::Entity { meta, optional, .. } => Binding::Entity {
            alias: alias.to_string(),
            meta: meta.clone(),
            prefix: if path.is_empty() {
                String::new()
            } else {
                format!("{}_", path)
            },
            optional: *optional,
        },
        Binding::Fields(fields) => Binding::Fields(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), rebind(value, alias, &join_path(path, name))))
                .collect(),
        ),
        Binding::Group { .. } => binding.clone(),
    }
}
