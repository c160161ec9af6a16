//! Fluent construction of query expressions.
//!
//! ```ignore
//! let query = entity("Customer")
//!     .filter("c", param("c").member("active"))
//!     .select("c", param("c").member("name"))
//!     .build();
//! ```

use std::sync::Arc;

use super::types::*;

pub fn entity(name: &str) -> QueryBuilder {
    QueryBuilder::from_expr(Arc::new(Expr::Entity(name.to_string())))
}

pub fn param(name: &str) -> ExprRef {
    Arc::new(Expr::Parameter(name.to_string()))
}

pub fn constant(value: impl Into<Value>) -> ExprRef {
    Arc::new(Expr::Constant(value.into()))
}

pub fn null() -> ExprRef {
    Arc::new(Expr::Constant(Value::Null))
}

pub fn lambda(params: &[&str], body: ExprRef) -> ExprRef {
    Arc::new(Expr::Lambda {
        params: params.iter().map(|p| p.to_string()).collect(),
        body,
    })
}

pub fn call(operator: QueryOperator, args: Vec<ExprRef>) -> ExprRef {
    Arc::new(Expr::Call { operator, args })
}

pub fn function(name: &str, args: Vec<ExprRef>) -> ExprRef {
    Arc::new(Expr::Function {
        name: name.to_string(),
        args,
    })
}

pub fn new_object(fields: Vec<(&str, ExprRef)>) -> ExprRef {
    Arc::new(Expr::New(
        fields
            .into_iter()
            .map(|(name, e)| (name.to_string(), e))
            .collect(),
    ))
}

pub fn conditional(test: ExprRef, if_true: ExprRef, if_false: ExprRef) -> ExprRef {
    Arc::new(Expr::Conditional {
        test,
        if_true,
        if_false,
    })
}

/// Builder methods on expression nodes used inside lambda bodies.
pub trait ExprExt {
    fn member(&self, name: &str) -> ExprRef;
    fn binary(&self, op: BinaryOp, other: ExprRef) -> ExprRef;
    fn not(&self) -> ExprRef;
    fn negate(&self) -> ExprRef;
    fn func(&self, name: &str, args: Vec<ExprRef>) -> ExprRef;
    /// Treat this expression as a sequence source for a nested query.
    fn query(&self) -> QueryBuilder;

    fn equal(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::Equal, other)
    }

    fn not_equal(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::NotEqual, other)
    }

    fn less_than(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::LessThan, other)
    }

    fn less_or_equal(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::LessThanOrEqual, other)
    }

    fn greater_than(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::GreaterThan, other)
    }

    fn greater_or_equal(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::GreaterThanOrEqual, other)
    }

    fn and(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::And, other)
    }

    fn or(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::Or, other)
    }

    fn add(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::Add, other)
    }

    fn subtract(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::Subtract, other)
    }

    fn multiply(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::Multiply, other)
    }

    fn coalesce(&self, other: ExprRef) -> ExprRef {
        self.binary(BinaryOp::Coalesce, other)
    }
}

impl ExprExt for ExprRef {
    fn member(&self, name: &str) -> ExprRef {
        Arc::new(Expr::Member {
            target: self.clone(),
            name: name.to_string(),
        })
    }

    fn binary(&self, op: BinaryOp, other: ExprRef) -> ExprRef {
        Arc::new(Expr::Binary {
            left: self.clone(),
            op,
            right: other,
        })
    }

    fn not(&self) -> ExprRef {
        Arc::new(Expr::Unary {
            op: UnaryOp::Not,
            operand: self.clone(),
        })
    }

    fn negate(&self) -> ExprRef {
        Arc::new(Expr::Unary {
            op: UnaryOp::Negate,
            operand: self.clone(),
        })
    }

    fn func(&self, name: &str, args: Vec<ExprRef>) -> ExprRef {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(self.clone());
        all.extend(args);
        function(name, all)
    }

    fn query(&self) -> QueryBuilder {
        QueryBuilder::from_expr(self.clone())
    }
}

/// Chains sequence operators onto a source expression.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    expr: ExprRef,
}

impl QueryBuilder {
    pub fn from_expr(expr: ExprRef) -> Self {
        Self { expr }
    }

    fn apply(self, operator: QueryOperator, extra: Vec<ExprRef>) -> Self {
        let mut args = Vec::with_capacity(extra.len() + 1);
        args.push(self.expr);
        args.extend(extra);
        Self {
            expr: call(operator, args),
        }
    }

    fn apply_lambda(self, operator: QueryOperator, param: &str, body: ExprRef) -> Self {
        self.apply(operator, vec![lambda(&[param], body)])
    }

    pub fn filter(self, param: &str, predicate: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Where, param, predicate)
    }

    pub fn select(self, param: &str, projection: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Select, param, projection)
    }

    pub fn order_by(self, param: &str, key: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::OrderBy, param, key)
    }

    pub fn order_by_descending(self, param: &str, key: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::OrderByDescending, param, key)
    }

    pub fn then_by(self, param: &str, key: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::ThenBy, param, key)
    }

    pub fn then_by_descending(self, param: &str, key: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::ThenByDescending, param, key)
    }

    pub fn skip(self, count: i64) -> Self {
        self.apply(QueryOperator::Skip, vec![constant(count)])
    }

    pub fn take(self, count: i64) -> Self {
        self.apply(QueryOperator::Take, vec![constant(count)])
    }

    pub fn segment(self, segment: DataSegment) -> Self {
        self.apply(QueryOperator::Segment, vec![Arc::new(Expr::Segment(segment))])
    }

    pub fn distinct(self) -> Self {
        self.apply(QueryOperator::Distinct, vec![])
    }

    pub fn group_by(self, param: &str, key: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::GroupBy, param, key)
    }

    /// Inner join. `outer_key` and `inner_key` are `(param, body)` pairs,
    /// `result` is `(outer_param, inner_param, body)`.
    pub fn join(
        self,
        inner: impl Into<ExprRef>,
        outer_key: (&str, ExprRef),
        inner_key: (&str, ExprRef),
        result: (&str, &str, ExprRef),
    ) -> Self {
        self.join_with(QueryOperator::Join, inner.into(), outer_key, inner_key, result)
    }

    pub fn left_join(
        self,
        inner: impl Into<ExprRef>,
        outer_key: (&str, ExprRef),
        inner_key: (&str, ExprRef),
        result: (&str, &str, ExprRef),
    ) -> Self {
        self.join_with(QueryOperator::LeftJoin, inner.into(), outer_key, inner_key, result)
    }

    fn join_with(
        self,
        operator: QueryOperator,
        inner: ExprRef,
        outer_key: (&str, ExprRef),
        inner_key: (&str, ExprRef),
        result: (&str, &str, ExprRef),
    ) -> Self {
        self.apply(
            operator,
            vec![
                inner,
                lambda(&[outer_key.0], outer_key.1),
                lambda(&[inner_key.0], inner_key.1),
                lambda(&[result.0, result.1], result.2),
            ],
        )
    }

    pub fn count(self) -> Self {
        self.apply(QueryOperator::Count, vec![])
    }

    pub fn count_where(self, param: &str, predicate: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Count, param, predicate)
    }

    pub fn long_count(self) -> Self {
        self.apply(QueryOperator::LongCount, vec![])
    }

    pub fn any(self) -> Self {
        self.apply(QueryOperator::Any, vec![])
    }

    pub fn any_where(self, param: &str, predicate: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Any, param, predicate)
    }

    pub fn all(self, param: &str, predicate: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::All, param, predicate)
    }

    pub fn contains(self, value: ExprRef) -> Self {
        self.apply(QueryOperator::Contains, vec![value])
    }

    pub fn first(self) -> Self {
        self.apply(QueryOperator::First, vec![])
    }

    pub fn first_where(self, param: &str, predicate: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::First, param, predicate)
    }

    pub fn first_or_default(self) -> Self {
        self.apply(QueryOperator::FirstOrDefault, vec![])
    }

    pub fn single(self) -> Self {
        self.apply(QueryOperator::Single, vec![])
    }

    pub fn single_or_default(self) -> Self {
        self.apply(QueryOperator::SingleOrDefault, vec![])
    }

    pub fn sum(self, param: &str, selector: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Sum, param, selector)
    }

    pub fn min(self, param: &str, selector: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Min, param, selector)
    }

    pub fn max(self, param: &str, selector: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Max, param, selector)
    }

    pub fn average(self, param: &str, selector: ExprRef) -> Self {
        self.apply_lambda(QueryOperator::Average, param, selector)
    }

    pub fn build(self) -> ExprRef {
        self.expr
    }
}

impl From<QueryBuilder> for ExprRef {
    fn from(builder: QueryBuilder) -> Self {
        builder.expr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chains_source_first() {
        let expr = entity("Customer")
            .filter("c", param("c").member("active"))
            .take(5)
            .build();
        match expr.as_ref() {
            Expr::Call { operator, args } => {
                assert_eq!(*operator, QueryOperator::Take);
                assert_eq!(args.len(), 2);
                match args[0].as_ref() {
                    Expr::Call { operator, .. } => assert_eq!(*operator, QueryOperator::Where),
                    other => panic!("unexpected source {:?}", other),
                }
            }
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_join_builds_three_lambdas() {
        let expr = entity("Customer")
            .join(
                entity("Order"),
                ("c", param("c").member("id")),
                ("o", param("o").member("customer_id")),
                ("c", "o", param("o")),
            )
            .build();
        if let Expr::Call { args, .. } = expr.as_ref() {
            assert_eq!(args.len(), 5);
            assert!(matches!(args[4].as_ref(), Expr::Lambda { params, .. } if params.len() == 2));
        } else {
            panic!("expected call");
        }
    }

    #[test]
    fn test_func_puts_receiver_first() {
        let expr = param("c")
            .member("name")
            .func("starts_with", vec![constant("A")]);
        assert_eq!(expr.to_string(), "starts_with(c.name, \"A\")");
    }

    #[test]
    fn test_display_of_built_query() {
        let expr = entity("Customer")
            .filter("c", param("c").member("age").greater_than(constant(18)))
            .build();
        assert_eq!(expr.to_string(), "Customer.Where(c => (c.age > 18))");
    }
}
