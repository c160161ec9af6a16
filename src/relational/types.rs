//! Relational form: the dialect-neutral SELECT tree produced from a query
//! expression.
//!
//! Constants never appear as values here. They are referenced through
//! [`ParamSource`] slots and bound when a plan is invoked, which is what
//! lets one compiled plan serve every query of the same shape.

use crate::expr::{DataSegment, ExprRef};

/// Where a bound parameter's value comes from at invocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSource {
    /// Pre-order constant slot of the query expression.
    Constant(usize),
    SegmentStart,
    SegmentLength,
}

/// A SELECT with the clauses the translator emits.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub filter: Option<RelExpr>,
    pub group_by: Vec<RelExpr>,
    pub having: Option<RelExpr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<RelExpr>,
    pub offset: Option<RelExpr>,
    /// Expression this select was translated from.
    pub origin: Option<ExprRef>,
}

impl SelectQuery {
    pub fn is_paged(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Only a FROM clause, so it can be joined without a derived table.
    pub fn is_plain_table(&self) -> bool {
        matches!(self.from, Some(TableRef::Table { .. }))
            && self.joins.is_empty()
            && self.filter.is_none()
            && !self.distinct
            && !self.is_grouped()
            && self.having.is_none()
            && self.order_by.is_empty()
            && !self.is_paged()
    }

    pub fn and_filter(&mut self, predicate: RelExpr) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => RelExpr::and(existing, predicate),
            None => predicate,
        });
    }

    pub fn and_having(&mut self, predicate: RelExpr) {
        self.having = Some(match self.having.take() {
            Some(existing) => RelExpr::and(existing, predicate),
            None => predicate,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expression { expr: RelExpr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Table {
        schema: Option<String>,
        name: String,
        alias: String,
    },
    /// Derived table: `(SELECT ...) AS alias`.
    Subquery { query: Box<SelectQuery>, alias: String },
}

impl TableRef {
    pub fn alias(&self) -> &str {
        match self {
            TableRef::Table { alias, .. } | TableRef::Subquery { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub condition: Option<RelExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Literal),
    Parameter(ParamSource),
    BinaryOp {
        left: Box<RelExpr>,
        op: BinaryOperator,
        right: Box<RelExpr>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<RelExpr>,
    },
    Function {
        name: String,
        args: Vec<RelExpr>,
    },
    Aggregate {
        name: String,
        args: Vec<RelExpr>,
        distinct: bool,
    },
    Case {
        when_clauses: Vec<(RelExpr, RelExpr)>,
        else_clause: Option<Box<RelExpr>>,
    },
    /// Scalar subquery: `(SELECT ...)`.
    Subquery(Box<SelectQuery>),
    Exists {
        query: Box<SelectQuery>,
        negated: bool,
    },
    InSubquery {
        expr: Box<RelExpr>,
        subquery: Box<SelectQuery>,
        negated: bool,
    },
    IsNull {
        expr: Box<RelExpr>,
        negated: bool,
    },
    /// `*` inside `COUNT(*)`.
    Wildcard,
    Nested(Box<RelExpr>),
}

impl RelExpr {
    pub fn column(table: &str, name: &str) -> Self {
        RelExpr::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    pub fn binary(left: RelExpr, op: BinaryOperator, right: RelExpr) -> Self {
        RelExpr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn and(left: RelExpr, right: RelExpr) -> Self {
        Self::binary(left, BinaryOperator::And, right)
    }

    pub fn not(expr: RelExpr) -> Self {
        RelExpr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(expr),
        }
    }

    pub fn aggregate(name: &str, args: Vec<RelExpr>) -> Self {
        RelExpr::Aggregate {
            name: name.to_string(),
            args,
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Self::aggregate("COUNT", vec![RelExpr::Wildcard])
    }

    pub fn integer(value: i64) -> Self {
        RelExpr::Literal(Literal::Integer(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    // String
    Like,
    Concat,
}

impl BinaryOperator {
    /// Binding strength, higher binds tighter.
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOperator::Or => 1,
            BinaryOperator::And => 2,
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq => 4,
            BinaryOperator::Like => 5,
            BinaryOperator::Concat => 6,
            BinaryOperator::Plus | BinaryOperator::Minus => 7,
            BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo => 8,
        }
    }

    /// `a op (b op c)` means the same as `(a op b) op c`.
    pub fn is_associative(&self) -> bool {
        matches!(
            self,
            BinaryOperator::And
                | BinaryOperator::Or
                | BinaryOperator::Plus
                | BinaryOperator::Multiply
                | BinaryOperator::Concat
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOperator {
    Not,
    Minus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: RelExpr,
    pub asc: bool,
}

/// What a query returns once its rows are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultShape {
    Sequence,
    /// First/Single family. `nullable` allows zero rows; `unique` rejects two.
    Single { nullable: bool, unique: bool },
    /// First column of the first row.
    Scalar { nullable: bool },
}

/// Output of the relational translator for one top-level query.
#[derive(Debug, Clone)]
pub struct RelationalForm {
    pub select: SelectQuery,
    pub shape: ResultShape,
    /// Paging directive found when the form was built, if any.
    pub segment: Option<DataSegment>,
    /// Number of constant slots the expression carries.
    pub slot_count: usize,
    pub origin: ExprRef,
}

impl RelationalForm {
    pub fn has_segment(&self) -> bool {
        self.segment.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_table_detection() {
        let mut select = SelectQuery {
            from: Some(TableRef::Table {
                schema: None,
                name: "orders".into(),
                alias: "t1".into(),
            }),
            ..Default::default()
        };
        assert!(select.is_plain_table());
        select.limit = Some(RelExpr::integer(1));
        assert!(!select.is_plain_table());
    }

    #[test]
    fn test_and_filter_combines_predicates() {
        let mut select = SelectQuery::default();
        select.and_filter(RelExpr::column("t0", "active"));
        select.and_filter(RelExpr::column("t0", "verified"));
        match select.filter {
            Some(RelExpr::BinaryOp { op, .. }) => assert_eq!(op, BinaryOperator::And),
            other => panic!("unexpected filter {:?}", other),
        }
    }

    #[test]
    fn test_precedence_order() {
        assert!(BinaryOperator::Or.precedence() < BinaryOperator::And.precedence());
        assert!(BinaryOperator::And.precedence() < BinaryOperator::Eq.precedence());
        assert!(BinaryOperator::Like.precedence() < BinaryOperator::Concat.precedence());
        assert!(BinaryOperator::Plus.precedence() < BinaryOperator::Multiply.precedence());
        assert!(!BinaryOperator::Minus.is_associative());
    }
}
