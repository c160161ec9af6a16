//! Query expression tree.
//!
//! Expressions are immutable and shared through `Arc`, so a plan, a relational
//! form and an error can all point back at the node they came from without
//! copying the tree. Nothing in this crate mutates an expression after it has
//! been built.

use std::fmt;
use std::sync::Arc;

pub type ExprRef = Arc<Expr>;

/// Literal value carried by a constant node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Kind name used by fingerprints and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Paging directive: rows `[start, start + length)`, or everything from
/// `start` on when `length` is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataSegment {
    pub start: u64,
    pub length: Option<u64>,
}

impl DataSegment {
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
        }
    }

    pub fn unbounded(start: u64) -> Self {
        Self {
            start,
            length: None,
        }
    }

    /// Zero-based page of `size` rows.
    pub fn page(index: u64, size: u64) -> Self {
        Self::new(index.saturating_mul(size), size)
    }

    /// Exclusive end row, if bounded.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|len| self.start.saturating_add(len))
    }

    /// Drop the first `n` rows of this segment.
    pub fn skip(self, n: u64) -> Self {
        Self {
            start: self.start.saturating_add(n),
            length: self.length.map(|len| len.saturating_sub(n)),
        }
    }

    /// Start row as a bound parameter. Counts past `i64::MAX` clamp to it.
    pub fn start_value(&self) -> Value {
        Value::Int(clamp_count(self.start))
    }

    /// Row count as a bound parameter, null when unbounded.
    pub fn length_value(&self) -> Value {
        self.length
            .map(|len| Value::Int(clamp_count(len)))
            .unwrap_or(Value::Null)
    }

    /// Keep at most `n` rows of this segment.
    pub fn take(self, n: u64) -> Self {
        Self {
            start: self.start,
            length: Some(self.length.map_or(n, |len| len.min(n))),
        }
    }
}

fn clamp_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl fmt::Display for DataSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(len) => write!(f, "[{}..+{}]", self.start, len),
            None => write!(f, "[{}..]", self.start),
        }
    }
}

/// Sequence operators. The first argument of a call is always the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperator {
    Where,
    Select,
    Join,
    LeftJoin,
    OrderBy,
    OrderByDescending,
    ThenBy,
    ThenByDescending,
    Skip,
    Take,
    Segment,
    Distinct,
    GroupBy,
    Count,
    LongCount,
    Any,
    All,
    Contains,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Sum,
    Min,
    Max,
    Average,
}

impl QueryOperator {
    pub fn name(&self) -> &'static str {
        match self {
            QueryOperator::Where => "Where",
            QueryOperator::Select => "Select",
            QueryOperator::Join => "Join",
            QueryOperator::LeftJoin => "LeftJoin",
            QueryOperator::OrderBy => "OrderBy",
            QueryOperator::OrderByDescending => "OrderByDescending",
            QueryOperator::ThenBy => "ThenBy",
            QueryOperator::ThenByDescending => "ThenByDescending",
            QueryOperator::Skip => "Skip",
            QueryOperator::Take => "Take",
            QueryOperator::Segment => "Segment",
            QueryOperator::Distinct => "Distinct",
            QueryOperator::GroupBy => "GroupBy",
            QueryOperator::Count => "Count",
            QueryOperator::LongCount => "LongCount",
            QueryOperator::Any => "Any",
            QueryOperator::All => "All",
            QueryOperator::Contains => "Contains",
            QueryOperator::First => "First",
            QueryOperator::FirstOrDefault => "FirstOrDefault",
            QueryOperator::Single => "Single",
            QueryOperator::SingleOrDefault => "SingleOrDefault",
            QueryOperator::Sum => "Sum",
            QueryOperator::Min => "Min",
            QueryOperator::Max => "Max",
            QueryOperator::Average => "Average",
        }
    }

    /// Operators that end a query and produce a single row or value.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryOperator::Count
                | QueryOperator::LongCount
                | QueryOperator::Any
                | QueryOperator::All
                | QueryOperator::Contains
                | QueryOperator::First
                | QueryOperator::FirstOrDefault
                | QueryOperator::Single
                | QueryOperator::SingleOrDefault
                | QueryOperator::Sum
                | QueryOperator::Min
                | QueryOperator::Max
                | QueryOperator::Average
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Coalesce,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Coalesce => "??",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// A node of the query expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Root sequence of an entity set, e.g. `Customers`.
    Entity(String),
    /// Sequence operator applied to `args[0]`.
    Call {
        operator: QueryOperator,
        args: Vec<ExprRef>,
    },
    Lambda {
        params: Vec<String>,
        body: ExprRef,
    },
    /// Reference to a lambda parameter.
    Parameter(String),
    Member {
        target: ExprRef,
        name: String,
    },
    Constant(Value),
    /// Paging marker argument of `Segment`.
    Segment(DataSegment),
    Binary {
        left: ExprRef,
        op: BinaryOp,
        right: ExprRef,
    },
    Unary {
        op: UnaryOp,
        operand: ExprRef,
    },
    /// Scalar function call such as `contains` or `to_lower`.
    Function {
        name: String,
        args: Vec<ExprRef>,
    },
    /// Anonymous object construction: `new { a = .., b = .. }`.
    New(Vec<(String, ExprRef)>),
    Conditional {
        test: ExprRef,
        if_true: ExprRef,
        if_false: ExprRef,
    },
}

impl Expr {
    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&ExprRef> {
        match self {
            Expr::Entity(_) | Expr::Parameter(_) | Expr::Constant(_) | Expr::Segment(_) => {
                Vec::new()
            }
            Expr::Call { args, .. } | Expr::Function { args, .. } => args.iter().collect(),
            Expr::Lambda { body, .. } => vec![body],
            Expr::Member { target, .. } => vec![target],
            Expr::Binary { left, right, .. } => vec![left, right],
            Expr::Unary { operand, .. } => vec![operand],
            Expr::New(fields) => fields.iter().map(|(_, e)| e).collect(),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => vec![test, if_true, if_false],
        }
    }

    /// Pre-order traversal. Fingerprinting, constant collection and segment
    /// search all rely on this exact order.
    pub fn walk<'a>(expr: &'a ExprRef, visit: &mut impl FnMut(&'a ExprRef)) {
        visit(expr);
        for child in expr.children() {
            Expr::walk(child, visit);
        }
    }

    /// Strip parameterless lambdas wrapping the query root.
    pub fn unwrap_root(expr: &ExprRef) -> ExprRef {
        let mut current = expr.clone();
        while let Expr::Lambda { params, body } = current.as_ref() {
            if !params.is_empty() {
                break;
            }
            let next = body.clone();
            current = next;
        }
        current
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Expr::Constant(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Entity(name) => write!(f, "{}", name),
            Expr::Call { operator, args } => {
                match args.first() {
                    Some(source) => write!(f, "{}.{}(", source, operator.name())?,
                    None => write!(f, "{}(", operator.name())?,
                }
                for (i, arg) in args.iter().skip(1).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Lambda { params, body } => match params.len() {
                1 => write!(f, "{} => {}", params[0], body),
                _ => write!(f, "({}) => {}", params.join(", "), body),
            },
            Expr::Parameter(name) => write!(f, "{}", name),
            Expr::Member { target, name } => write!(f, "{}.{}", target, name),
            Expr::Constant(v) => write!(f, "{}", v),
            Expr::Segment(seg) => write!(f, "{}", seg),
            Expr::Binary { left, op, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{}", operand),
                UnaryOp::Negate => write!(f, "-{}", operand),
            },
            Expr::Function { name, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
            Expr::New(fields) => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|(name, e)| format!("{} = {}", name, e))
                    .collect();
                write!(f, "new {{ {} }}", fields.join(", "))
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => write!(f, "({} ? {} : {})", test, if_true, if_false),
        }
    }
}
