/// Relational form → PostgreSQL command text.
///
/// Parameters are emitted as `$n` placeholders in the order they first
/// appear in the text. A parameter source used twice (for example the same
/// constant in two clauses) shares one placeholder.
use super::*;
use crate::relational::*;

#[derive(Debug, Clone, Default)]
pub struct PostgresDialect {
    passthrough_functions: bool,
}

impl PostgresDialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit unknown scalar functions verbatim instead of rejecting them.
    pub fn with_passthrough(mut self, enabled: bool) -> Self {
        self.passthrough_functions = enabled;
        self
    }
}

impl DialectTranslator for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            passthrough_functions: self.passthrough_functions,
            ..Default::default()
        }
    }

    fn function_name(&self, name: &str) -> Option<&'static str> {
        let mapped = match name {
            "to_lower" | "lower" => "LOWER",
            "to_upper" | "upper" => "UPPER",
            "trim" => "TRIM",
            "length" | "len" => "LENGTH",
            "substring" => "SUBSTRING",
            "replace" => "REPLACE",
            "abs" => "ABS",
            "round" => "ROUND",
            "floor" => "FLOOR",
            "ceiling" | "ceil" => "CEIL",
            "now" => "NOW",
            "date_trunc" => "DATE_TRUNC",
            "coalesce" => "COALESCE",
            _ => return None,
        };
        Some(mapped)
    }

    fn translate(
        &self,
        select: &SelectQuery,
        ctx: &TranslateContext<'_>,
    ) -> Result<TranslateResult, DialectError> {
        let mut writer = SqlWriter {
            ctx,
            quote: ctx.options.quote_identifiers,
            parameters: Vec::new(),
        };
        let command_text = writer.select(select)?;
        Ok(TranslateResult {
            command_text,
            parameters: writer.parameters,
            nested_results: Vec::new(),
        })
    }
}

struct SqlWriter<'c, 'a> {
    ctx: &'c TranslateContext<'a>,
    quote: bool,
    parameters: Vec<BoundParameter>,
}

type Sql = Result<String, DialectError>;

impl SqlWriter<'_, '_> {
    fn select(&mut self, select: &SelectQuery) -> Sql {
        let mut parts = Vec::new();

        let mut select_clause = String::from("SELECT ");
        if select.distinct {
            select_clause.push_str("DISTINCT ");
        }
        if select.projections.is_empty() {
            select_clause.push('*');
        } else {
            let items = select
                .projections
                .iter()
                .map(|item| self.select_item(item))
                .collect::<Result<Vec<_>, _>>()?;
            select_clause.push_str(&items.join(", "));
        }
        parts.push(select_clause);

        if let Some(from) = &select.from {
            parts.push(format!("FROM {}", self.table_ref(from)?));
        }

        for join in &select.joins {
            let keyword = match join.join_type {
                JoinType::Inner => "JOIN",
                JoinType::Left => "LEFT JOIN",
            };
            let table = self.table_ref(&join.table)?;
            match &join.condition {
                Some(condition) => {
                    parts.push(format!("{} {} ON {}", keyword, table, self.expr(condition)?))
                }
                None => parts.push(format!("{} {} ON TRUE", keyword, table)),
            }
        }

        if let Some(filter) = &select.filter {
            parts.push(format!("WHERE {}", self.expr(filter)?));
        }

        if !select.group_by.is_empty() {
            let groups = self.expr_list(&select.group_by)?;
            parts.push(format!("GROUP BY {}", groups));
        }

        if let Some(having) = &select.having {
            parts.push(format!("HAVING {}", self.expr(having)?));
        }

        if !select.order_by.is_empty() {
            let mut orders = Vec::with_capacity(select.order_by.len());
            for order in &select.order_by {
                let mut s = self.expr(&order.expr)?;
                if !order.asc {
                    s.push_str(" DESC");
                }
                orders.push(s);
            }
            parts.push(format!("ORDER BY {}", orders.join(", ")));
        }

        if let Some(limit) = &select.limit {
            parts.push(format!("LIMIT {}", self.expr(limit)?));
        }

        if let Some(offset) = &select.offset {
            parts.push(format!("OFFSET {}", self.expr(offset)?));
        }

        Ok(parts.join(" "))
    }

    fn select_item(&mut self, item: &SelectItem) -> Sql {
        match item {
            SelectItem::Wildcard => Ok("*".to_string()),
            SelectItem::Expression { expr, alias } => {
                let expr = self.expr(expr)?;
                Ok(match alias {
                    Some(a) => format!("{} AS {}", expr, self.ident(a)),
                    None => expr,
                })
            }
        }
    }

    fn table_ref(&mut self, table: &TableRef) -> Sql {
        match table {
            TableRef::Table {
                schema,
                name,
                alias,
            } => {
                let name = match schema {
                    Some(sc) => format!("{}.{}", self.ident(sc), self.ident(name)),
                    None => self.ident(name),
                };
                Ok(format!("{} AS {}", name, self.ident(alias)))
            }
            TableRef::Subquery { query, alias } => {
                Ok(format!("({}) AS {}", self.select(query)?, self.ident(alias)))
            }
        }
    }

    fn expr_list(&mut self, exprs: &[RelExpr]) -> Sql {
        let items = exprs
            .iter()
            .map(|e| self.expr(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items.join(", "))
    }

    fn expr(&mut self, expr: &RelExpr) -> Sql {
        Ok(match expr {
            RelExpr::Column { table, name } => match table {
                Some(t) => format!("{}.{}", self.ident(t), self.ident(name)),
                None => self.ident(name),
            },
            RelExpr::Literal(lit) => literal(lit),
            RelExpr::Parameter(source) => self.placeholder(*source)?,
            RelExpr::BinaryOp { left, op, right } => {
                let l = self.operand(left, *op, false)?;
                let r = self.operand(right, *op, true)?;
                format!("{} {} {}", l, operator_symbol(*op), r)
            }
            RelExpr::UnaryOp { op, expr } => {
                let inner = self.expr(expr)?;
                let inner = if matches!(expr.as_ref(), RelExpr::BinaryOp { .. }) {
                    format!("({})", inner)
                } else {
                    inner
                };
                match op {
                    UnaryOperator::Not => format!("NOT {}", inner),
                    UnaryOperator::Minus => format!("-{}", inner),
                }
            }
            RelExpr::Function { name, args } => {
                format!("{}({})", name, self.expr_list(args)?)
            }
            RelExpr::Aggregate {
                name,
                args,
                distinct,
            } => {
                let distinct_str = if *distinct { "DISTINCT " } else { "" };
                let call = format!("{}({}{})", name, distinct_str, self.expr_list(args)?);
                // AVG of integers is numeric; results are read as float8.
                if name.eq_ignore_ascii_case("AVG") {
                    format!("CAST({} AS DOUBLE PRECISION)", call)
                } else {
                    call
                }
            }
            RelExpr::Case {
                when_clauses,
                else_clause,
            } => {
                let mut s = String::from("CASE");
                for (when, then) in when_clauses {
                    let when = self.expr(when)?;
                    let then = self.expr(then)?;
                    s.push_str(&format!(" WHEN {} THEN {}", when, then));
                }
                if let Some(else_expr) = else_clause {
                    s.push_str(&format!(" ELSE {}", self.expr(else_expr)?));
                }
                s.push_str(" END");
                s
            }
            RelExpr::Subquery(q) => format!("({})", self.select(q)?),
            RelExpr::Exists { query, negated } => {
                let not_str = if *negated { "NOT " } else { "" };
                format!("{}EXISTS ({})", not_str, self.select(query)?)
            }
            RelExpr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let not_str = if *negated { "NOT " } else { "" };
                let value = self.expr(expr)?;
                format!("{} {}IN ({})", value, not_str, self.select(subquery)?)
            }
            RelExpr::IsNull { expr, negated } => {
                let inner = self.expr(expr)?;
                let inner = if matches!(expr.as_ref(), RelExpr::BinaryOp { .. }) {
                    format!("({})", inner)
                } else {
                    inner
                };
                if *negated {
                    format!("{} IS NOT NULL", inner)
                } else {
                    format!("{} IS NULL", inner)
                }
            }
            RelExpr::Wildcard => "*".to_string(),
            RelExpr::Nested(expr) => format!("({})", self.expr(expr)?),
        })
    }

    /// Operand of a binary operator, parenthesized when it binds looser.
    fn operand(&mut self, operand: &RelExpr, parent: BinaryOperator, right: bool) -> Sql {
        let text = self.expr(operand)?;
        let wrap = match operand {
            RelExpr::BinaryOp { op, .. } => {
                op.precedence() < parent.precedence()
                    || (right
                        && op.precedence() == parent.precedence()
                        && !(*op == parent && parent.is_associative()))
            }
            RelExpr::UnaryOp {
                op: UnaryOperator::Not,
                ..
            } => !matches!(parent, BinaryOperator::And | BinaryOperator::Or),
            _ => false,
        };
        Ok(if wrap { format!("({})", text) } else { text })
    }

    fn placeholder(&mut self, source: ParamSource) -> Sql {
        if let Some(existing) = self.parameters.iter().find(|p| p.source == source) {
            return Ok(existing.name.clone());
        }
        let value = self.ctx.resolve(source)?;
        let name = format!("${}", self.parameters.len() + 1);
        self.parameters.push(BoundParameter {
            name: name.clone(),
            source,
            value,
        });
        Ok(name)
    }

    fn ident(&self, name: &str) -> String {
        if self.quote {
            format!("\"{}\"", name.replace('"', "\"\""))
        } else {
            name.to_string()
        }
    }
}

fn operator_symbol(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Eq => "=",
        BinaryOperator::NotEq => "<>",
        BinaryOperator::Lt => "<",
        BinaryOperator::LtEq => "<=",
        BinaryOperator::Gt => ">",
        BinaryOperator::GtEq => ">=",
        BinaryOperator::And => "AND",
        BinaryOperator::Or => "OR",
        BinaryOperator::Plus => "+",
        BinaryOperator::Minus => "-",
        BinaryOperator::Multiply => "*",
        BinaryOperator::Divide => "/",
        BinaryOperator::Modulo => "%",
        BinaryOperator::Like => "LIKE",
        BinaryOperator::Concat => "||",
    }
}

fn literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{}", f),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}
