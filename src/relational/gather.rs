//! Flattening of nested selects.
//!
//! Expression-level subqueries (scalar, EXISTS, IN) are listed after the outer
//! select in the order their source expressions appear in the query, nested
//! ones right after their parent. Derived tables in FROM/JOIN are part of the
//! statement that owns them and are not listed, but subqueries inside them
//! are.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::*;
use crate::expr::{Expr, ExprRef};

pub struct SelectGatherer<'a> {
    positions: HashMap<*const Expr, usize>,
    found: Vec<&'a SelectQuery>,
}

impl<'a> SelectGatherer<'a> {
    /// Outer select first, then every nested select, depth-first.
    pub fn gather(select: &'a SelectQuery, root: &ExprRef) -> Vec<&'a SelectQuery> {
        let mut positions = HashMap::new();
        let mut next = 0usize;
        Expr::walk(root, &mut |node| {
            positions.entry(Arc::as_ptr(node)).or_insert(next);
            next += 1;
        });

        let mut gatherer = SelectGatherer {
            positions,
            found: Vec::new(),
        };
        gatherer.visit_select(select);

        let SelectGatherer {
            positions,
            mut found,
        } = gatherer;
        found.sort_by_key(|nested| {
            nested
                .origin
                .as_ref()
                .and_then(|origin| positions.get(&Arc::as_ptr(origin)).copied())
                .unwrap_or(usize::MAX)
        });

        let mut ordered = Vec::with_capacity(found.len() + 1);
        ordered.push(select);
        ordered.extend(found);
        ordered
    }

    fn visit_select(&mut self, select: &'a SelectQuery) {
        if let Some(TableRef::Subquery { query, .. }) = &select.from {
            self.visit_select(query);
        }
        for join in &select.joins {
            if let TableRef::Subquery { query, .. } = &join.table {
                self.visit_select(query);
            }
            if let Some(condition) = &join.condition {
                self.visit_expr(condition);
            }
        }
        if let Some(filter) = &select.filter {
            self.visit_expr(filter);
        }
        for item in &select.projections {
            if let SelectItem::Expression { expr, .. } = item {
                self.visit_expr(expr);
            }
        }
        for expr in &select.group_by {
            self.visit_expr(expr);
        }
        if let Some(having) = &select.having {
            self.visit_expr(having);
        }
        for order in &select.order_by {
            self.visit_expr(&order.expr);
        }
        for bound in [&select.limit, &select.offset].into_iter().flatten() {
            self.visit_expr(bound);
        }
    }

    fn visit_expr(&mut self, expr: &'a RelExpr) {
        match expr {
            RelExpr::Subquery(query) | RelExpr::Exists { query, .. } => self.nested(query),
            RelExpr::InSubquery { expr, subquery, .. } => {
                self.visit_expr(expr);
                self.nested(subquery);
            }
            RelExpr::BinaryOp { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            RelExpr::UnaryOp { expr, .. }
            | RelExpr::IsNull { expr, .. }
            | RelExpr::Nested(expr) => self.visit_expr(expr),
            RelExpr::Function { args, .. } | RelExpr::Aggregate { args, .. } => {
                for arg in args {
                    self.visit_expr(arg);
                }
            }
            RelExpr::Case {
                when_clauses,
                else_clause,
            } => {
                for (when, then) in when_clauses {
                    self.visit_expr(when);
                    self.visit_expr(then);
                }
                if let Some(else_clause) = else_clause {
                    self.visit_expr(else_clause);
                }
            }
            RelExpr::Column { .. }
            | RelExpr::Literal(_)
            | RelExpr::Parameter(_)
            | RelExpr::Wildcard => {}
        }
    }

    fn nested(&mut self, query: &'a SelectQuery) {
        self.found.push(query);
        self.visit_select(query);
    }
}
