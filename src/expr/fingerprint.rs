//! Structural identity of a query expression.
//!
//! The fingerprint renders the tree into a canonical shape string. Literal
//! constants contribute only their kind, so queries that differ in constant
//! values share a fingerprint and therefore a compiled plan. Lambda
//! parameters are renamed positionally, so `c => c.id` and `x => x.id`
//! collide as they should.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::types::*;

#[derive(Debug, Clone)]
pub struct Fingerprint {
    shape: Arc<str>,
    hash: u64,
}

impl Fingerprint {
    pub fn of(expr: &Expr) -> Self {
        let mut writer = ShapeWriter::default();
        writer.write(expr);
        let mut hasher = DefaultHasher::new();
        writer.out.hash(&mut hasher);
        Self {
            shape: Arc::from(writer.out),
            hash: hasher.finish(),
        }
    }

    pub fn shape(&self) -> &str {
        &self.shape
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.shape == other.shape
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.hash)
    }
}

#[derive(Default)]
struct ShapeWriter {
    out: String,
    scope: Vec<String>,
}

impl ShapeWriter {
    fn write(&mut self, expr: &Expr) {
        match expr {
            Expr::Entity(name) => {
                let _ = write!(self.out, "E{:?}", name);
            }
            Expr::Call { operator, args } => {
                self.out.push_str(operator.name());
                self.list(args.iter().map(|a| a.as_ref()));
            }
            Expr::Lambda { params, body } => {
                let _ = write!(self.out, "L{}(", params.len());
                self.scope.extend(params.iter().cloned());
                self.write(body);
                self.scope.truncate(self.scope.len() - params.len());
                self.out.push(')');
            }
            Expr::Parameter(name) => match self.scope.iter().rposition(|p| p == name) {
                Some(pos) => {
                    let _ = write!(self.out, "${}", pos);
                }
                None => {
                    let _ = write!(self.out, "?{:?}", name);
                }
            },
            Expr::Member { target, name } => {
                self.out.push_str("M(");
                self.write(target);
                let _ = write!(self.out, ",{:?})", name);
            }
            Expr::Constant(value) => {
                self.out.push('#');
                self.out.push_str(value.kind());
            }
            Expr::Segment(_) => self.out.push_str("#segment"),
            Expr::Binary { left, op, right } => {
                let _ = write!(self.out, "B:{:?}", op);
                self.list([left.as_ref(), right.as_ref()].into_iter());
            }
            Expr::Unary { op, operand } => {
                let _ = write!(self.out, "U:{:?}", op);
                self.list(std::iter::once(operand.as_ref()));
            }
            Expr::Function { name, args } => {
                let _ = write!(self.out, "F{:?}", name);
                self.list(args.iter().map(|a| a.as_ref()));
            }
            Expr::New(fields) => {
                self.out.push_str("N{");
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    let _ = write!(self.out, "{:?}:", name);
                    self.write(value);
                }
                self.out.push('}');
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.out.push('C');
                self.list([test.as_ref(), if_true.as_ref(), if_false.as_ref()].into_iter());
            }
        }
    }

    fn list<'a>(&mut self, items: impl Iterator<Item = &'a Expr>) {
        self.out.push('(');
        for (i, item) in items.enumerate() {
            if i > 0 {
                self.out.push(',');
            }
            self.write(item);
        }
        self.out.push(')');
    }
}

/// Constant values in pre-order. A segment node contributes its start and
/// its length (null when unbounded).
pub fn collect_constants(expr: &ExprRef) -> Vec<Value> {
    let mut values = Vec::new();
    Expr::walk(expr, &mut |node| match node.as_ref() {
        Expr::Constant(v) => values.push(v.clone()),
        Expr::Segment(seg) => {
            values.push(seg.start_value());
            values.push(seg.length_value());
        }
        _ => {}
    });
    values
}

/// First slot index of every constant and segment node, numbered the same
/// way [`collect_constants`] orders its values.
pub fn constant_slots(expr: &ExprRef) -> HashMap<*const Expr, usize> {
    let mut slots = HashMap::new();
    let mut next = 0;
    Expr::walk(expr, &mut |node| match node.as_ref() {
        Expr::Constant(_) => {
            slots.insert(Arc::as_ptr(node), next);
            next += 1;
        }
        Expr::Segment(_) => {
            slots.insert(Arc::as_ptr(node), next);
            next += 2;
        }
        _ => {}
    });
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::builder::*;

    fn active_adults(min_age: i64) -> ExprRef {
        entity("Customer")
            .filter(
                "c",
                param("c")
                    .member("active")
                    .and(param("c").member("age").greater_than(constant(min_age))),
            )
            .select("c", param("c").member("name"))
            .build()
    }

    #[test]
    fn test_constant_values_do_not_change_fingerprint() {
        assert_eq!(Fingerprint::of(&active_adults(18)), Fingerprint::of(&active_adults(65)));
    }

    #[test]
    fn test_lambda_parameter_names_do_not_change_fingerprint() {
        let a = entity("Customer").filter("c", param("c").member("active")).build();
        let b = entity("Customer").filter("x", param("x").member("active")).build();
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_operator_shape_changes_fingerprint() {
        let base = entity("Customer").filter("c", param("c").member("active"));
        let corpus = vec![
            base.clone().build(),
            base.clone().take(10).build(),
            base.clone().skip(10).build(),
            base.clone().skip(10).take(10).build(),
            base.clone().order_by("c", param("c").member("id")).build(),
            base.clone().select("c", param("c").member("name")).build(),
            base.clone().select("c", param("c").member("id")).build(),
            base.clone().count().build(),
            base.clone().any().build(),
            base.clone().segment(DataSegment::new(0, 10)).build(),
            entity("Order").filter("c", param("c").member("active")).build(),
            entity("Customer").filter("c", param("c").member("active").not()).build(),
        ];
        for (i, a) in corpus.iter().enumerate() {
            for (j, b) in corpus.iter().enumerate() {
                if i != j {
                    assert_ne!(Fingerprint::of(a), Fingerprint::of(b), "{} vs {}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_constant_kind_changes_fingerprint() {
        let null_email = entity("Customer")
            .filter("c", param("c").member("email").equal(null()))
            .build();
        let some_email = entity("Customer")
            .filter("c", param("c").member("email").equal(constant("a@b.c")))
            .build();
        assert_ne!(Fingerprint::of(&null_email), Fingerprint::of(&some_email));
    }

    #[test]
    fn test_segment_values_do_not_change_fingerprint() {
        let a = entity("Customer").segment(DataSegment::new(0, 10)).build();
        let b = entity("Customer").segment(DataSegment::unbounded(40)).build();
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_collect_constants_in_pre_order() {
        let expr = entity("Customer")
            .filter("c", param("c").member("age").greater_than(constant(18)))
            .skip(20)
            .take(10)
            .build();
        assert_eq!(
            collect_constants(&expr),
            vec![Value::Int(18), Value::Int(20), Value::Int(10)]
        );
    }

    #[test]
    fn test_slots_match_collected_order() {
        let expr = entity("Customer")
            .segment(DataSegment::new(5, 5))
            .filter("c", param("c").member("name").equal(constant("Ann")))
            .build();
        let slots = constant_slots(&expr);
        let values = collect_constants(&expr);
        assert_eq!(values.len(), 3);
        let mut found = Vec::new();
        Expr::walk(&expr, &mut |node| {
            if let Some(slot) = slots.get(&Arc::as_ptr(node)) {
                found.push(*slot);
            }
        });
        assert_eq!(found, vec![0, 2]);
        assert_eq!(values[2], Value::Text("Ann".into()));
    }
}
