//! Paging marker discovery.
//!
//! A marker is either an explicit `Segment(..)` call or a contiguous run of
//! `Skip`/`Take` calls with integer constant counts. The run is composed
//! innermost-first, so `Take(10).Skip(3)` yields rows 3..10. When several
//! markers exist, the first one met in pre-order (the outermost) wins; the
//! others are translated as ordinary LIMIT/OFFSET clauses.

use crate::expr::{DataSegment, Expr, ExprRef, QueryOperator};

/// A located paging marker.
#[derive(Debug, Clone)]
pub struct SegmentMatch<'a> {
    /// Outermost call of the marker.
    pub call: &'a ExprRef,
    /// Sequence the marker pages over.
    pub source: &'a ExprRef,
    pub segment: DataSegment,
}

pub struct SegmentFinder;

impl SegmentFinder {
    pub fn find(expr: &ExprRef) -> Option<DataSegment> {
        Self::locate(expr).map(|m| m.segment)
    }

    pub fn locate(expr: &ExprRef) -> Option<SegmentMatch<'_>> {
        if let Some(found) = Self::marker_at(expr) {
            return Some(found);
        }
        expr.children().into_iter().find_map(Self::locate)
    }

    /// The marker whose outermost call is `expr`, if it is one.
    pub fn marker_at(expr: &ExprRef) -> Option<SegmentMatch<'_>> {
        let Expr::Call { operator, args } = expr.as_ref() else {
            return None;
        };
        match operator {
            QueryOperator::Segment => match (args.first(), args.get(1).map(|a| a.as_ref())) {
                (Some(source), Some(Expr::Segment(segment))) => Some(SegmentMatch {
                    call: expr,
                    source,
                    segment: *segment,
                }),
                _ => None,
            },
            QueryOperator::Skip | QueryOperator::Take => {
                let mut steps = Vec::new();
                let mut current = expr;
                while let Some((op, count, source)) = paging_step(current) {
                    steps.push((op, count));
                    current = source;
                }
                if steps.is_empty() {
                    return None;
                }
                let segment = steps
                    .iter()
                    .rev()
                    .fold(DataSegment::default(), |seg, (op, count)| match op {
                        QueryOperator::Skip => seg.skip(*count),
                        _ => seg.take(*count),
                    });
                Some(SegmentMatch {
                    call: expr,
                    source: current,
                    segment,
                })
            }
            _ => None,
        }
    }
}

/// `Skip(n)` or `Take(n)` with an integer constant; negative counts behave
/// as zero.
fn paging_step(expr: &ExprRef) -> Option<(QueryOperator, u64, &ExprRef)> {
    let Expr::Call { operator, args } = expr.as_ref() else {
        return None;
    };
    if !matches!(operator, QueryOperator::Skip | QueryOperator::Take) || args.len() != 2 {
        return None;
    }
    let count = args[1].as_constant()?.as_i64()?;
    Some((*operator, count.max(0) as u64, &args[0]))
}
