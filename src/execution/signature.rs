//! Classification of plan invocation signatures.
//!
//! Every plan exposes the parameter types it must be invoked with. Callers
//! only need two facts about such a list (does it take a cancellation token,
//! does it take a segment), so the answer is memoized per distinct list.

use std::borrow::Borrow;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use super::plan::ParamType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParameterShape(Box<[ParamType]>);

impl Borrow<[ParamType]> for ParameterShape {
    fn borrow(&self) -> &[ParamType] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SignatureDescriptor {
    pub is_async: bool,
    pub has_segment: bool,
}

impl SignatureDescriptor {
    fn compute(types: &[ParamType]) -> Self {
        Self {
            is_async: types.contains(&ParamType::Cancellation),
            has_segment: types.contains(&ParamType::Segment),
        }
    }
}

#[derive(Debug, Default)]
pub struct SignatureClassifier {
    shapes: DashMap<ParameterShape, SignatureDescriptor>,
    computed: AtomicUsize,
}

impl SignatureClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, types: &[ParamType]) -> SignatureDescriptor {
        if let Some(found) = self.shapes.get(types) {
            return *found;
        }
        *self
            .shapes
            .entry(ParameterShape(types.into()))
            .or_insert_with(|| {
                self.computed.fetch_add(1, Ordering::Relaxed);
                SignatureDescriptor::compute(types)
            })
    }

    /// Number of descriptors computed so far, one per distinct shape.
    pub fn computed(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}
