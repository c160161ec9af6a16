//! Query expressions: the immutable input tree, a fluent builder for it,
//! and the structural fingerprint used as the plan cache key.

pub mod builder;
pub mod fingerprint;
pub mod types;

pub use builder::{entity, ExprExt, QueryBuilder};
pub use fingerprint::{collect_constants, constant_slots, Fingerprint};
pub use types::*;
