pub mod catalog;
pub mod gather;
pub mod segment;
pub mod translator;
pub mod types;

pub use catalog::{Catalog, DataType, EntityMetadata, PropertyMetadata};
pub use gather::SelectGatherer;
pub use segment::{SegmentFinder, SegmentMatch};
pub use translator::{translate, DialectContext};
pub use types::*;
