//! From relational form to something that runs: plan construction, the
//! plan cache and invocation signature classification.

pub mod builder;
pub mod cache;
pub mod plan;
pub mod signature;

pub use builder::{build, BuildOptions};
pub use cache::{CacheStats, CachedPlan, OptionsKey, PlanCache, PlanKey};
pub use plan::{
    materialize, CompiledCommand, ExecutionPlan, Invocation, Invoker, ParamType, PlanContext,
    PlanMode,
};
pub use signature::{SignatureClassifier, SignatureDescriptor};
