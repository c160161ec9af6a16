use crate::dialect::{DialectError, TranslateResult};
use crate::error::{TranslationCause, TranslationError};
use crate::relational::RelationalForm;

use super::plan::{CompiledCommand, ExecutionPlan, Invoker, PlanMode};

/// How the plan will be driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// `None` means "whatever the caller's context implies", which is sync.
    pub is_async: Option<bool>,
    /// Rows are consumed as a lazy stream.
    pub is_enumerable: bool,
    pub is_no_tracking: bool,
}

impl BuildOptions {
    pub fn mode(&self) -> PlanMode {
        if self.is_enumerable {
            PlanMode::Stream
        } else if self.is_async.unwrap_or(false) {
            PlanMode::Async
        } else {
            PlanMode::Sync
        }
    }

    pub fn for_mode(mode: PlanMode, is_no_tracking: bool) -> Self {
        Self {
            is_async: Some(mode.is_async()),
            is_enumerable: mode == PlanMode::Stream,
            is_no_tracking,
        }
    }
}

/// Turn a relational form into an execution plan. `translate` runs the
/// dialect over the form's outer select; only parameter sources from its
/// result are kept, so the plan binds fresh values on every call.
pub fn build<F>(
    form: &RelationalForm,
    translate: F,
    options: BuildOptions,
) -> Result<ExecutionPlan, TranslationError>
where
    F: FnOnce(&RelationalForm) -> Result<TranslateResult, DialectError>,
{
    let result = translate(form)
        .map_err(|e| TranslationError::new(&form.origin, TranslationCause::Dialect(e)))?;
    let command = CompiledCommand {
        sources: result.sources(),
        text: result.command_text,
    };
    let mode = options.mode();
    let invoker = Invoker::select(mode.is_async(), form.has_segment());
    Ok(ExecutionPlan::new(
        command,
        form.shape,
        mode,
        invoker,
        options.is_no_tracking,
    ))
}
