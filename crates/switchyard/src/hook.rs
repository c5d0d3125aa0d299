//! Stage hooks.

use switchyard_core::DispatchError;

use crate::{Rpc, Stage};

/// Observes the pipeline before every stage runs.
///
/// Returning an error fails the stage as if the stage itself had failed: the
/// error goes to the error handlers and the call skips ahead to fault
/// handling. [`Stage::Cleanup`] still runs when its hook fails.
pub trait StageHook: Send + Sync {
    fn before_stage(&self, stage: Stage, call: &Rpc) -> Result<(), DispatchError>;
}

impl<F> StageHook for F
where
    F: Fn(Stage, &Rpc) -> Result<(), DispatchError> + Send + Sync,
{
    fn before_stage(&self, stage: Stage, call: &Rpc) -> Result<(), DispatchError> {
        self(stage, call)
    }
}
