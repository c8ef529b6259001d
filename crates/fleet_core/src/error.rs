//! Kernel errors and the [`FatalError`] escape hatch for bevy systems.

use bevy_ecs::prelude::Resource;
use thiserror::Error;

use crate::clock::EventKind;

/// Errors raised by the simulation kernel.
///
/// Everything except `Codec`/`Io` represents a protocol or logic violation:
/// the run cannot safely continue and the driver loop aborts (after a
/// best-effort checkpoint when `saving_on_exception` is set).
#[derive(Debug, Error)]
pub enum SimulationError {
    /// A state machine received an event its current state has no transition
    /// for. Always an ordering/logic bug upstream, never user-recoverable.
    #[error("invalid protocol sequencing: no transition from {state} on {trigger:?}")]
    InvalidTransition { state: String, trigger: EventKind },

    /// An asynchronous dispatch exceeded `max_optimization_time` and was
    /// forcibly terminated. There is no partial-result merge path.
    #[error("optimization for {scope} exceeded {limit_ms}ms and was terminated")]
    OptimizationTimeout { scope: String, limit_ms: u64 },

    /// A dispatch cycle tried to merge a trip or vehicle that belongs to a
    /// different partition subset.
    #[error("partition overlap: {kind} {id} merged by subset {subset} but owned by subset {owner}")]
    PartitionOverlap {
        kind: &'static str,
        id: String,
        subset: usize,
        owner: usize,
    },

    /// An event referenced an entity the index does not know about.
    #[error("unknown {kind} id {id}")]
    MissingEntity { kind: &'static str, id: String },

    /// An event fired without the state it requires (usually a merge payload).
    #[error("missing expected {0}")]
    MissingUpdate(&'static str),

    #[error("checkpoint codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Carries the first fatal error out of a schedule run.
///
/// Systems cannot return `Result`, so they record the error here and the
/// driver loop converts it into an `Err` after the schedule completes.
#[derive(Debug, Default, Resource)]
pub struct FatalError(Option<SimulationError>);

impl FatalError {
    /// Record an error; the first one wins.
    pub fn set(&mut self, err: SimulationError) {
        if self.0.is_none() {
            self.0 = Some(err);
        }
    }

    pub fn take(&mut self) -> Option<SimulationError> {
        self.0.take()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_error_keeps_the_first_error() {
        let mut fatal = FatalError::default();
        fatal.set(SimulationError::MissingUpdate("route"));
        fatal.set(SimulationError::MissingUpdate("trip"));

        match fatal.take() {
            Some(SimulationError::MissingUpdate(what)) => assert_eq!(what, "route"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!fatal.is_set());
    }
}
