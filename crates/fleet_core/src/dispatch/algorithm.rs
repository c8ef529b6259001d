//! Traits at the optimization seam.

use crate::ecs::{Leg, Trip};
use crate::optimization::CancellationToken;
use crate::snapshot::StateSnapshot;

use super::stats::EnvironmentStatistics;
use super::types::OptimizationResult;

/// A dispatch/assignment strategy invoked on frozen snapshots.
///
/// The snapshot is handed over by value: the dispatcher may mutate it freely
/// (reassign legs, rewrite stop lists) and must hand it back inside the
/// [`OptimizationResult`], naming every trip and vehicle it touched. It can
/// never reach live simulation state.
///
/// Implementations may run on a worker thread; long-running strategies should
/// poll the [`CancellationToken`] and bail out when it fires, since a dispatch
/// that outlives `max_optimization_time` aborts the whole run.
pub trait Dispatcher: Send + Sync {
    fn dispatch(
        &self,
        state: StateSnapshot,
        subset: Option<usize>,
        cancel: &CancellationToken,
    ) -> OptimizationResult;

    /// Cheap pre-check: is there anything worth optimizing? Returning `false`
    /// short-circuits the cycle (the state-machine pass still runs, with an
    /// empty result, to keep the protocol symmetric).
    fn need_to_optimize(&self, _stats: &EnvironmentStatistics) -> bool {
        true
    }
}

/// Decomposes a trip into its boarding legs. Called exactly once per trip, at
/// release; the returned itinerary (at least one leg) is fixed for the trip's
/// lifetime.
pub trait Splitter: Send + Sync {
    fn split(&self, trip: &Trip, state: &StateSnapshot) -> Vec<Leg>;
}

/// Summarizes the environment ahead of a dispatch decision.
pub trait EnvironmentStatisticsExtractor: Send + Sync {
    fn extract(&self, state: &StateSnapshot) -> EnvironmentStatistics;
}
