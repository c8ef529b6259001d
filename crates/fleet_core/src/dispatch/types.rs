//! Dispatcher output contract and the merge payloads derived from it.

use std::collections::VecDeque;

use crate::ecs::{Leg, LegId, Stop, TripId, VehicleId};
use crate::snapshot::StateSnapshot;

/// What a dispatch call hands back: the (still isolated) snapshot it worked
/// on, plus the ids of everything it modified. Merge-back happens exclusively
/// through events replayed on the simulation thread.
#[derive(Debug)]
pub struct OptimizationResult {
    pub state: StateSnapshot,
    pub modified_trips: Vec<TripId>,
    pub modified_vehicles: Vec<VehicleId>,
}

impl OptimizationResult {
    /// A cycle that had nothing to do. Keeps the state-machine pass symmetric.
    pub fn empty(state: StateSnapshot) -> Self {
        Self {
            state,
            modified_trips: Vec::new(),
            modified_vehicles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modified_trips.is_empty() && self.modified_vehicles.is_empty()
    }
}

/// Assignment payload applied to one live trip by `PassengerAssignment`.
#[derive(Debug, Clone)]
pub struct TripUpdate {
    pub trip: TripId,
    /// The trip's current leg as the dispatcher left it (vehicle bound).
    pub current_leg: Leg,
}

/// Itinerary payload applied to one live route by `VehicleNotification`.
#[derive(Debug, Clone)]
pub struct RouteUpdate {
    pub vehicle: VehicleId,
    /// Current stop as the dispatcher left it (boarding list, departure time).
    pub current_stop: Option<Stop>,
    /// Replacement for the not-yet-executed tail of the live route.
    pub next_stops: VecDeque<Stop>,
    /// Full assigned-leg set after this cycle; newly assigned legs are claimed
    /// during merge.
    pub assigned_legs: Vec<LegId>,
}
