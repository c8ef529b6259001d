//! Reference splitter: one leg per trip.

use crate::ecs::{Leg, LegId, Trip};
use crate::snapshot::StateSnapshot;

use super::algorithm::Splitter;

/// Produces a single origin-to-destination leg carrying the trip's own
/// timing window. Multi-leg decomposition (transfers through hubs) is a
/// collaborator concern; this is the degenerate strategy every scenario can
/// fall back on.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSplitter;

impl Splitter for DirectSplitter {
    fn split(&self, trip: &Trip, _state: &StateSnapshot) -> Vec<Leg> {
        vec![Leg {
            id: LegId {
                trip: trip.id,
                index: 0,
            },
            origin: trip.origin,
            destination: trip.destination,
            ready_time: trip.ready_time,
            due_time: trip.due_time,
            assigned_vehicle: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{Location, TripId};
    use std::collections::VecDeque;

    #[test]
    fn direct_splitter_yields_one_leg_with_the_trip_window() {
        let trip = Trip {
            id: TripId(3),
            origin: Location(10),
            destination: Location(20),
            release_time: 100,
            ready_time: 150,
            due_time: 500,
            previous_legs: Vec::new(),
            current_leg: None,
            next_legs: VecDeque::new(),
        };
        let state = StateSnapshot::new(100, Vec::new(), Vec::new(), None);

        let legs = DirectSplitter.split(&trip, &state);
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].id, LegId { trip: TripId(3), index: 0 });
        assert_eq!(legs[0].origin, Location(10));
        assert_eq!(legs[0].destination, Location(20));
        assert_eq!(legs[0].ready_time, 150);
        assert_eq!(legs[0].due_time, 500);
        assert!(legs[0].assigned_vehicle.is_none());
    }
}
