//! Point-in-time optimization snapshots and the freeze horizon.
//!
//! A dispatch call never sees live entities: the coordinator collects
//! plain-struct copies of every relevant trip and vehicle into a
//! [`StateSnapshot`], hands the snapshot to the dispatcher by value, and
//! merges results back through events on the simulation thread.
//!
//! Freezing advances the snapshot clock by the freeze interval and reclassifies
//! stops that will have executed by then, so the dispatcher cannot alter
//! commitments that are already in motion. [`unfreeze`] reverses the
//! reclassification exactly.

use crate::ecs::{Route, Trip, TripId, Vehicle, VehicleId};
use crate::state_machine::{PassengerState, VehicleState};

#[derive(Debug, Clone)]
pub struct TripSnapshot {
    pub trip: Trip,
    pub state: PassengerState,
}

#[derive(Debug, Clone)]
pub struct VehicleSnapshot {
    pub vehicle: Vehicle,
    pub route: Route,
    pub state: VehicleState,
}

/// Reversal log for one vehicle's freeze reclassification.
#[derive(Debug, Clone, Copy, Default)]
struct FreezeLog {
    /// The pre-freeze current stop departed and moved to previous_stops.
    current_departed: bool,
    /// Number of next_stops moved to previous_stops.
    moved: usize,
    /// A next stop was promoted to current_stop (arrived, not yet departed).
    promoted: bool,
}

#[derive(Debug, Clone)]
struct SnapshotFreeze {
    delta: u64,
    /// Index-aligned with `StateSnapshot::vehicles`.
    logs: Vec<FreezeLog>,
}

/// An isolated copy of the environment subset relevant to one dispatch call.
/// Created per Optimize cycle, discarded after merge.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub time: u64,
    pub trips: Vec<TripSnapshot>,
    pub vehicles: Vec<VehicleSnapshot>,
    /// Partition subset this snapshot was scoped to, if any.
    pub subset: Option<usize>,
    freeze: Option<SnapshotFreeze>,
}

impl StateSnapshot {
    pub fn new(
        time: u64,
        trips: Vec<TripSnapshot>,
        vehicles: Vec<VehicleSnapshot>,
        subset: Option<usize>,
    ) -> Self {
        Self {
            time,
            trips,
            vehicles,
            subset,
            freeze: None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_some()
    }

    pub fn trip(&self, id: TripId) -> Option<&TripSnapshot> {
        self.trips.iter().find(|t| t.trip.id == id)
    }

    pub fn trip_mut(&mut self, id: TripId) -> Option<&mut TripSnapshot> {
        self.trips.iter_mut().find(|t| t.trip.id == id)
    }

    pub fn vehicle(&self, id: VehicleId) -> Option<&VehicleSnapshot> {
        self.vehicles.iter().find(|v| v.vehicle.id == id)
    }

    pub fn vehicle_mut(&mut self, id: VehicleId) -> Option<&mut VehicleSnapshot> {
        self.vehicles.iter_mut().find(|v| v.vehicle.id == id)
    }

    /// Trips whose current leg is still waiting for a vehicle.
    pub fn unassigned_trips(&self) -> impl Iterator<Item = &TripSnapshot> {
        self.trips.iter().filter(|t| {
            t.state == PassengerState::Release
                && t.trip
                    .current_leg
                    .as_ref()
                    .map_or(false, |leg| leg.assigned_vehicle.is_none())
        })
    }
}

/// Advance the snapshot clock by `delta` and reclassify every stop that will
/// have executed by then out of `next_stops`.
///
/// Calling freeze on an already-frozen snapshot is a coordinator bug; the
/// second freeze is ignored.
pub fn freeze(snapshot: &mut StateSnapshot, delta: u64) {
    if snapshot.freeze.is_some() {
        return;
    }
    let horizon = snapshot.time + delta;
    let mut logs = Vec::with_capacity(snapshot.vehicles.len());

    for vehicle in &mut snapshot.vehicles {
        let route = &mut vehicle.route;
        let mut log = FreezeLog::default();

        // A current stop that will have departed moves to history.
        if route
            .current_stop
            .as_ref()
            .map_or(false, |s| s.departure_time <= horizon)
        {
            if let Some(stop) = route.current_stop.take() {
                route.previous_stops.push(stop);
                log.current_departed = true;
            }
        }

        // Upcoming stops fully executed within the horizon.
        while route
            .next_stops
            .front()
            .map_or(false, |s| s.departure_time <= horizon)
        {
            if let Some(stop) = route.next_stops.pop_front() {
                route.previous_stops.push(stop);
                log.moved += 1;
            }
        }

        // A stop the vehicle will have reached but not yet left becomes the
        // current stop, provided the slot is free.
        if route.current_stop.is_none()
            && route
                .next_stops
                .front()
                .map_or(false, |s| s.arrival_time <= horizon)
        {
            route.current_stop = route.next_stops.pop_front();
            log.promoted = true;
        }

        logs.push(log);
    }

    snapshot.time = horizon;
    snapshot.freeze = Some(SnapshotFreeze { delta, logs });
}

/// Exact inverse of [`freeze`]: restores each route's current/next/previous
/// partition and the snapshot clock. No-op on an unfrozen snapshot.
pub fn unfreeze(snapshot: &mut StateSnapshot) {
    let Some(SnapshotFreeze { delta, logs }) = snapshot.freeze.take() else {
        return;
    };

    for (vehicle, log) in snapshot.vehicles.iter_mut().zip(logs) {
        let route = &mut vehicle.route;

        if log.promoted {
            if let Some(stop) = route.current_stop.take() {
                route.next_stops.push_front(stop);
            }
        }
        for _ in 0..log.moved {
            if let Some(stop) = route.previous_stops.pop() {
                route.next_stops.push_front(stop);
            }
        }
        if log.current_departed {
            route.current_stop = route.previous_stops.pop();
        }
    }

    snapshot.time -= delta;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{Location, Stop};
    use std::collections::VecDeque;

    fn vehicle_snapshot(current: Option<Stop>, next: Vec<Stop>) -> VehicleSnapshot {
        VehicleSnapshot {
            vehicle: Vehicle {
                id: VehicleId(1),
                release_time: 0,
                start_time: 0,
                end_time: 10_000,
                start_location: Location(0),
                capacity: 4,
            },
            route: Route {
                current_stop: current,
                next_stops: VecDeque::from(next),
                previous_stops: Vec::new(),
                assigned_legs: Vec::new(),
                onboard_legs: Vec::new(),
                alighted_legs: Vec::new(),
                load: 0,
            },
            state: VehicleState::Boarding,
        }
    }

    fn stop(location: u64, arrival: u64, departure: u64) -> Stop {
        Stop::new(Location(location), arrival, departure)
    }

    #[test]
    fn freeze_reclassifies_stops_within_the_horizon() {
        let mut snapshot = StateSnapshot::new(
            100,
            Vec::new(),
            vec![vehicle_snapshot(
                Some(stop(1, 80, 120)),
                vec![stop(2, 140, 160), stop(3, 180, 220), stop(4, 300, 320)],
            )],
            None,
        );

        freeze(&mut snapshot, 100); // horizon = 200

        assert_eq!(snapshot.time, 200);
        let route = &snapshot.vehicles[0].route;
        // Departures at 120 and 160 executed; stop 3 arrived (180) but departs
        // later (220), so it is the current stop; stop 4 is untouched.
        assert_eq!(route.previous_stops.len(), 2);
        assert_eq!(
            route.current_stop.as_ref().map(|s| s.location),
            Some(Location(3))
        );
        assert_eq!(route.next_stops.len(), 1);
        assert_eq!(route.next_stops[0].location, Location(4));
    }

    #[test]
    fn unfreeze_restores_the_route_exactly() {
        let original = StateSnapshot::new(
            100,
            Vec::new(),
            vec![
                vehicle_snapshot(
                    Some(stop(1, 80, 120)),
                    vec![stop(2, 140, 160), stop(3, 180, 220), stop(4, 300, 320)],
                ),
                vehicle_snapshot(None, vec![stop(7, 110, 130), stop(8, 500, 520)]),
                vehicle_snapshot(Some(stop(9, 90, 600)), vec![]),
            ],
            None,
        );

        let mut snapshot = original.clone();
        freeze(&mut snapshot, 100);
        unfreeze(&mut snapshot);

        assert_eq!(snapshot.time, original.time);
        for (restored, reference) in snapshot.vehicles.iter().zip(&original.vehicles) {
            assert_eq!(restored.route, reference.route, "round-trip must be exact");
        }
        assert!(!snapshot.is_frozen());
    }

    #[test]
    fn freeze_leaves_far_future_commitments_alone() {
        let mut snapshot = StateSnapshot::new(
            0,
            Vec::new(),
            vec![vehicle_snapshot(None, vec![stop(2, 900, 950)])],
            None,
        );
        freeze(&mut snapshot, 60);
        let route = &snapshot.vehicles[0].route;
        assert!(route.previous_stops.is_empty());
        assert!(route.current_stop.is_none());
        assert_eq!(route.next_stops.len(), 1);
    }

    #[test]
    fn unfreeze_without_freeze_is_a_no_op() {
        let mut snapshot = StateSnapshot::new(42, Vec::new(), Vec::new(), None);
        unfreeze(&mut snapshot);
        assert_eq!(snapshot.time, 42);
    }
}
