use bevy_ecs::prelude::{Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::dispatch::{RouteUpdate, TripUpdate};
use crate::error::{FatalError, SimulationError};
use crate::optimization::OptimizationAgent;
use crate::partition::PartitionResource;

/// Turns a completed dispatch result into merge events: one assignment per
/// modified trip, one notification per modified vehicle, then the idle event
/// that closes the cycle. Under a partition, a result touching an entity
/// outside its own subset aborts the run before anything merges.
pub fn environment_update_system(
    mut clock: ResMut<SimulationClock>,
    mut agent: ResMut<OptimizationAgent>,
    mut fatal: ResMut<FatalError>,
    partition: Option<Res<PartitionResource>>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::EnvironmentUpdate {
        return;
    }
    let idx = match event.0.subject {
        Some(EventSubject::Subset(s)) => s as usize,
        _ => 0,
    };
    if let Err(err) = agent.machine_mut(idx).advance(EventKind::EnvironmentUpdate, &()) {
        fatal.set(err);
        return;
    }
    let Some(result) = agent.take_result(idx) else {
        fatal.set(SimulationError::MissingUpdate("optimization result"));
        return;
    };

    let now = clock.now();
    let subject = Some(EventSubject::Subset(idx as u32));

    // Ownership check before a single merge event is scheduled.
    if let (Some(partition), Some(subset)) = (&partition, result.state.subset) {
        for trip_id in &result.modified_trips {
            let owner = result
                .state
                .trip(*trip_id)
                .and_then(|t| t.trip.current_leg.as_ref())
                .map(|leg| partition.0.subset_of_leg(leg));
            if let Some(owner) = owner {
                if owner != subset {
                    fatal.set(SimulationError::PartitionOverlap {
                        kind: "trip",
                        id: format!("{}", trip_id.0),
                        subset,
                        owner,
                    });
                    return;
                }
            }
        }
        for vehicle_id in &result.modified_vehicles {
            let owner = result
                .state
                .vehicle(*vehicle_id)
                .map(|v| partition.0.subset_of_vehicle(&v.vehicle));
            if let Some(owner) = owner {
                if owner != subset {
                    fatal.set(SimulationError::PartitionOverlap {
                        kind: "vehicle",
                        id: format!("{}", vehicle_id.0),
                        subset,
                        owner,
                    });
                    return;
                }
            }
        }
    }

    for trip_id in &result.modified_trips {
        let Some(leg) = result
            .state
            .trip(*trip_id)
            .and_then(|t| t.trip.current_leg.clone())
        else {
            fatal.set(SimulationError::MissingUpdate("modified trip in result"));
            return;
        };
        agent.stash_trip_update(TripUpdate {
            trip: *trip_id,
            current_leg: leg,
        });
        clock.schedule_at(now, EventKind::PassengerAssignment, Some(EventSubject::Trip(*trip_id)));
    }

    for vehicle_id in &result.modified_vehicles {
        let Some(snapshot) = result.state.vehicle(*vehicle_id) else {
            fatal.set(SimulationError::MissingUpdate("modified vehicle in result"));
            return;
        };
        agent.stash_route_update(RouteUpdate {
            vehicle: *vehicle_id,
            current_stop: snapshot.route.current_stop.clone(),
            next_stops: snapshot.route.next_stops.clone(),
            assigned_legs: snapshot.route.assigned_legs.clone(),
        });
        clock.schedule_at(now, EventKind::VehicleNotification, Some(EventSubject::Vehicle(*vehicle_id)));
    }

    debug!(
        subset = idx,
        trips = result.modified_trips.len(),
        vehicles = result.modified_vehicles.len(),
        "merging optimization result"
    );
    clock.schedule_at(now, EventKind::EnvironmentIdle, subject);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::{Schedule, World};
    use std::collections::VecDeque;

    use crate::clock::Event;
    use crate::dispatch::OptimizationResult;
    use crate::ecs::{Leg, LegId, Location, Route, Trip, TripId, Vehicle, VehicleId};
    use crate::partition::ModuloPartition;
    use crate::snapshot::{StateSnapshot, TripSnapshot, VehicleSnapshot};
    use crate::state_machine::{OptimizationState, PassengerState, VehicleState};

    fn fire(world: &mut World, time: u64, subset: u32) {
        world.resource_mut::<SimulationClock>().advance_to(time);
        world.insert_resource(CurrentEvent(Event {
            time,
            kind: EventKind::EnvironmentUpdate,
            priority: EventKind::EnvironmentUpdate.default_priority(),
            subject: Some(EventSubject::Subset(subset)),
            sequence: 0,
        }));
    }

    fn base_world() -> World {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(FatalError::default());
        let mut agent = OptimizationAgent::default();
        agent.ensure_subsets(1);
        agent
            .machine_mut(0)
            .advance(EventKind::Optimize, &())
            .expect("optimize");
        world.insert_resource(agent);
        world
    }

    fn assigned_trip_snapshot(trip: u32, vehicle: u32) -> TripSnapshot {
        TripSnapshot {
            trip: Trip {
                id: TripId(trip),
                origin: Location(1),
                destination: Location(2),
                release_time: 0,
                ready_time: 0,
                due_time: 500,
                previous_legs: Vec::new(),
                current_leg: Some(Leg {
                    id: LegId { trip: TripId(trip), index: 0 },
                    origin: Location(1),
                    destination: Location(2),
                    ready_time: 0,
                    due_time: 500,
                    assigned_vehicle: Some(VehicleId(vehicle)),
                }),
                next_legs: VecDeque::new(),
            },
            state: PassengerState::Release,
        }
    }

    fn vehicle_snapshot(id: u32) -> VehicleSnapshot {
        VehicleSnapshot {
            vehicle: Vehicle {
                id: VehicleId(id),
                release_time: 0,
                start_time: 0,
                end_time: 100_000,
                start_location: Location(1),
                capacity: 4,
            },
            route: Route::default(),
            state: VehicleState::Release,
        }
    }

    #[test]
    fn update_schedules_merge_events_and_closes_with_idle() {
        let mut world = base_world();
        let state = StateSnapshot::new(
            100,
            vec![assigned_trip_snapshot(7, 3)],
            vec![vehicle_snapshot(3)],
            None,
        );
        world.resource_mut::<OptimizationAgent>().store_result(
            0,
            OptimizationResult {
                state,
                modified_trips: vec![TripId(7)],
                modified_vehicles: vec![VehicleId(3)],
            },
        );

        fire(&mut world, 100, 0);
        let mut schedule = Schedule::default();
        schedule.add_systems(environment_update_system);
        schedule.run(&mut world);

        let clock = world.resource::<SimulationClock>();
        assert!(clock.is_in_queue(EventKind::PassengerAssignment, Some(100), Some(EventSubject::Trip(TripId(7)))));
        assert!(clock.is_in_queue(EventKind::VehicleNotification, Some(100), Some(EventSubject::Vehicle(VehicleId(3)))));
        assert!(clock.is_in_queue(EventKind::EnvironmentIdle, Some(100), Some(EventSubject::Subset(0))));

        let mut agent = world.resource_mut::<OptimizationAgent>();
        assert_eq!(agent.machine_state(0), OptimizationState::UpdateEnvironment);
        assert!(agent.take_trip_update(TripId(7)).is_some());
        assert!(agent.take_route_update(VehicleId(3)).is_some());
    }

    #[test]
    fn merge_events_outrank_the_idle_event_at_the_same_instant() {
        let mut world = base_world();
        let state = StateSnapshot::new(100, vec![assigned_trip_snapshot(7, 3)], vec![], None);
        world.resource_mut::<OptimizationAgent>().store_result(
            0,
            OptimizationResult {
                state,
                modified_trips: vec![TripId(7)],
                modified_vehicles: Vec::new(),
            },
        );

        fire(&mut world, 100, 0);
        let mut schedule = Schedule::default();
        schedule.add_systems(environment_update_system);
        schedule.run(&mut world);

        let mut clock = world.resource_mut::<SimulationClock>();
        assert_eq!(clock.pop_next().map(|e| e.kind), Some(EventKind::PassengerAssignment));
        assert_eq!(clock.pop_next().map(|e| e.kind), Some(EventKind::EnvironmentIdle));
    }

    #[test]
    fn cross_subset_modification_is_fatal_before_any_merge() {
        let mut world = base_world();
        world.insert_resource(PartitionResource::new(ModuloPartition::new(2)));

        // Subset 0 result claims vehicle 3 (3 % 2 == 1: owned by subset 1).
        let state = StateSnapshot::new(100, Vec::new(), vec![vehicle_snapshot(3)], Some(0));
        world.resource_mut::<OptimizationAgent>().store_result(
            0,
            OptimizationResult {
                state,
                modified_trips: Vec::new(),
                modified_vehicles: vec![VehicleId(3)],
            },
        );

        fire(&mut world, 100, 0);
        let mut schedule = Schedule::default();
        schedule.add_systems(environment_update_system);
        schedule.run(&mut world);

        let err = world.resource_mut::<FatalError>().take().expect("fatal");
        assert!(matches!(
            err,
            SimulationError::PartitionOverlap { subset: 0, owner: 1, .. }
        ));
        assert!(
            !world
                .resource::<SimulationClock>()
                .is_in_queue(EventKind::VehicleNotification, None, None),
            "nothing merges after an overlap"
        );
    }

    #[test]
    fn missing_result_is_fatal() {
        let mut world = base_world();
        fire(&mut world, 100, 0);
        let mut schedule = Schedule::default();
        schedule.add_systems(environment_update_system);
        schedule.run(&mut world);
        assert!(world.resource::<FatalError>().is_set());
    }
}
