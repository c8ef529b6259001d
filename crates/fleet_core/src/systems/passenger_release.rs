use bevy_ecs::prelude::{Commands, Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::dispatch::SplitterResource;
use crate::ecs::{EntityIndex, Trip, Vehicle, Route};
use crate::error::{FatalError, SimulationError};
use crate::optimization::{schedule_optimize, OptimizationConfig};
use crate::partition::PartitionResource;
use crate::scenario::PendingTrips;
use crate::snapshot::{StateSnapshot, VehicleSnapshot};
use crate::state_machine::{PassengerFsm, VehicleFsm};

/// Releases a pending trip into the simulation: splits it into legs, spawns
/// the entity with a fresh passenger machine, and requests an optimization
/// cycle for the leg's subset.
pub fn passenger_release_system(
    mut commands: Commands,
    mut clock: ResMut<SimulationClock>,
    mut pending: ResMut<PendingTrips>,
    mut index: ResMut<EntityIndex>,
    mut fatal: ResMut<FatalError>,
    splitter: Res<SplitterResource>,
    config: Res<OptimizationConfig>,
    partition: Option<Res<PartitionResource>>,
    vehicles: Query<(&Vehicle, &Route, &VehicleFsm)>,
    trips: Query<(&Trip, &PassengerFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::PassengerRelease {
        return;
    }
    let Some(EventSubject::Trip(trip_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("trip subject on release"));
        return;
    };
    let Some(request) = pending.take(trip_id) else {
        fatal.set(SimulationError::MissingEntity {
            kind: "pending trip",
            id: format!("{}", trip_id.0),
        });
        return;
    };

    let mut trip = Trip {
        id: request.id,
        origin: request.origin,
        destination: request.destination,
        release_time: request.release_time,
        ready_time: request.ready_time,
        due_time: request.due_time,
        previous_legs: Vec::new(),
        current_leg: None,
        next_legs: Default::default(),
    };

    // The splitter sees the environment as it stands at release time.
    let state = StateSnapshot::new(
        clock.now(),
        trips
            .iter()
            .map(|(t, fsm)| crate::snapshot::TripSnapshot {
                trip: t.clone(),
                state: fsm.0.current(),
            })
            .collect(),
        vehicles
            .iter()
            .map(|(v, r, fsm)| VehicleSnapshot {
                vehicle: v.clone(),
                route: r.clone(),
                state: fsm.0.current(),
            })
            .collect(),
        None,
    );
    let mut legs = splitter.0.split(&trip, &state);
    if legs.is_empty() {
        fatal.set(SimulationError::MissingUpdate("itinerary from splitter"));
        return;
    }
    trip.current_leg = Some(legs.remove(0));
    trip.next_legs = legs.into();

    let subject = match (&partition, trip.current_leg.as_ref()) {
        (Some(partition), Some(leg)) => Some(EventSubject::Subset(
            partition.0.subset_of_leg(leg) as u32,
        )),
        _ => None,
    };

    debug!(trip = trip_id.0, legs = trip.total_leg_count(), "trip released");
    let entity = commands.spawn((trip, PassengerFsm::new())).id();
    index.trips.insert(trip_id, entity);

    let now = clock.now();
    schedule_optimize(&mut clock, &config, now, subject);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::{Schedule, World};

    use crate::clock::Event;
    use crate::dispatch::DirectSplitter;
    use crate::ecs::{Location, TripId};
    use crate::scenario::TripRequest;
    use crate::state_machine::PassengerState;

    fn make_world() -> World {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(PendingTrips::default());
        world.insert_resource(EntityIndex::default());
        world.insert_resource(FatalError::default());
        world.insert_resource(SplitterResource::new(DirectSplitter));
        world.insert_resource(OptimizationConfig::default());
        world
    }

    fn fire(world: &mut World, time: u64, kind: EventKind, subject: Option<EventSubject>) {
        world.resource_mut::<SimulationClock>().advance_to(time);
        world.insert_resource(CurrentEvent(Event {
            time,
            kind,
            priority: kind.default_priority(),
            subject,
            sequence: 0,
        }));
    }

    #[test]
    fn release_spawns_the_trip_and_requests_optimization() {
        let mut world = make_world();
        world.resource_mut::<PendingTrips>().0.push_back(TripRequest {
            id: TripId(5),
            origin: Location(1),
            destination: Location(2),
            release_time: 100,
            ready_time: 150,
            due_time: 500,
        });

        fire(&mut world, 100, EventKind::PassengerRelease, Some(EventSubject::Trip(TripId(5))));
        let mut schedule = Schedule::default();
        schedule.add_systems(passenger_release_system);
        schedule.run(&mut world);

        let (trip, fsm) = world.query::<(&Trip, &PassengerFsm)>().single(&world);
        assert_eq!(trip.id, TripId(5));
        assert_eq!(fsm.0.current(), PassengerState::Release);
        let leg = trip.current_leg.as_ref().expect("split produced a leg");
        assert_eq!(leg.origin, Location(1));
        assert!(leg.assigned_vehicle.is_none());

        assert!(world.resource::<PendingTrips>().0.is_empty());
        assert!(world
            .resource::<EntityIndex>()
            .trips
            .contains_key(&TripId(5)));
        assert!(world
            .resource::<SimulationClock>()
            .is_in_queue(EventKind::Optimize, Some(100), None));
        assert!(!world.resource::<FatalError>().is_set());
    }

    #[test]
    fn release_without_a_pending_entry_is_fatal() {
        let mut world = make_world();
        fire(&mut world, 0, EventKind::PassengerRelease, Some(EventSubject::Trip(TripId(9))));
        let mut schedule = Schedule::default();
        schedule.add_systems(passenger_release_system);
        schedule.run(&mut world);
        assert!(world.resource::<FatalError>().is_set());
    }
}
