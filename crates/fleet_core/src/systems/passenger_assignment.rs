use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Trip};
use crate::error::{FatalError, SimulationError};
use crate::optimization::OptimizationAgent;
use crate::state_machine::PassengerFsm;

/// Applies a pending assignment payload to a live trip and schedules its
/// ready event at the leg's ready time (or now, if already past).
pub fn passenger_assignment_system(
    mut clock: ResMut<SimulationClock>,
    mut agent: ResMut<OptimizationAgent>,
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    mut trips: Query<(&mut Trip, &mut PassengerFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::PassengerAssignment {
        return;
    }
    let Some(EventSubject::Trip(trip_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("trip subject on assignment"));
        return;
    };
    let Some(update) = agent.take_trip_update(trip_id) else {
        fatal.set(SimulationError::MissingUpdate("trip update payload"));
        return;
    };
    let Some((mut trip, mut fsm)) = index
        .trips
        .get(&trip_id)
        .and_then(|entity| trips.get_mut(*entity).ok())
    else {
        fatal.set(SimulationError::MissingEntity {
            kind: "trip",
            id: format!("{}", trip_id.0),
        });
        return;
    };

    let ready_time = update.current_leg.ready_time;
    trip.current_leg = Some(update.current_leg);

    let ctx = trip.clone();
    if let Err(err) = fsm.0.advance(EventKind::PassengerAssignment, &ctx) {
        fatal.set(err);
        return;
    }

    let at = ready_time.max(clock.now());
    debug!(trip = trip_id.0, ready = at, "trip assigned");
    clock.schedule_at(at, EventKind::PassengerReady, Some(EventSubject::Trip(trip_id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::{Schedule, World};
    use std::collections::VecDeque;

    use crate::clock::Event;
    use crate::dispatch::TripUpdate;
    use crate::ecs::{Leg, LegId, Location, TripId, VehicleId};
    use crate::state_machine::PassengerState;

    fn fire(world: &mut World, time: u64, subject: Option<EventSubject>) {
        world.resource_mut::<SimulationClock>().advance_to(time);
        world.insert_resource(CurrentEvent(Event {
            time,
            kind: EventKind::PassengerAssignment,
            priority: EventKind::PassengerAssignment.default_priority(),
            subject,
            sequence: 0,
        }));
    }

    fn waiting_trip(id: u32) -> Trip {
        Trip {
            id: TripId(id),
            origin: Location(1),
            destination: Location(2),
            release_time: 100,
            ready_time: 150,
            due_time: 500,
            previous_legs: Vec::new(),
            current_leg: Some(Leg {
                id: LegId { trip: TripId(id), index: 0 },
                origin: Location(1),
                destination: Location(2),
                ready_time: 150,
                due_time: 500,
                assigned_vehicle: None,
            }),
            next_legs: VecDeque::new(),
        }
    }

    #[test]
    fn assignment_binds_the_vehicle_and_schedules_ready() {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(OptimizationAgent::default());
        world.insert_resource(FatalError::default());
        let entity = world.spawn((waiting_trip(7), PassengerFsm::new())).id();
        let mut index = EntityIndex::default();
        index.trips.insert(TripId(7), entity);
        world.insert_resource(index);

        let mut assigned_leg = waiting_trip(7).current_leg.take().expect("leg");
        assigned_leg.assigned_vehicle = Some(VehicleId(3));
        world
            .resource_mut::<OptimizationAgent>()
            .stash_trip_update(TripUpdate {
                trip: TripId(7),
                current_leg: assigned_leg,
            });

        fire(&mut world, 120, Some(EventSubject::Trip(TripId(7))));
        let mut schedule = Schedule::default();
        schedule.add_systems(passenger_assignment_system);
        schedule.run(&mut world);

        let (trip, fsm) = world.query::<(&Trip, &PassengerFsm)>().single(&world);
        assert_eq!(fsm.0.current(), PassengerState::Assigned);
        assert_eq!(
            trip.current_leg.as_ref().and_then(|l| l.assigned_vehicle),
            Some(VehicleId(3))
        );

        // Ready fires at the leg's ready time, not at the assignment time.
        assert!(world
            .resource::<SimulationClock>()
            .is_in_queue(EventKind::PassengerReady, Some(150), Some(EventSubject::Trip(TripId(7)))));
        assert!(!world.resource::<FatalError>().is_set());
    }

    #[test]
    fn assignment_without_a_payload_is_fatal() {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(OptimizationAgent::default());
        world.insert_resource(FatalError::default());
        world.insert_resource(EntityIndex::default());

        fire(&mut world, 120, Some(EventSubject::Trip(TripId(7))));
        let mut schedule = Schedule::default();
        schedule.add_systems(passenger_assignment_system);
        schedule.run(&mut world);

        assert!(world.resource::<FatalError>().is_set());
    }
}
