use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Route};
use crate::error::{FatalError, SimulationError};
use crate::state_machine::VehicleFsm;

/// Arrives at the next stop: it becomes the current stop, onboard passengers
/// destined here alight, and the boarding phase follows at the same instant
/// (alighting first, by priority).
pub fn vehicle_arrival_system(
    mut clock: ResMut<SimulationClock>,
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    mut vehicles: Query<(&mut Route, &mut VehicleFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::VehicleArrival {
        return;
    }
    let Some(EventSubject::Vehicle(vehicle_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("vehicle subject on arrival"));
        return;
    };
    let Some((mut route, mut fsm)) = index
        .vehicles
        .get(&vehicle_id)
        .and_then(|entity| vehicles.get_mut(*entity).ok())
    else {
        fatal.set(SimulationError::MissingEntity {
            kind: "vehicle",
            id: format!("{}", vehicle_id.0),
        });
        return;
    };

    let ctx = route.clone();
    if let Err(err) = fsm.0.advance(EventKind::VehicleArrival, &ctx) {
        fatal.set(err);
        return;
    }

    let Some(stop) = route.next_stops.pop_front() else {
        fatal.set(SimulationError::MissingUpdate("arrival stop"));
        return;
    };

    let now = clock.now();
    for trip_id in &stop.alighting {
        let onboard = route
            .onboard_legs
            .iter()
            .any(|leg| leg.trip == *trip_id);
        if onboard {
            clock.schedule_at(now, EventKind::PassengerAlight, Some(EventSubject::Trip(*trip_id)));
        }
    }
    debug!(vehicle = vehicle_id.0, location = stop.location.0, "vehicle arrived");
    route.current_stop = Some(stop);

    clock.schedule_at(now, EventKind::VehicleBoarding, Some(EventSubject::Vehicle(vehicle_id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::{Schedule, World};
    use std::collections::VecDeque;

    use crate::clock::Event;
    use crate::ecs::{LegId, Location, Stop, TripId, VehicleId};
    use crate::state_machine::VehicleState;

    #[test]
    fn arrival_promotes_the_stop_and_alights_onboard_passengers() {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(FatalError::default());

        let leg_id = LegId { trip: TripId(7), index: 0 };
        let mut stop = Stop::new(Location(2), 300, 320);
        stop.alighting.push(TripId(7));
        stop.alighting.push(TripId(8)); // not onboard: no alight event
        let route = Route {
            next_stops: VecDeque::from([stop]),
            onboard_legs: vec![leg_id],
            load: 1,
            ..Route::default()
        };
        let entity = world
            .spawn((route, VehicleFsm::at(VehicleState::Enroute)))
            .id();
        let mut index = EntityIndex::default();
        index.vehicles.insert(VehicleId(3), entity);
        world.insert_resource(index);

        world.resource_mut::<SimulationClock>().advance_to(300);
        world.insert_resource(CurrentEvent(Event {
            time: 300,
            kind: EventKind::VehicleArrival,
            priority: EventKind::VehicleArrival.default_priority(),
            subject: Some(EventSubject::Vehicle(VehicleId(3))),
            sequence: 0,
        }));
        let mut schedule = Schedule::default();
        schedule.add_systems(vehicle_arrival_system);
        schedule.run(&mut world);

        let (route, fsm) = world.query::<(&Route, &VehicleFsm)>().single(&world);
        assert_eq!(fsm.0.current(), VehicleState::Alighting);
        assert_eq!(
            route.current_stop.as_ref().map(|s| s.location),
            Some(Location(2))
        );
        assert!(route.next_stops.is_empty());

        let clock = world.resource::<SimulationClock>();
        assert!(clock.is_in_queue(EventKind::PassengerAlight, Some(300), Some(EventSubject::Trip(TripId(7)))));
        assert!(!clock.is_in_queue(EventKind::PassengerAlight, None, Some(EventSubject::Trip(TripId(8)))));
        assert!(clock.is_in_queue(EventKind::VehicleBoarding, Some(300), Some(EventSubject::Vehicle(VehicleId(3)))));

        // Alighting outranks the boarding phase at the same instant.
        let mut clock = world.resource_mut::<SimulationClock>();
        let first = clock.pop_next().expect("event");
        assert_eq!(first.kind, EventKind::PassengerAlight);
    }
}
