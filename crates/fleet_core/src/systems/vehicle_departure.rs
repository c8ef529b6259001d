use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Route};
use crate::error::{FatalError, SimulationError};
use crate::state_machine::VehicleFsm;

/// Departs the current stop: it moves to history and the arrival at the next
/// stop is scheduled at its planned arrival time.
pub fn vehicle_departure_system(
    mut clock: ResMut<SimulationClock>,
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    mut vehicles: Query<(&mut Route, &mut VehicleFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::VehicleDeparture {
        return;
    }
    let Some(EventSubject::Vehicle(vehicle_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("vehicle subject on departure"));
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

    if !route.has_next_stops() {
        fatal.set(SimulationError::MissingUpdate("next stop on departure"));
        return;
    }

    let ctx = route.clone();
    if let Err(err) = fsm.0.advance(EventKind::VehicleDeparture, &ctx) {
        fatal.set(err);
        return;
    }

    if let Some(stop) = route.current_stop.take() {
        route.previous_stops.push(stop);
    }

    let now = clock.now();
    let arrival = route
        .next_stops
        .front()
        .map_or(now, |s| s.arrival_time.max(now));
    debug!(vehicle = vehicle_id.0, arrival, "vehicle departed");
    clock.schedule_at(arrival, EventKind::VehicleArrival, Some(EventSubject::Vehicle(vehicle_id)));
}
