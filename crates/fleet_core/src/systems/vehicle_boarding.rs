use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Route, Trip, Vehicle};
use crate::error::{FatalError, SimulationError};
use crate::state_machine::{PassengerFsm, PassengerState, VehicleFsm, VehicleState};

/// Opens the doors at the current stop. Passengers already ready at this
/// stop board now; the departure is scheduled at the stop's departure time
/// (never in the past). A route with nothing left transitions to complete.
pub fn vehicle_boarding_system(
    mut clock: ResMut<SimulationClock>,
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    mut vehicles: Query<(&Vehicle, &Route, &mut VehicleFsm)>,
    trips: Query<(&Trip, &PassengerFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::VehicleBoarding {
        return;
    }
    let Some(EventSubject::Vehicle(vehicle_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("vehicle subject on boarding"));
        return;
    };
    let Some((_, route, mut fsm)) = index
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

    let state = match fsm.0.advance(EventKind::VehicleBoarding, route) {
        Ok(state) => state,
        Err(err) => {
            fatal.set(err);
            return;
        }
    };
    if state == VehicleState::Complete {
        debug!(vehicle = vehicle_id.0, "route complete");
        return;
    }

    let now = clock.now();

    // Passengers already waiting at this stop board immediately.
    if let Some(stop) = route.current_stop.as_ref() {
        for trip_id in &stop.boarding {
            let ready = index
                .trips
                .get(trip_id)
                .and_then(|entity| trips.get(*entity).ok())
                .map_or(false, |(_, fsm)| fsm.0.current() == PassengerState::Ready);
            if ready {
                clock.schedule_at(now, EventKind::PassengerBoard, Some(EventSubject::Trip(*trip_id)));
            }
        }
    }

    let departure = route
        .current_stop
        .as_ref()
        .map_or(now, |s| s.departure_time.max(now));
    clock.schedule_at(departure, EventKind::VehicleDeparture, Some(EventSubject::Vehicle(vehicle_id)));
}
