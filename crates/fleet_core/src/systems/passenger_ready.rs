use bevy_ecs::prelude::{Query, Res, ResMut};

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Route, Trip};
use crate::error::{FatalError, SimulationError};
use crate::state_machine::{PassengerFsm, VehicleFsm, VehicleState};

/// Marks a trip ready to board. If its vehicle is already boarding at the
/// leg's origin, the passenger boards immediately; otherwise the boarding
/// event comes from the vehicle side when it opens its doors there.
pub fn passenger_ready_system(
    mut clock: ResMut<SimulationClock>,
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    mut trips: Query<(&Trip, &mut PassengerFsm)>,
    vehicles: Query<(&Route, &VehicleFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::PassengerReady {
        return;
    }
    let Some(EventSubject::Trip(trip_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("trip subject on ready"));
        return;
    };
    let Some((trip, mut fsm)) = index
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

    if let Err(err) = fsm.0.advance(EventKind::PassengerReady, trip) {
        fatal.set(err);
        return;
    }

    // Vehicle already boarding at the origin with us on its list?
    let boarding_here = trip
        .current_leg
        .as_ref()
        .and_then(|leg| {
            let vehicle_id = leg.assigned_vehicle?;
            let entity = index.vehicles.get(&vehicle_id)?;
            let (route, vehicle_fsm) = vehicles.get(*entity).ok()?;
            let stop = route.current_stop.as_ref()?;
            Some(
                vehicle_fsm.0.current() == VehicleState::Boarding
                    && stop.location == leg.origin
                    && stop.boarding.contains(&trip_id),
            )
        })
        .unwrap_or(false);

    if boarding_here {
        let now = clock.now();
        clock.schedule_at(now, EventKind::PassengerBoard, Some(EventSubject::Trip(trip_id)));
    }
}
