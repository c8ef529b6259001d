use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject};
use crate::ecs::{EntityIndex, Route, Trip};
use crate::error::{FatalError, SimulationError};
use crate::state_machine::PassengerFsm;

/// Boards a ready passenger onto its assigned vehicle: the leg moves from
/// the route's assigned set to onboard, and the stop's boarding list drops
/// the trip.
pub fn passenger_board_system(
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    mut trips: Query<(&Trip, &mut PassengerFsm)>,
    mut routes: Query<&mut Route>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::PassengerBoard {
        return;
    }
    let Some(EventSubject::Trip(trip_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("trip subject on board"));
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

    let Some(leg) = trip.current_leg.as_ref() else {
        fatal.set(SimulationError::MissingUpdate("current leg on board"));
        return;
    };
    let Some(vehicle_id) = leg.assigned_vehicle else {
        fatal.set(SimulationError::MissingUpdate("assigned vehicle on board"));
        return;
    };
    let Some(mut route) = index
        .vehicles
        .get(&vehicle_id)
        .and_then(|entity| routes.get_mut(*entity).ok())
    else {
        fatal.set(SimulationError::MissingEntity {
            kind: "vehicle",
            id: format!("{}", vehicle_id.0),
        });
        return;
    };

    if !route.board(leg.id) {
        fatal.set(SimulationError::MissingUpdate("assigned leg on route"));
        return;
    }
    if let Some(stop) = route.current_stop.as_mut() {
        stop.boarding.retain(|t| *t != trip_id);
    }

    if let Err(err) = fsm.0.advance(EventKind::PassengerBoard, trip) {
        fatal.set(err);
        return;
    }
    debug!(trip = trip_id.0, vehicle = vehicle_id.0, "passenger boarded");
}
