use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Route, Trip};
use crate::error::{FatalError, SimulationError};
use crate::optimization::{schedule_optimize, OptimizationConfig};
use crate::partition::PartitionResource;
use crate::state_machine::{PassengerFsm, PassengerState};

/// Alights a passenger at its leg's destination. Connections loop the trip
/// back to release: the next leg is promoted to current and a new
/// optimization cycle is requested for it.
pub fn passenger_alight_system(
    mut clock: ResMut<SimulationClock>,
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    config: Res<OptimizationConfig>,
    partition: Option<Res<PartitionResource>>,
    mut trips: Query<(&mut Trip, &mut PassengerFsm)>,
    mut routes: Query<&mut Route>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::PassengerAlight {
        return;
    }
    let Some(EventSubject::Trip(trip_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("trip subject on alight"));
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

    let Some(leg) = trip.current_leg.clone() else {
        fatal.set(SimulationError::MissingUpdate("current leg on alight"));
        return;
    };
    let Some(vehicle_id) = leg.assigned_vehicle else {
        fatal.set(SimulationError::MissingUpdate("assigned vehicle on alight"));
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
    if !route.alight(leg.id) {
        fatal.set(SimulationError::MissingUpdate("onboard leg on route"));
        return;
    }

    // The connection guard inspects next_legs, so advance before promoting.
    let ctx = trip.clone();
    let next_state = match fsm.0.advance(EventKind::PassengerAlight, &ctx) {
        Ok(state) => state,
        Err(err) => {
            fatal.set(err);
            return;
        }
    };

    if let Some(finished) = trip.current_leg.take() {
        trip.previous_legs.push(finished);
    }

    match next_state {
        PassengerState::Release => {
            // Connection: promote the next leg and ask for a new assignment.
            trip.current_leg = trip.next_legs.pop_front();
            let subject = match (&partition, trip.current_leg.as_ref()) {
                (Some(partition), Some(next)) => Some(EventSubject::Subset(
                    partition.0.subset_of_leg(next) as u32,
                )),
                _ => None,
            };
            debug!(trip = trip_id.0, "connection: trip re-released");
            let now = clock.now();
            schedule_optimize(&mut clock, &config, now, subject);
        }
        PassengerState::Complete => {
            debug!(trip = trip_id.0, "trip completed");
        }
        other => {
            fatal.set(SimulationError::InvalidTransition {
                state: format!("{other:?}"),
                trigger: EventKind::PassengerAlight,
            });
        }
    }
}
