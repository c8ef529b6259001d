use bevy_ecs::prelude::{Commands, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Route, Stop};
use crate::error::{FatalError, SimulationError};
use crate::scenario::PendingVehicles;
use crate::state_machine::VehicleFsm;

/// Releases a pending vehicle: spawns it with its initial itinerary (first
/// stop current, rest upcoming). A vehicle with planned commitments starts
/// boarding immediately; an idle one waits in release for a notification.
pub fn vehicle_release_system(
    mut commands: Commands,
    mut clock: ResMut<SimulationClock>,
    mut pending: ResMut<PendingVehicles>,
    mut index: ResMut<EntityIndex>,
    mut fatal: ResMut<FatalError>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::VehicleRelease {
        return;
    }
    let Some(EventSubject::Vehicle(vehicle_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("vehicle subject on release"));
        return;
    };
    let Some(plan) = pending.take(vehicle_id) else {
        fatal.set(SimulationError::MissingEntity {
            kind: "pending vehicle",
            id: format!("{}", vehicle_id.0),
        });
        return;
    };

    let mut stops: std::collections::VecDeque<Stop> = plan.stops.into();
    let route = Route {
        current_stop: stops.pop_front(),
        next_stops: stops,
        ..Route::default()
    };
    let has_commitments = route.has_next_stops();

    debug!(vehicle = vehicle_id.0, has_commitments, "vehicle released");
    let entity = commands.spawn((plan.vehicle, route, VehicleFsm::new())).id();
    index.vehicles.insert(vehicle_id, entity);

    if has_commitments {
        let now = clock.now();
        clock.schedule_at(now, EventKind::VehicleBoarding, Some(EventSubject::Vehicle(vehicle_id)));
    }
}
