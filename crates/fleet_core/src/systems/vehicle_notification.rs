use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{EntityIndex, Route, Stop};
use crate::error::{FatalError, SimulationError};
use crate::optimization::OptimizationAgent;
use crate::state_machine::{VehicleFsm, VehicleState};

/// The live route may have advanced past parts of the updated plan while the
/// dispatch was running; anything already executed is dropped from it.
fn already_executed(route: &Route, stop: &Stop) -> bool {
    let in_history = route
        .previous_stops
        .iter()
        .any(|p| p.location == stop.location && p.arrival_time == stop.arrival_time);
    let is_current = route
        .current_stop
        .as_ref()
        .map_or(false, |c| c.location == stop.location && c.arrival_time == stop.arrival_time);
    in_history || is_current
}

/// Applies a pending route payload to a live vehicle: merges the current
/// stop's boarding commitments, replaces the not-yet-executed itinerary tail,
/// claims newly assigned legs, and reschedules the affected movement events.
pub fn vehicle_notification_system(
    mut clock: ResMut<SimulationClock>,
    mut agent: ResMut<OptimizationAgent>,
    mut fatal: ResMut<FatalError>,
    index: Res<EntityIndex>,
    mut vehicles: Query<(&mut Route, &VehicleFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::VehicleNotification {
        return;
    }
    let Some(EventSubject::Vehicle(vehicle_id)) = event.0.subject else {
        fatal.set(SimulationError::MissingUpdate("vehicle subject on notification"));
        return;
    };
    let Some(update) = agent.take_route_update(vehicle_id) else {
        fatal.set(SimulationError::MissingUpdate("route update payload"));
        return;
    };
    let Some((mut route, fsm)) = index
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

    // Merge the updated current stop into the live one (same location only):
    // new boarding commitments and the replanned departure. The dispatcher
    // only ever saw this stop unfrozen, so adopting its departure is safe;
    // it is still clamped to the arrival/min-departure floor and to now.
    let now = clock.now();
    if let (Some(live), Some(updated)) = (route.current_stop.as_mut(), update.current_stop.as_ref())
    {
        if live.location == updated.location {
            for trip in &updated.boarding {
                if !live.boarding.contains(trip) {
                    live.boarding.push(*trip);
                }
            }
            if updated.departure_time != live.departure_time {
                let floor = live
                    .min_departure_time
                    .unwrap_or(0)
                    .max(live.arrival_time)
                    .max(now);
                live.departure_time = updated.departure_time.max(floor);
            }
        }
    }

    // Replace the upcoming itinerary, dropping stops the vehicle already
    // executed while the dispatch was running.
    route.next_stops = update
        .next_stops
        .iter()
        .filter(|stop| !already_executed(&route, stop))
        .cloned()
        .collect();

    for leg in update.assigned_legs {
        if !route.onboard_legs.contains(&leg) && !route.alighted_legs.contains(&leg) {
            route.assign(leg);
        }
    }

    // The plan changed under the scheduled movement events; rebuild them.
    match fsm.0.current() {
        VehicleState::Boarding => {
            clock.cancel(EventKind::VehicleDeparture, None, Some(EventSubject::Vehicle(vehicle_id)));
            if route.has_next_stops() {
                let departure = route
                    .current_stop
                    .as_ref()
                    .map_or(now, |s| s.departure_time.max(now));
                clock.schedule_at(departure, EventKind::VehicleDeparture, Some(EventSubject::Vehicle(vehicle_id)));
            }
        }
        VehicleState::Enroute => {
            if let Some(arrival) = route.next_stops.front().map(|s| s.arrival_time.max(now)) {
                clock.cancel(EventKind::VehicleArrival, None, Some(EventSubject::Vehicle(vehicle_id)));
                clock.schedule_at(arrival, EventKind::VehicleArrival, Some(EventSubject::Vehicle(vehicle_id)));
            }
        }
        VehicleState::Release => {
            // An idle vehicle with new work wakes up.
            if route.has_next_stops() {
                clock.schedule_at(now, EventKind::VehicleBoarding, Some(EventSubject::Vehicle(vehicle_id)));
            }
        }
        VehicleState::Alighting | VehicleState::Complete => {}
    }
    debug!(
        vehicle = vehicle_id.0,
        next_stops = route.next_stops.len(),
        "route updated"
    );
}
