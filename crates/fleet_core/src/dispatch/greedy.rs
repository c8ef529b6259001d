//! Reference dispatcher: first-fit greedy assignment.
//!
//! Places each waiting leg on the first vehicle that can serve it, preferring
//! vehicles whose planned itinerary already passes the leg's origin and
//! destination, falling back to sending an idle vehicle. Real deployments
//! plug in their own strategy; this one exists so scenarios and tests have a
//! complete cycle to run.

use crate::ecs::{Leg, Stop, TripId, VehicleId};
use crate::optimization::CancellationToken;
use crate::snapshot::{StateSnapshot, VehicleSnapshot};
use crate::state_machine::VehicleState;

use super::algorithm::Dispatcher;
use super::stats::EnvironmentStatistics;
use super::types::OptimizationResult;

/// Travel times are a collaborator concern; the reference dispatcher uses a
/// flat per-leg estimate when it has to invent stops for an idle vehicle.
pub const DEFAULT_LEG_TRAVEL_TIME_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct GreedyDispatcher {
    pub leg_travel_time: u64,
    /// Dwell at an invented destination stop.
    pub dwell_time: u64,
}

impl GreedyDispatcher {
    pub fn new(leg_travel_time: u64) -> Self {
        Self {
            leg_travel_time,
            dwell_time: 0,
        }
    }

    fn has_capacity(vehicle: &VehicleSnapshot) -> bool {
        let committed = vehicle.route.load as usize + vehicle.route.assigned_legs.len();
        committed < vehicle.vehicle.capacity as usize
    }

    /// Try to place the leg on a vehicle already planning to pass its origin
    /// and, later, its destination. Mutates the vehicle snapshot on success.
    fn place_on_itinerary(leg: &Leg, trip: TripId, vehicle: &mut VehicleSnapshot) -> bool {
        if !Self::has_capacity(vehicle) {
            return false;
        }
        let route = &mut vehicle.route;

        // Origin slot: the current stop, or position i in next_stops.
        // Destination must come strictly after the origin slot.
        let origin_at_current = route
            .current_stop
            .as_ref()
            .map_or(false, |s| s.location == leg.origin);
        let origin_next_idx = route
            .next_stops
            .iter()
            .position(|s| s.location == leg.origin);

        let search_from = if origin_at_current {
            0
        } else {
            match origin_next_idx {
                Some(i) => i + 1,
                None => return false,
            }
        };
        let Some(dest_idx) = route
            .next_stops
            .iter()
            .enumerate()
            .skip(search_from)
            .find(|(_, s)| s.location == leg.destination && s.arrival_time <= leg.due_time)
            .map(|(i, _)| i)
        else {
            return false;
        };

        if origin_at_current {
            if let Some(stop) = route.current_stop.as_mut() {
                stop.boarding.push(trip);
                stop.delay_departure(leg.ready_time);
            }
        } else if let Some(i) = origin_next_idx {
            route.next_stops[i].boarding.push(trip);
            route.next_stops[i].delay_departure(leg.ready_time);
        }
        route.next_stops[dest_idx].alighting.push(trip);
        route.assign(leg.id);
        true
    }

    /// Send an idle vehicle: invent origin and destination stops from the
    /// flat travel-time estimate.
    fn place_on_idle(&self, now: u64, leg: &Leg, trip: TripId, vehicle: &mut VehicleSnapshot) -> bool {
        if vehicle.state != VehicleState::Release || vehicle.route.has_next_stops() {
            return false;
        }
        if !Self::has_capacity(vehicle) {
            return false;
        }
        let route = &mut vehicle.route;

        let at_origin = route
            .current_stop
            .as_ref()
            .map_or(false, |s| s.location == leg.origin);

        let boarding_departure;
        if at_origin {
            // Board at the stop the vehicle is already parked at.
            if let Some(stop) = route.current_stop.as_mut() {
                stop.departure_time = now.max(stop.arrival_time).max(leg.ready_time);
                stop.boarding.push(trip);
                boarding_departure = stop.departure_time;
            } else {
                return false;
            }
        } else {
            // Leave the parked stop now, drive to the origin.
            let depart_start = if let Some(stop) = route.current_stop.as_mut() {
                stop.departure_time = now.max(stop.arrival_time);
                stop.departure_time
            } else {
                now
            };
            let arrival = depart_start + self.leg_travel_time;
            let mut origin_stop = Stop::new(leg.origin, arrival, arrival.max(leg.ready_time));
            origin_stop.boarding.push(trip);
            boarding_departure = origin_stop.departure_time;
            route.next_stops.push_back(origin_stop);
        }

        let dest_arrival = boarding_departure + self.leg_travel_time;
        let mut dest_stop = Stop::new(leg.destination, dest_arrival, dest_arrival + self.dwell_time);
        dest_stop.alighting.push(trip);
        route.next_stops.push_back(dest_stop);
        route.assign(leg.id);
        true
    }
}

impl Default for GreedyDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_LEG_TRAVEL_TIME_MS)
    }
}

impl Dispatcher for GreedyDispatcher {
    fn dispatch(
        &self,
        mut state: StateSnapshot,
        _subset: Option<usize>,
        cancel: &CancellationToken,
    ) -> OptimizationResult {
        let now = state.time;
        let waiting: Vec<TripId> = state.unassigned_trips().map(|t| t.trip.id).collect();
        let vehicle_ids: Vec<VehicleId> = state.vehicles.iter().map(|v| v.vehicle.id).collect();

        let mut modified_trips = Vec::new();
        let mut modified_vehicles = Vec::new();

        for trip_id in waiting {
            if cancel.is_cancelled() {
                break;
            }
            let Some(leg) = state
                .trip(trip_id)
                .and_then(|t| t.trip.current_leg.clone())
            else {
                continue;
            };

            let mut chosen: Option<VehicleId> = None;
            for vid in &vehicle_ids {
                let Some(vehicle) = state.vehicle_mut(*vid) else {
                    continue;
                };
                if Self::place_on_itinerary(&leg, trip_id, vehicle) {
                    chosen = Some(*vid);
                    break;
                }
            }
            if chosen.is_none() {
                for vid in &vehicle_ids {
                    let Some(vehicle) = state.vehicle_mut(*vid) else {
                        continue;
                    };
                    if self.place_on_idle(now, &leg, trip_id, vehicle) {
                        chosen = Some(*vid);
                        break;
                    }
                }
            }

            if let Some(vid) = chosen {
                if let Some(trip) = state.trip_mut(trip_id) {
                    if let Some(current) = trip.trip.current_leg.as_mut() {
                        current.assigned_vehicle = Some(vid);
                    }
                }
                modified_trips.push(trip_id);
                if !modified_vehicles.contains(&vid) {
                    modified_vehicles.push(vid);
                }
            }
        }

        OptimizationResult {
            state,
            modified_trips,
            modified_vehicles,
        }
    }

    fn need_to_optimize(&self, stats: &EnvironmentStatistics) -> bool {
        stats.unassigned_trips > 0
    }
}
