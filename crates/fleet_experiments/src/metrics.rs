//! Metrics extraction from completed simulation worlds.
//!
//! Service quality is reconstructed from the final entity state: completion
//! counts from the passenger machines, pickup delays from the boarding
//! commitments recorded in the vehicles' executed stop history.

use std::collections::HashMap;

use bevy_ecs::prelude::World;
use fleet_core::clock::{EventKind, SimulationClock};
use fleet_core::ecs::{Route, Trip, TripId};
use fleet_core::profiling::EventMetrics;
use fleet_core::state_machine::{PassengerFsm, PassengerState};

/// Aggregated metrics from a single simulation run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SimulationResult {
    pub experiment_id: String,
    pub run_id: usize,
    pub seed: u64,
    pub total_trips: usize,
    pub total_vehicles: usize,
    pub completed_trips: usize,
    /// completed / total.
    pub completion_rate: f64,
    /// Simulated time at which the queue drained.
    pub makespan_ms: u64,
    pub optimize_cycles: u64,
    pub events_processed: u64,
    pub events_per_second: f64,
    /// Departure at the pickup stop minus the trip's ready time.
    pub avg_pickup_delay_ms: f64,
    pub median_pickup_delay_ms: f64,
    pub p90_pickup_delay_ms: f64,
}

/// (avg, median, p90) of an unsorted sample.
fn calculate_stats(values: &[u64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();

    let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    let median = if sorted.len() % 2 == 0 {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) as f64 / 2.0
    } else {
        sorted[sorted.len() / 2] as f64
    };
    let p90_idx = ((sorted.len() - 1) as f64 * 0.9) as usize;
    let p90 = sorted[p90_idx] as f64;

    (avg, median, p90)
}

/// Extract metrics from a completed simulation world.
pub fn extract_metrics(
    world: &mut World,
    experiment_id: &str,
    run_id: usize,
    seed: u64,
) -> SimulationResult {
    // Departure time of the stop each trip boarded at, keyed by trip.
    let mut board_departures: HashMap<TripId, u64> = HashMap::new();
    let mut total_vehicles = 0;
    for route in world.query::<&Route>().iter(world) {
        total_vehicles += 1;
        let executed = route
            .previous_stops
            .iter()
            .chain(route.current_stop.as_ref());
        for stop in executed {
            for trip in &stop.boarding {
                board_departures.entry(*trip).or_insert(stop.departure_time);
            }
        }
    }

    let mut total_trips = 0;
    let mut completed_trips = 0;
    let mut pickup_delays = Vec::new();
    for (trip, fsm) in world.query::<(&Trip, &PassengerFsm)>().iter(world) {
        total_trips += 1;
        if fsm.0.current() == PassengerState::Complete {
            completed_trips += 1;
            if let Some(departure) = board_departures.get(&trip.id) {
                pickup_delays.push(departure.saturating_sub(trip.ready_time));
            }
        }
    }

    let completion_rate = if total_trips > 0 {
        completed_trips as f64 / total_trips as f64
    } else {
        0.0
    };
    let (avg, median, p90) = calculate_stats(&pickup_delays);

    let metrics = world.resource::<EventMetrics>();
    SimulationResult {
        experiment_id: experiment_id.to_string(),
        run_id,
        seed,
        total_trips,
        total_vehicles,
        completed_trips,
        completion_rate,
        makespan_ms: world.resource::<SimulationClock>().now(),
        optimize_cycles: metrics.count(EventKind::Optimize),
        events_processed: metrics.events_processed,
        events_per_second: metrics.events_per_second(),
        avg_pickup_delay_ms: avg,
        median_pickup_delay_ms: median,
        p90_pickup_delay_ms: p90,
    }
}
