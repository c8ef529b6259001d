//! Scenario setup: demand and fleet generation plus world wiring.
//!
//! Trips and vehicles are spawned just-in-time when their release event
//! fires; until then they sit in the pending queues, which are part of every
//! checkpoint so a resumed run sees the same future demand.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use bevy_ecs::prelude::{Resource, World};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::clock::{EventKind, EventSubject, SimulationClock};
use crate::dispatch::{
    DefaultStatsExtractor, DirectSplitter, DispatcherResource, GreedyDispatcher, SplitterResource,
    StatsExtractorResource,
};
use crate::ecs::{EntityIndex, Location, Stop, TripId, Vehicle, VehicleId};
use crate::error::FatalError;
use crate::optimization::{OptimizationAgent, OptimizationConfig};
use crate::profiling::EventMetrics;

/// Default demand window: 1 hour of simulated time.
const DEFAULT_REQUEST_WINDOW_MS: u64 = 60 * 60 * 1000;

/// A trip not yet released into the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRequest {
    pub id: TripId,
    pub origin: Location,
    pub destination: Location,
    pub release_time: u64,
    pub ready_time: u64,
    pub due_time: u64,
}

/// A vehicle not yet released, together with its initial itinerary (often a
/// single parking stop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehiclePlan {
    pub vehicle: Vehicle,
    pub stops: Vec<Stop>,
}

#[derive(Debug, Clone, Default, Resource, Serialize, Deserialize)]
pub struct PendingTrips(pub VecDeque<TripRequest>);

impl PendingTrips {
    /// Remove and return the pending request with this id.
    pub fn take(&mut self, id: TripId) -> Option<TripRequest> {
        let pos = self.0.iter().position(|r| r.id == id)?;
        self.0.remove(pos)
    }
}

#[derive(Debug, Clone, Default, Resource, Serialize, Deserialize)]
pub struct PendingVehicles(pub VecDeque<VehiclePlan>);

impl PendingVehicles {
    pub fn take(&mut self, id: VehicleId) -> Option<VehiclePlan> {
        let pos = self.0.iter().position(|p| p.vehicle.id == id)?;
        self.0.remove(pos)
    }
}

/// Deterministic run RNG. Checkpointed, so a resumed run draws the same
/// sequence a continuous run would.
#[derive(Debug, Clone, Resource, Serialize, Deserialize)]
pub struct SimRng(pub ChaCha8Rng);

impl Default for SimRng {
    fn default() -> Self {
        Self(ChaCha8Rng::from_entropy())
    }
}

/// External pause/resume/stop control shared with a driving thread.
#[derive(Debug, Clone, Default, Resource)]
pub struct SimulationControl {
    inner: Arc<(Mutex<ControlState>, Condvar)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ControlState {
    #[default]
    Running,
    Paused,
    Stopped,
}

impl SimulationControl {
    pub fn pause(&self) {
        let (lock, _) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ControlState::Running {
            *state = ControlState::Paused;
        }
    }

    pub fn resume(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ControlState::Paused {
            *state = ControlState::Running;
        }
        cvar.notify_all();
    }

    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        *state = ControlState::Stopped;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) == ControlState::Stopped
    }

    /// Block while paused; returns `false` once stopped.
    pub fn wait_if_paused(&self) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        while *state == ControlState::Paused {
            state = cvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        *state != ControlState::Stopped
    }
}

/// Parameters for generating a random scenario.
#[derive(Debug, Clone)]
pub struct ScenarioParams {
    pub num_trips: usize,
    pub num_vehicles: usize,
    /// Random seed for reproducibility (None draws from entropy).
    pub seed: Option<u64>,
    /// Number of distinct locations demand is drawn from.
    pub num_locations: u64,
    /// Release times are uniform in `[0, request_window_ms]`.
    pub request_window_ms: u64,
    /// Ready delay after release, uniform in this range.
    pub ready_delay_ms: (u64, u64),
    /// Due time after ready.
    pub due_window_ms: u64,
    pub vehicle_capacity: u32,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            num_trips: 500,
            num_vehicles: 50,
            seed: None,
            num_locations: 100,
            request_window_ms: DEFAULT_REQUEST_WINDOW_MS,
            ready_delay_ms: (0, 5 * 60 * 1000),
            due_window_ms: 60 * 60 * 1000,
            vehicle_capacity: 4,
        }
    }
}

impl ScenarioParams {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_request_window_hours(mut self, hours: u64) -> Self {
        self.request_window_ms = hours * 60 * 60 * 1000;
        self
    }

    pub fn with_vehicle_capacity(mut self, capacity: u32) -> Self {
        self.vehicle_capacity = capacity;
        self
    }
}

/// Insert every resource the simulation schedule expects, with the reference
/// collaborators. Callers swap in their own dispatcher/splitter afterwards.
fn insert_base_resources(world: &mut World, config: OptimizationConfig) {
    world.insert_resource(SimulationClock::default());
    world.insert_resource(config);
    world.insert_resource(OptimizationAgent::default());
    world.insert_resource(FatalError::default());
    world.insert_resource(EventMetrics::default());
    world.insert_resource(EntityIndex::default());
    world.insert_resource(SimulationControl::default());
    world.insert_resource(DispatcherResource::new(GreedyDispatcher::default()));
    world.insert_resource(SplitterResource::new(DirectSplitter));
    world.insert_resource(StatsExtractorResource::new(DefaultStatsExtractor));
}

/// Wire a fully specified scenario: explicit trips and vehicle plans.
/// Schedules one release event per trip and per vehicle.
pub fn build_manual_scenario(
    world: &mut World,
    config: OptimizationConfig,
    trips: Vec<TripRequest>,
    vehicles: Vec<VehiclePlan>,
) {
    insert_base_resources(world, config);
    world.insert_resource(SimRng::default());

    {
        let mut clock = world.resource_mut::<SimulationClock>();
        for trip in &trips {
            clock.schedule_at(
                trip.release_time,
                EventKind::PassengerRelease,
                Some(EventSubject::Trip(trip.id)),
            );
        }
        for plan in &vehicles {
            clock.schedule_at(
                plan.vehicle.release_time,
                EventKind::VehicleRelease,
                Some(EventSubject::Vehicle(plan.vehicle.id)),
            );
        }
    }

    world.insert_resource(PendingTrips(trips.into()));
    world.insert_resource(PendingVehicles(vehicles.into()));
}

/// Generate a random scenario: uniform demand over the request window, the
/// fleet parked at random locations from time zero.
pub fn build_scenario(world: &mut World, params: ScenarioParams) {
    let mut rng = match params.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };

    let locations = params.num_locations.max(2);
    let mut trips = Vec::with_capacity(params.num_trips);
    for i in 0..params.num_trips {
        let origin = Location(rng.gen_range(0..locations));
        let destination = loop {
            let candidate = Location(rng.gen_range(0..locations));
            if candidate != origin {
                break candidate;
            }
        };
        let release_time = rng.gen_range(0..=params.request_window_ms);
        let (lo, hi) = params.ready_delay_ms;
        let ready_time = release_time + rng.gen_range(lo..=hi.max(lo));
        trips.push(TripRequest {
            id: TripId(i as u32),
            origin,
            destination,
            release_time,
            ready_time,
            due_time: ready_time + params.due_window_ms,
        });
    }

    let shift_end = params.request_window_ms + 2 * params.due_window_ms;
    let mut vehicles = Vec::with_capacity(params.num_vehicles);
    for i in 0..params.num_vehicles {
        let start_location = Location(rng.gen_range(0..locations));
        vehicles.push(VehiclePlan {
            vehicle: Vehicle {
                id: VehicleId(i as u32),
                release_time: 0,
                start_time: 0,
                end_time: shift_end,
                start_location,
                capacity: params.vehicle_capacity,
            },
            // Parked at the start location, free to leave at any point.
            stops: vec![Stop::new(start_location, 0, shift_end)],
        });
    }

    build_manual_scenario(world, OptimizationConfig::default(), trips, vehicles);
    // Replace the entropy rng with the scenario-derived one for the run.
    world.insert_resource(SimRng(ChaCha8Rng::seed_from_u64(
        params.seed.unwrap_or(0) ^ 0x5eed_f1ee7,
    )));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_scenario_queues_releases_for_every_trip_and_vehicle() {
        let mut world = World::new();
        build_scenario(
            &mut world,
            ScenarioParams {
                num_trips: 10,
                num_vehicles: 3,
                seed: Some(42),
                ..Default::default()
            },
        );

        assert_eq!(world.resource::<PendingTrips>().0.len(), 10);
        assert_eq!(world.resource::<PendingVehicles>().0.len(), 3);

        let clock = world.resource::<SimulationClock>();
        assert_eq!(clock.pending_event_count(), 13, "one release event each");
    }

    #[test]
    fn scenarios_are_reproducible_by_seed() {
        let mut a = World::new();
        let mut b = World::new();
        build_scenario(&mut a, ScenarioParams::default().with_seed(7));
        build_scenario(&mut b, ScenarioParams::default().with_seed(7));

        let trips_a = a.resource::<PendingTrips>().0.clone();
        let trips_b = b.resource::<PendingTrips>().0.clone();
        assert_eq!(trips_a.len(), trips_b.len());
        for (x, y) in trips_a.iter().zip(&trips_b) {
            assert_eq!(x.origin, y.origin);
            assert_eq!(x.release_time, y.release_time);
            assert_eq!(x.due_time, y.due_time);
        }
    }

    #[test]
    fn pending_queue_take_removes_by_id() {
        let mut pending = PendingTrips::default();
        for i in 0..3 {
            pending.0.push_back(TripRequest {
                id: TripId(i),
                origin: Location(0),
                destination: Location(1),
                release_time: 0,
                ready_time: 0,
                due_time: 100,
            });
        }
        let taken = pending.take(TripId(1)).expect("present");
        assert_eq!(taken.id, TripId(1));
        assert!(pending.take(TripId(1)).is_none());
        assert_eq!(pending.0.len(), 2);
    }

    #[test]
    fn control_stop_is_terminal() {
        let control = SimulationControl::default();
        assert!(control.wait_if_paused());
        control.stop();
        assert!(control.is_stopped());
        assert!(!control.wait_if_paused());
        control.resume();
        assert!(control.is_stopped(), "stop is not undone by resume");
    }
}
