//! Checkpointing: periodic state saves and resume.
//!
//! A checkpoint captures the queue, the entities with their machine states,
//! the pending release queues, and the run RNG. Collaborators (dispatcher,
//! splitter, partition) and configuration are not serialized; the loading
//! side provides them, which is what lets a run resume under different
//! settings. Saves are anchored at Optimize boundaries, where no dispatch is
//! in flight.

use std::path::PathBuf;

use bevy_ecs::prelude::{Entity, Mut, Resource, World};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::SimulationClock;
use crate::ecs::{EntityIndex, Route, Trip, Vehicle};
use crate::error::SimulationError;
use crate::optimization::OptimizationAgent;
use crate::scenario::{PendingTrips, PendingVehicles, SimRng};
use crate::state_machine::{
    OptimizationState, PassengerFsm, PassengerState, VehicleFsm, VehicleState,
};

/// Checkpoint policy and the most recent snapshot.
#[derive(Debug, Clone, Resource)]
pub struct StateStorage {
    /// Minimum simulated-time gap between periodic saves.
    pub min_save_gap: u64,
    /// Write a final checkpoint when the run aborts on a fatal error.
    pub saving_on_exception: bool,
    /// Save ahead of Optimize events (the quiescent protocol boundary).
    pub save_on_optimize: bool,
    /// Persist checkpoints to this file; in-memory only when unset.
    pub file: Option<PathBuf>,
    last_save: Option<u64>,
    last_checkpoint: Option<Vec<u8>>,
}

impl Default for StateStorage {
    fn default() -> Self {
        Self {
            min_save_gap: 60_000,
            saving_on_exception: true,
            save_on_optimize: true,
            file: None,
            last_save: None,
            last_checkpoint: None,
        }
    }
}

impl StateStorage {
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_min_save_gap(mut self, gap: u64) -> Self {
        self.min_save_gap = gap;
        self
    }

    pub fn last_checkpoint(&self) -> Option<&[u8]> {
        self.last_checkpoint.as_deref()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedTrip {
    trip: Trip,
    state: PassengerState,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedVehicle {
    vehicle: Vehicle,
    route: Route,
    state: VehicleState,
}

/// Everything a resumed run needs that is not a collaborator.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    clock: SimulationClock,
    rng: SimRng,
    trips: Vec<SavedTrip>,
    vehicles: Vec<SavedVehicle>,
    pending_trips: PendingTrips,
    pending_vehicles: PendingVehicles,
    optimization_states: Vec<OptimizationState>,
}

fn capture(world: &mut World) -> Result<Vec<u8>, SimulationError> {
    let trips: Vec<SavedTrip> = world
        .query::<(&Trip, &PassengerFsm)>()
        .iter(world)
        .map(|(trip, fsm)| SavedTrip {
            trip: trip.clone(),
            state: fsm.0.current(),
        })
        .collect();
    let vehicles: Vec<SavedVehicle> = world
        .query::<(&Vehicle, &Route, &VehicleFsm)>()
        .iter(world)
        .map(|(vehicle, route, fsm)| SavedVehicle {
            vehicle: vehicle.clone(),
            route: route.clone(),
            state: fsm.0.current(),
        })
        .collect();

    let checkpoint = Checkpoint {
        clock: world.resource::<SimulationClock>().clone(),
        rng: world.resource::<SimRng>().clone(),
        trips,
        vehicles,
        pending_trips: world.resource::<PendingTrips>().clone(),
        pending_vehicles: world.resource::<PendingVehicles>().clone(),
        optimization_states: world.resource::<OptimizationAgent>().machine_states(),
    };
    Ok(bincode::serialize(&checkpoint)?)
}

fn write_checkpoint(storage: &mut StateStorage, now: u64, bytes: Vec<u8>) -> Result<(), SimulationError> {
    if let Some(path) = &storage.file {
        std::fs::write(path, &bytes)?;
    }
    storage.last_checkpoint = Some(bytes);
    storage.last_save = Some(now);
    Ok(())
}

/// Periodic save. Throttled by `min_save_gap`; the first save always goes
/// through. Returns whether a checkpoint was taken.
pub fn save_state(world: &mut World) -> Result<bool, SimulationError> {
    let now = world.resource::<SimulationClock>().now();
    let due = {
        let storage = world.resource::<StateStorage>();
        storage
            .last_save
            .map_or(true, |last| now.saturating_sub(last) >= storage.min_save_gap)
    };
    if !due {
        return Ok(false);
    }
    let bytes = capture(world)?;
    debug!(time = now, size = bytes.len(), "checkpoint saved");
    world.resource_scope(|_, mut storage: Mut<StateStorage>| {
        write_checkpoint(&mut storage, now, bytes)
    })?;
    Ok(true)
}

/// Unthrottled save, used for the final checkpoint on a fatal error.
pub fn force_save_state(world: &mut World) -> Result<(), SimulationError> {
    let now = world.resource::<SimulationClock>().now();
    let bytes = capture(world)?;
    info!(time = now, "exception checkpoint saved");
    world.resource_scope(|_, mut storage: Mut<StateStorage>| {
        write_checkpoint(&mut storage, now, bytes)
    })
}

/// Restore a checkpoint into a world that already carries the configuration
/// and collaborator resources (dispatcher, splitter, partition). Existing
/// trip and vehicle entities are replaced wholesale; fresh machines are
/// rebound at the saved states.
pub fn load_state(world: &mut World, bytes: &[u8]) -> Result<(), SimulationError> {
    let checkpoint: Checkpoint = bincode::deserialize(bytes)?;

    let mut stale: Vec<Entity> = world
        .query::<(Entity, &Trip)>()
        .iter(world)
        .map(|(entity, _)| entity)
        .collect();
    stale.extend(
        world
            .query::<(Entity, &Vehicle)>()
            .iter(world)
            .map(|(entity, _)| entity),
    );
    for entity in stale {
        world.despawn(entity);
    }

    let mut index = EntityIndex::default();
    for saved in checkpoint.trips {
        let id = saved.trip.id;
        let entity = world
            .spawn((saved.trip, PassengerFsm::at(saved.state)))
            .id();
        index.trips.insert(id, entity);
    }
    for saved in checkpoint.vehicles {
        let id = saved.vehicle.id;
        let entity = world
            .spawn((saved.vehicle, saved.route, VehicleFsm::at(saved.state)))
            .id();
        index.vehicles.insert(id, entity);
    }

    info!(
        time = checkpoint.clock.now(),
        trips = index.trips.len(),
        vehicles = index.vehicles.len(),
        "checkpoint loaded"
    );
    world.insert_resource(index);
    world.insert_resource(checkpoint.clock);
    world.insert_resource(checkpoint.rng);
    world.insert_resource(checkpoint.pending_trips);
    world.insert_resource(checkpoint.pending_vehicles);
    world
        .resource_mut::<OptimizationAgent>()
        .rebind_machines(&checkpoint.optimization_states);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EventKind;
    use crate::optimization::OptimizationConfig;
    use crate::scenario::{build_scenario, ScenarioParams};

    fn small_scenario() -> World {
        let mut world = World::new();
        build_scenario(
            &mut world,
            ScenarioParams {
                num_trips: 5,
                num_vehicles: 2,
                seed: Some(11),
                ..Default::default()
            },
        );
        world.insert_resource(StateStorage::default());
        world
    }

    #[test]
    fn save_is_throttled_by_the_minimum_gap() {
        let mut world = small_scenario();
        assert!(save_state(&mut world).expect("first save"), "first save always runs");
        assert!(!save_state(&mut world).expect("second save"), "second save throttled");

        let gap = world.resource::<StateStorage>().min_save_gap;
        world.resource_mut::<SimulationClock>().advance_to(gap + 1);
        assert!(save_state(&mut world).expect("third save"));
    }

    #[test]
    fn load_restores_queue_pending_demand_and_rng() {
        let mut world = small_scenario();
        save_state(&mut world).expect("save");
        let bytes = world
            .resource::<StateStorage>()
            .last_checkpoint()
            .expect("checkpoint")
            .to_vec();

        // A fresh world with only configuration and collaborators.
        let mut resumed = World::new();
        crate::scenario::build_manual_scenario(
            &mut resumed,
            OptimizationConfig::default(),
            Vec::new(),
            Vec::new(),
        );
        load_state(&mut resumed, &bytes).expect("load");

        assert_eq!(
            resumed.resource::<crate::scenario::PendingTrips>().0.len(),
            world.resource::<crate::scenario::PendingTrips>().0.len()
        );
        assert_eq!(
            resumed.resource::<SimulationClock>().pending_event_count(),
            world.resource::<SimulationClock>().pending_event_count()
        );
        assert!(resumed
            .resource::<SimulationClock>()
            .is_in_queue(EventKind::PassengerRelease, None, None));

        // The run RNG resumes mid-stream.
        use rand::RngCore;
        let a = resumed.resource_mut::<SimRng>().0.next_u64();
        let b = world.resource_mut::<SimRng>().0.next_u64();
        assert_eq!(a, b);
    }

    #[test]
    fn load_despawns_trips_and_vehicles_from_the_previous_run() {
        let mut world = small_scenario();
        save_state(&mut world).expect("save");
        let bytes = world
            .resource::<StateStorage>()
            .last_checkpoint()
            .expect("checkpoint")
            .to_vec();

        let mut resumed = World::new();
        crate::scenario::build_manual_scenario(
            &mut resumed,
            OptimizationConfig::default(),
            Vec::new(),
            Vec::new(),
        );
        // Leftovers from an earlier run in the same world.
        resumed.spawn((
            Trip {
                id: crate::ecs::TripId(99),
                origin: crate::ecs::Location(1),
                destination: crate::ecs::Location(2),
                release_time: 0,
                ready_time: 0,
                due_time: 500_000,
                previous_legs: Vec::new(),
                current_leg: None,
                next_legs: Default::default(),
            },
            PassengerFsm::new(),
        ));
        resumed.spawn((
            Vehicle {
                id: crate::ecs::VehicleId(99),
                release_time: 0,
                start_time: 0,
                end_time: 500_000,
                start_location: crate::ecs::Location(0),
                capacity: 4,
            },
            Route::default(),
            VehicleFsm::new(),
        ));

        load_state(&mut resumed, &bytes).expect("load");

        // The checkpoint had no spawned entities yet, only pending queues.
        assert_eq!(resumed.query::<&Trip>().iter(&resumed).count(), 0);
        assert_eq!(resumed.query::<&Vehicle>().iter(&resumed).count(), 0);
        assert!(resumed.resource::<EntityIndex>().trips.is_empty());
    }

    #[test]
    fn checkpoint_files_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.ckpt");

        let mut world = small_scenario();
        world.insert_resource(StateStorage::default().with_file(&path));
        save_state(&mut world).expect("save");

        let bytes = std::fs::read(&path).expect("checkpoint file");
        let mut resumed = World::new();
        crate::scenario::build_manual_scenario(
            &mut resumed,
            OptimizationConfig::default(),
            Vec::new(),
            Vec::new(),
        );
        load_state(&mut resumed, &bytes).expect("load");
        assert_eq!(resumed.resource::<crate::scenario::PendingTrips>().0.len(), 5);
    }
}
