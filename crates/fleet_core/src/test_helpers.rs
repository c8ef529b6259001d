//! Shared setup for tests and benchmarks.

use bevy_ecs::prelude::World;

use crate::dispatch::{DispatcherResource, GreedyDispatcher};
use crate::ecs::{Location, Stop, TripId, Vehicle, VehicleId};
use crate::optimization::OptimizationConfig;
use crate::scenario::{build_manual_scenario, TripRequest, VehiclePlan};

/// Far enough out that no generated trip misses its deadline.
pub const TEST_DUE_TIME: u64 = 500_000;

/// A direct trip request with the standard due time.
pub fn test_trip_request(id: u32, origin: u64, destination: u64, release: u64, ready: u64) -> TripRequest {
    TripRequest {
        id: TripId(id),
        origin: Location(origin),
        destination: Location(destination),
        release_time: release,
        ready_time: ready,
        due_time: TEST_DUE_TIME,
    }
}

/// A vehicle parked at one location for its whole shift.
pub fn test_parked_vehicle(id: u32, location: u64) -> VehiclePlan {
    VehiclePlan {
        vehicle: Vehicle {
            id: VehicleId(id),
            release_time: 0,
            start_time: 0,
            end_time: TEST_DUE_TIME,
            start_location: Location(location),
            capacity: 4,
        },
        stops: vec![Stop::new(Location(location), 0, TEST_DUE_TIME)],
    }
}

/// A world wired for the given demand, using the greedy reference dispatcher
/// with a short flat travel time so runs stay compact.
pub fn create_test_world(trips: Vec<TripRequest>, vehicles: Vec<VehiclePlan>) -> World {
    let mut world = World::new();
    build_manual_scenario(&mut world, OptimizationConfig::default(), trips, vehicles);
    world.insert_resource(DispatcherResource::new(GreedyDispatcher::new(1_000)));
    world
}
