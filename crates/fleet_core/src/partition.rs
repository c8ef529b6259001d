//! Partitioned parallel dispatch: disjoint subsets of the fleet and demand.

use std::sync::Arc;

use bevy_ecs::prelude::Resource;

use crate::ecs::{Leg, Vehicle};

/// A predicate-based disjoint decomposition of all legs and vehicles.
///
/// Every leg and every vehicle belongs to exactly one subset; the merge step
/// enforces this fatally (a dispatch cycle may only modify entities of its own
/// subset). Subsets optimize independently and may run truly in parallel.
pub trait Partition: Send + Sync {
    fn subset_count(&self) -> usize;
    fn subset_of_vehicle(&self, vehicle: &Vehicle) -> usize;
    fn subset_of_leg(&self, leg: &Leg) -> usize;
}

#[derive(Resource, Clone)]
pub struct PartitionResource(pub Arc<dyn Partition>);

impl PartitionResource {
    pub fn new(partition: impl Partition + 'static) -> Self {
        Self(Arc::new(partition))
    }
}

/// Reference partition: vehicles by `id % n`, legs by `trip id % n`.
/// Disjoint by construction. Real partitions split along service areas or
/// depots; this one exists for tests and synthetic scenarios.
#[derive(Debug, Clone, Copy)]
pub struct ModuloPartition {
    subsets: usize,
}

impl ModuloPartition {
    pub fn new(subsets: usize) -> Self {
        Self {
            subsets: subsets.max(1),
        }
    }
}

impl Partition for ModuloPartition {
    fn subset_count(&self) -> usize {
        self.subsets
    }

    fn subset_of_vehicle(&self, vehicle: &Vehicle) -> usize {
        vehicle.id.0 as usize % self.subsets
    }

    fn subset_of_leg(&self, leg: &Leg) -> usize {
        leg.id.trip.0 as usize % self.subsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{LegId, Location, TripId, VehicleId};

    #[test]
    fn modulo_partition_is_total_and_disjoint() {
        let partition = ModuloPartition::new(3);
        for id in 0..30 {
            let vehicle = Vehicle {
                id: VehicleId(id),
                release_time: 0,
                start_time: 0,
                end_time: 0,
                start_location: Location(0),
                capacity: 1,
            };
            let subset = partition.subset_of_vehicle(&vehicle);
            assert!(subset < partition.subset_count());
        }
        let leg = Leg {
            id: LegId {
                trip: TripId(7),
                index: 0,
            },
            origin: Location(0),
            destination: Location(1),
            ready_time: 0,
            due_time: 0,
            assigned_vehicle: None,
        };
        assert_eq!(partition.subset_of_leg(&leg), 1);
    }
}
