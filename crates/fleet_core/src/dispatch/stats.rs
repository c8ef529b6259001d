//! Environment statistics handed to `Dispatcher::need_to_optimize`.

use crate::snapshot::StateSnapshot;
use crate::state_machine::{PassengerState, VehicleState};

use super::algorithm::EnvironmentStatisticsExtractor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentStatistics {
    pub time: u64,
    pub total_trips: usize,
    /// Trips whose current leg has no vehicle yet.
    pub unassigned_trips: usize,
    pub onboard_trips: usize,
    pub total_vehicles: usize,
    /// Vehicles still in RELEASE with an empty itinerary.
    pub idle_vehicles: usize,
}

/// Counts straight off the snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStatsExtractor;

impl EnvironmentStatisticsExtractor for DefaultStatsExtractor {
    fn extract(&self, state: &StateSnapshot) -> EnvironmentStatistics {
        EnvironmentStatistics {
            time: state.time,
            total_trips: state.trips.len(),
            unassigned_trips: state.unassigned_trips().count(),
            onboard_trips: state
                .trips
                .iter()
                .filter(|t| t.state == PassengerState::Onboard)
                .count(),
            total_vehicles: state.vehicles.len(),
            idle_vehicles: state
                .vehicles
                .iter()
                .filter(|v| v.state == VehicleState::Release && !v.route.has_next_stops())
                .count(),
        }
    }
}
