//! Simulation entities: trips, legs, vehicles, routes, stops.
//!
//! Plain data components, mutated only while processing events. Queue events
//! and checkpoints reference entities through the id newtypes, never through
//! raw `Entity` values; the [`EntityIndex`] resource maps ids back to the ECS.

use std::collections::{HashMap, VecDeque};

use bevy_ecs::prelude::{Component, Entity, Resource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TripId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VehicleId(pub u32);

/// One boarding segment of a trip, identified by its position in the
/// itinerary produced at split time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegId {
    pub trip: TripId,
    pub index: u32,
}

/// Opaque location id. Geometry and travel times come from external
/// collaborators; the kernel only ever compares locations for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location(pub u64);

/// A scheduled arrival/departure point on a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    pub location: Location,
    pub arrival_time: u64,
    pub departure_time: u64,
    /// Lower bound the departure time may never be moved below.
    pub min_departure_time: Option<u64>,
    /// Trips expected to board here.
    pub boarding: Vec<TripId>,
    /// Trips expected to alight here.
    pub alighting: Vec<TripId>,
}

impl Stop {
    pub fn new(location: Location, arrival_time: u64, departure_time: u64) -> Self {
        Self {
            location,
            arrival_time,
            departure_time,
            min_departure_time: None,
            boarding: Vec::new(),
            alighting: Vec::new(),
        }
    }

    /// Raise the departure time, respecting arrival and min-departure bounds.
    pub fn delay_departure(&mut self, time: u64) {
        let floor = self.min_departure_time.unwrap_or(0).max(self.arrival_time);
        self.departure_time = self.departure_time.max(time).max(floor);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub id: LegId,
    pub origin: Location,
    pub destination: Location,
    pub ready_time: u64,
    pub due_time: u64,
    pub assigned_vehicle: Option<VehicleId>,
}

/// A passenger's end-to-end request. The itinerary (previous/current/next
/// legs) is fixed by the splitter at release; its total length never changes.
#[derive(Debug, Clone, Component, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub origin: Location,
    pub destination: Location,
    pub release_time: u64,
    pub ready_time: u64,
    pub due_time: u64,
    pub previous_legs: Vec<Leg>,
    pub current_leg: Option<Leg>,
    pub next_legs: VecDeque<Leg>,
}

impl Trip {
    pub fn has_next_legs(&self) -> bool {
        !self.next_legs.is_empty()
    }

    /// Total leg count; invariant from split until COMPLETE.
    pub fn total_leg_count(&self) -> usize {
        self.previous_legs.len() + usize::from(self.current_leg.is_some()) + self.next_legs.len()
    }
}

#[derive(Debug, Clone, Component, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub release_time: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub start_location: Location,
    pub capacity: u32,
}

/// The itinerary state of one vehicle. Owned by the vehicle entity.
///
/// The three leg sets are disjoint; over a leg's lifetime their union is
/// exhaustive (assigned, then onboard, then alighted). `load` always equals
/// `onboard_legs.len()`.
#[derive(Debug, Clone, Default, Component, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub current_stop: Option<Stop>,
    pub next_stops: VecDeque<Stop>,
    /// Append-only history of executed stops.
    pub previous_stops: Vec<Stop>,
    pub assigned_legs: Vec<LegId>,
    pub onboard_legs: Vec<LegId>,
    pub alighted_legs: Vec<LegId>,
    pub load: u32,
}

impl Route {
    pub fn has_next_stops(&self) -> bool {
        !self.next_stops.is_empty()
    }

    pub fn assign(&mut self, leg: LegId) {
        if !self.assigned_legs.contains(&leg) {
            self.assigned_legs.push(leg);
        }
    }

    /// Move a leg assigned -> onboard; increments the load.
    pub fn board(&mut self, leg: LegId) -> bool {
        let Some(pos) = self.assigned_legs.iter().position(|l| *l == leg) else {
            return false;
        };
        self.assigned_legs.remove(pos);
        self.onboard_legs.push(leg);
        self.load += 1;
        true
    }

    /// Move a leg onboard -> alighted; decrements the load.
    pub fn alight(&mut self, leg: LegId) -> bool {
        let Some(pos) = self.onboard_legs.iter().position(|l| *l == leg) else {
            return false;
        };
        self.onboard_legs.remove(pos);
        self.alighted_legs.push(leg);
        self.load -= 1;
        true
    }
}

/// Maps domain ids to live ECS entities. Kept in lockstep with spawns; rebuilt
/// wholesale on checkpoint load.
#[derive(Debug, Default, Resource)]
pub struct EntityIndex {
    pub trips: HashMap<TripId, Entity>,
    pub vehicles: HashMap<VehicleId, Entity>,
}
