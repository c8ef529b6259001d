//! Generic guarded finite-state-machine engine.
//!
//! One machine governs each trip, each route, and each optimization cycle.
//! Transitions are `(source, target, triggering event kind, guard)`; guards
//! are evaluated in registration order and the first passing transition wins.
//! An event with no matching transition is a protocol violation and fatal.

use bevy_ecs::prelude::Component;
use serde::{Deserialize, Serialize};

use crate::clock::EventKind;
use crate::ecs::{Route, Trip};
use crate::error::SimulationError;

type Guard<C> = fn(&C) -> bool;

#[derive(Debug, Clone)]
pub struct Transition<S, C> {
    pub source: S,
    pub target: S,
    pub trigger: EventKind,
    pub guard: Option<Guard<C>>,
}

#[derive(Debug, Clone)]
pub struct StateMachine<S, C> {
    current: S,
    transitions: Vec<Transition<S, C>>,
}

impl<S, C> StateMachine<S, C>
where
    S: Copy + PartialEq + std::fmt::Debug,
{
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            transitions: Vec::new(),
        }
    }

    pub fn with_transition(
        mut self,
        source: S,
        target: S,
        trigger: EventKind,
        guard: Option<Guard<C>>,
    ) -> Self {
        self.transitions.push(Transition {
            source,
            target,
            trigger,
            guard,
        });
        self
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Force the current state; used only when rebinding fresh machines to a
    /// loaded checkpoint.
    pub fn set_current(&mut self, state: S) {
        self.current = state;
    }

    /// Apply the first registered transition matching `(current, trigger)`
    /// whose guard passes. No match is fatal upstream.
    pub fn advance(&mut self, trigger: EventKind, ctx: &C) -> Result<S, SimulationError> {
        for transition in &self.transitions {
            if transition.source == self.current
                && transition.trigger == trigger
                && transition.guard.map_or(true, |guard| guard(ctx))
            {
                self.current = transition.target;
                return Ok(self.current);
            }
        }
        Err(SimulationError::InvalidTransition {
            state: format!("{:?}", self.current),
            trigger,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassengerState {
    Release,
    Assigned,
    Ready,
    Onboard,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleState {
    Release,
    Boarding,
    Enroute,
    Alighting,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizationState {
    Idle,
    Optimizing,
    UpdateEnvironment,
}

/// Per-trip machine. `Onboard -> Release` (has a connection) is registered
/// before `Onboard -> Complete` so the guarded transition is tried first.
pub fn passenger_state_machine() -> StateMachine<PassengerState, Trip> {
    StateMachine::new(PassengerState::Release)
        .with_transition(
            PassengerState::Release,
            PassengerState::Assigned,
            EventKind::PassengerAssignment,
            None,
        )
        .with_transition(
            PassengerState::Assigned,
            PassengerState::Ready,
            EventKind::PassengerReady,
            None,
        )
        .with_transition(
            PassengerState::Ready,
            PassengerState::Onboard,
            EventKind::PassengerBoard,
            None,
        )
        .with_transition(
            PassengerState::Onboard,
            PassengerState::Release,
            EventKind::PassengerAlight,
            Some(Trip::has_next_legs as Guard<Trip>),
        )
        .with_transition(
            PassengerState::Onboard,
            PassengerState::Complete,
            EventKind::PassengerAlight,
            None,
        )
}

/// Per-route machine. The boarding trigger goes to `Complete` when the route
/// has no next stop left.
pub fn vehicle_state_machine() -> StateMachine<VehicleState, Route> {
    StateMachine::new(VehicleState::Release)
        .with_transition(
            VehicleState::Release,
            VehicleState::Boarding,
            EventKind::VehicleBoarding,
            Some(Route::has_next_stops as Guard<Route>),
        )
        .with_transition(
            VehicleState::Release,
            VehicleState::Complete,
            EventKind::VehicleBoarding,
            None,
        )
        .with_transition(
            VehicleState::Boarding,
            VehicleState::Enroute,
            EventKind::VehicleDeparture,
            None,
        )
        .with_transition(
            VehicleState::Enroute,
            VehicleState::Alighting,
            EventKind::VehicleArrival,
            None,
        )
        .with_transition(
            VehicleState::Alighting,
            VehicleState::Boarding,
            EventKind::VehicleBoarding,
            Some(Route::has_next_stops as Guard<Route>),
        )
        .with_transition(
            VehicleState::Alighting,
            VehicleState::Complete,
            EventKind::VehicleBoarding,
            None,
        )
}

/// Per-cycle machine; the backpressure gate guaranteeing at most one
/// concurrent dispatch per partition subset.
pub fn optimization_state_machine() -> StateMachine<OptimizationState, ()> {
    StateMachine::new(OptimizationState::Idle)
        .with_transition(
            OptimizationState::Idle,
            OptimizationState::Optimizing,
            EventKind::Optimize,
            None,
        )
        .with_transition(
            OptimizationState::Optimizing,
            OptimizationState::UpdateEnvironment,
            EventKind::EnvironmentUpdate,
            None,
        )
        .with_transition(
            OptimizationState::UpdateEnvironment,
            OptimizationState::Idle,
            EventKind::EnvironmentIdle,
            None,
        )
}

#[derive(Debug, Clone, Component)]
pub struct PassengerFsm(pub StateMachine<PassengerState, Trip>);

#[derive(Debug, Clone, Component)]
pub struct VehicleFsm(pub StateMachine<VehicleState, Route>);

impl PassengerFsm {
    pub fn new() -> Self {
        Self(passenger_state_machine())
    }

    /// Fresh machine forced to a saved state (checkpoint rebinding).
    pub fn at(state: PassengerState) -> Self {
        let mut fsm = Self::new();
        fsm.0.set_current(state);
        fsm
    }
}

impl Default for PassengerFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl VehicleFsm {
    pub fn new() -> Self {
        Self(vehicle_state_machine())
    }

    pub fn at(state: VehicleState) -> Self {
        let mut fsm = Self::new();
        fsm.0.set_current(state);
        fsm
    }
}

impl Default for VehicleFsm {
    fn default() -> Self {
        Self::new()
    }
}
