//! Optimization coordinator state: configuration, per-subset machines,
//! deferred cycles, pending merge payloads, and in-flight async dispatches.
//!
//! The Optimize/EnvironmentUpdate/EnvironmentIdle systems in `systems/` drive
//! the protocol; everything they share lives in [`OptimizationAgent`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bevy_ecs::prelude::{Resource, World};
use tracing::debug;

use crate::clock::{EventKind, EventSubject, SimulationClock};
use crate::dispatch::{OptimizationResult, RouteUpdate, TripUpdate};
use crate::ecs::{TripId, VehicleId};
use crate::snapshot::unfreeze;
use crate::state_machine::{optimization_state_machine, OptimizationState, StateMachine};

/// Recognized coordinator options. Times are simulated ms except
/// `max_optimization_time` and `termination_waiting_time`, which bound the
/// wall-clock rendezvous with an asynchronous dispatch worker.
#[derive(Debug, Clone, Resource)]
pub struct OptimizationConfig {
    /// Horizon (ms) during which route commitments are immutable per cycle.
    pub freeze_interval: u64,
    /// Optional timestamp alignment grid: Optimize events are rounded up to
    /// the next multiple of this interval.
    pub batch: Option<u64>,
    /// Allow several queued Optimize events at the same exact timestamp.
    pub multiple_optimize_events: bool,
    /// Dispatch on a worker thread instead of inline.
    pub asynchronous: bool,
    /// Wall-clock budget (ms) for one asynchronous dispatch.
    pub max_optimization_time: u64,
    /// Grace period (ms) between cancelling an overrunning worker and
    /// abandoning it.
    pub termination_waiting_time: u64,
    /// Scope each subset's snapshot to that subset's legs and vehicles.
    pub state_includes_partition_subset_only: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            freeze_interval: 10_000,
            batch: None,
            multiple_optimize_events: false,
            asynchronous: false,
            max_optimization_time: 30_000,
            termination_waiting_time: 5_000,
            state_includes_partition_subset_only: true,
        }
    }
}

impl OptimizationConfig {
    pub fn with_freeze_interval(mut self, ms: u64) -> Self {
        self.freeze_interval = ms;
        self
    }

    pub fn with_batch(mut self, ms: u64) -> Self {
        self.batch = Some(ms);
        self
    }

    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn with_max_optimization_time(mut self, ms: u64) -> Self {
        self.max_optimization_time = ms;
        self
    }

    pub fn with_multiple_optimize_events(mut self, allow: bool) -> Self {
        self.multiple_optimize_events = allow;
        self
    }
}

/// Cooperative cancellation handle shared with dispatch workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One asynchronous dispatch in flight for a subset.
///
/// The receiver is the only channel back from the worker; live state is never
/// shared with it. Not serializable: checkpoints anchor at protocol
/// boundaries where nothing is in flight.
pub struct InFlightDispatch {
    pub rx: Mutex<Receiver<OptimizationResult>>,
    pub cancel: CancellationToken,
    pub handle: Option<JoinHandle<()>>,
}

/// Shared coordinator state.
#[derive(Default, Resource)]
pub struct OptimizationAgent {
    /// One machine per partition subset (a single entry when unpartitioned).
    machines: Vec<StateMachine<OptimizationState, ()>>,
    /// Subsets whose Optimize arrived while their machine was busy; replayed
    /// by EnvironmentIdle.
    deferred: Vec<bool>,
    /// Completed dispatch results awaiting EnvironmentUpdate, per subset.
    results: HashMap<usize, OptimizationResult>,
    in_flight: HashMap<usize, InFlightDispatch>,
    /// Merge payloads awaiting their PassengerAssignment / VehicleNotification.
    trip_updates: HashMap<TripId, TripUpdate>,
    route_updates: HashMap<VehicleId, RouteUpdate>,
}

impl OptimizationAgent {
    /// Grow the per-subset tables to `count` machines.
    pub fn ensure_subsets(&mut self, count: usize) {
        while self.machines.len() < count {
            self.machines.push(optimization_state_machine());
            self.deferred.push(false);
        }
    }

    pub fn subset_count(&self) -> usize {
        self.machines.len()
    }

    pub fn machine_state(&self, subset: usize) -> OptimizationState {
        self.machines
            .get(subset)
            .map(|m| m.current())
            .unwrap_or(OptimizationState::Idle)
    }

    pub fn machine_mut(&mut self, subset: usize) -> &mut StateMachine<OptimizationState, ()> {
        self.ensure_subsets(subset + 1);
        &mut self.machines[subset]
    }

    /// Rebind fresh machines at saved states (checkpoint load).
    pub fn rebind_machines(&mut self, states: &[OptimizationState]) {
        self.machines.clear();
        self.deferred.clear();
        self.ensure_subsets(states.len());
        for (machine, state) in self.machines.iter_mut().zip(states) {
            machine.set_current(*state);
        }
        self.results.clear();
        self.in_flight.clear();
        self.trip_updates.clear();
        self.route_updates.clear();
    }

    pub fn machine_states(&self) -> Vec<OptimizationState> {
        self.machines.iter().map(|m| m.current()).collect()
    }

    pub fn set_deferred(&mut self, subset: usize) {
        self.ensure_subsets(subset + 1);
        self.deferred[subset] = true;
    }

    pub fn take_deferred(&mut self, subset: usize) -> bool {
        self.deferred
            .get_mut(subset)
            .map(std::mem::take)
            .unwrap_or(false)
    }

    pub fn store_result(&mut self, subset: usize, result: OptimizationResult) {
        self.results.insert(subset, result);
    }

    pub fn take_result(&mut self, subset: usize) -> Option<OptimizationResult> {
        self.results.remove(&subset)
    }

    pub fn has_result(&self, subset: usize) -> bool {
        self.results.contains_key(&subset)
    }

    pub fn insert_in_flight(&mut self, subset: usize, dispatch: InFlightDispatch) {
        self.in_flight.insert(subset, dispatch);
    }

    pub fn take_in_flight(&mut self, subset: usize) -> Option<InFlightDispatch> {
        self.in_flight.remove(&subset)
    }

    pub fn has_in_flight(&self, subset: usize) -> bool {
        self.in_flight.contains_key(&subset)
    }

    pub fn stash_trip_update(&mut self, update: TripUpdate) {
        self.trip_updates.insert(update.trip, update);
    }

    pub fn take_trip_update(&mut self, trip: TripId) -> Option<TripUpdate> {
        self.trip_updates.remove(&trip)
    }

    pub fn stash_route_update(&mut self, update: RouteUpdate) {
        self.route_updates.insert(update.vehicle, update);
    }

    pub fn take_route_update(&mut self, vehicle: VehicleId) -> Option<RouteUpdate> {
        self.route_updates.remove(&vehicle)
    }

    /// True while any subset is mid-cycle.
    pub fn any_optimizing(&self) -> bool {
        self.machines
            .iter()
            .any(|m| m.current() != OptimizationState::Idle)
    }
}

/// Round `time` up to the batch grid and schedule an Optimize event, unless
/// one is already queued at that timestamp (deduplication is per exact
/// timestamp and subject, disabled by `multiple_optimize_events`).
pub fn schedule_optimize(
    clock: &mut SimulationClock,
    config: &OptimizationConfig,
    time: u64,
    subject: Option<EventSubject>,
) {
    let time = match config.batch {
        Some(batch) if batch > 0 && time % batch != 0 => (time / batch + 1) * batch,
        _ => time,
    };
    if !config.multiple_optimize_events
        && clock.is_in_queue(EventKind::Optimize, Some(time), subject)
    {
        debug!(time, "optimize already queued at this timestamp, deduplicated");
        return;
    }
    clock.schedule_at(time, EventKind::Optimize, subject);
}

/// Poll every in-flight asynchronous dispatch once.
///
/// Runs after each processed event: a dispatch finishing before its Hold
/// rendezvous feeds EnvironmentUpdate immediately and the Hold is cancelled
/// (tombstoned) rather than processed.
pub fn poll_async_dispatches(world: &mut World) {
    if world.get_resource::<OptimizationAgent>().is_none() {
        return;
    }
    world.resource_scope(|world, mut agent: bevy_ecs::prelude::Mut<OptimizationAgent>| {
        let subsets: Vec<usize> = agent.in_flight.keys().copied().collect();
        for subset in subsets {
            let finished = {
                let Some(dispatch) = agent.in_flight.get(&subset) else {
                    continue;
                };
                let rx = dispatch.rx.lock().unwrap_or_else(|e| e.into_inner());
                match rx.try_recv() {
                    Ok(result) => Some(result),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
                }
            };
            let Some(mut result) = finished else {
                continue;
            };
            if let Some(mut dispatch) = agent.in_flight.remove(&subset) {
                if let Some(handle) = dispatch.handle.take() {
                    let _ = handle.join();
                }
            }
            unfreeze(&mut result.state);
            agent.store_result(subset, result);

            let mut clock = world.resource_mut::<SimulationClock>();
            let subject = EventSubject::Subset(subset as u32);
            let cancelled = clock.cancel(EventKind::Hold, None, Some(subject));
            debug!(subset, cancelled, "async dispatch completed before its hold");
            let now = clock.now();
            clock.schedule_at(now, EventKind::EnvironmentUpdate, Some(subject));
        }
    });
}
