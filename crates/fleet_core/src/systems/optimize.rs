use std::sync::mpsc;
use std::sync::Mutex;

use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::dispatch::{DispatcherResource, OptimizationResult, StatsExtractorResource};
use crate::ecs::{Route, Trip, Vehicle};
use crate::error::FatalError;
use crate::optimization::{
    CancellationToken, InFlightDispatch, OptimizationAgent, OptimizationConfig,
};
use crate::partition::PartitionResource;
use crate::snapshot::{freeze, StateSnapshot, TripSnapshot, VehicleSnapshot};
use crate::state_machine::{OptimizationState, PassengerFsm, VehicleFsm};

/// Starts one optimization cycle.
///
/// A subjectless Optimize under a partition fans out into one cycle per
/// subset. A cycle whose machine is mid-flight is deferred and replayed when
/// the subset returns to idle. Synchronous dispatch completes inline; an
/// asynchronous one runs on a worker thread with a Hold rendezvous scheduled
/// one freeze interval ahead.
pub fn optimize_system(
    mut clock: ResMut<SimulationClock>,
    mut agent: ResMut<OptimizationAgent>,
    mut fatal: ResMut<FatalError>,
    config: Res<OptimizationConfig>,
    dispatcher: Res<DispatcherResource>,
    stats: Res<StatsExtractorResource>,
    partition: Option<Res<PartitionResource>>,
    trips: Query<(&Trip, &PassengerFsm)>,
    vehicles: Query<(&Vehicle, &Route, &VehicleFsm)>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::Optimize {
        return;
    }
    let now = clock.now();

    // Machine index and dispatch scope. Unpartitioned runs use machine 0 and
    // an unscoped snapshot.
    let (idx, scope) = match (event.0.subject, &partition) {
        (Some(EventSubject::Subset(s)), _) => {
            (s as usize, partition.as_ref().map(|_| s as usize))
        }
        (None, Some(partition)) => {
            // Fan out: one cycle per subset, same timestamp.
            for s in 0..partition.0.subset_count() {
                clock.schedule_at(now, EventKind::Optimize, Some(EventSubject::Subset(s as u32)));
            }
            return;
        }
        // Trip/vehicle subjects never reach Optimize; treat them like an
        // unpartitioned request.
        _ => (0, None),
    };

    agent.ensure_subsets(idx + 1);
    if agent.machine_state(idx) != OptimizationState::Idle {
        debug!(subset = idx, "cycle in flight, deferring optimize");
        agent.set_deferred(idx);
        return;
    }

    let subset_only = scope.is_some() && config.state_includes_partition_subset_only;
    let trip_snapshots: Vec<TripSnapshot> = trips
        .iter()
        .filter(|(trip, _)| {
            if !subset_only {
                return true;
            }
            let (partition, s) = match (&partition, scope) {
                (Some(p), Some(s)) => (p, s),
                _ => return true,
            };
            trip.current_leg
                .as_ref()
                .map_or(false, |leg| partition.0.subset_of_leg(leg) == s)
        })
        .map(|(trip, fsm)| TripSnapshot {
            trip: trip.clone(),
            state: fsm.0.current(),
        })
        .collect();
    let vehicle_snapshots: Vec<VehicleSnapshot> = vehicles
        .iter()
        .filter(|(vehicle, _, _)| {
            if !subset_only {
                return true;
            }
            match (&partition, scope) {
                (Some(p), Some(s)) => p.0.subset_of_vehicle(vehicle) == s,
                _ => true,
            }
        })
        .map(|(vehicle, route, fsm)| VehicleSnapshot {
            vehicle: vehicle.clone(),
            route: route.clone(),
            state: fsm.0.current(),
        })
        .collect();

    let mut snapshot = StateSnapshot::new(now, trip_snapshots, vehicle_snapshots, scope);
    let subject = Some(EventSubject::Subset(idx as u32));

    if let Err(err) = agent.machine_mut(idx).advance(EventKind::Optimize, &()) {
        fatal.set(err);
        return;
    }

    let statistics = stats.0.extract(&snapshot);
    if !dispatcher.0.need_to_optimize(&statistics) {
        debug!(subset = idx, "nothing to optimize, empty cycle");
        agent.store_result(idx, OptimizationResult::empty(snapshot));
        clock.schedule_at(now, EventKind::EnvironmentUpdate, subject);
        return;
    }

    freeze(&mut snapshot, config.freeze_interval);

    if !config.asynchronous {
        let mut result = dispatcher
            .0
            .dispatch(snapshot, scope, &CancellationToken::default());
        crate::snapshot::unfreeze(&mut result.state);
        agent.store_result(idx, result);
        clock.schedule_at(now, EventKind::EnvironmentUpdate, subject);
        return;
    }

    // Asynchronous: the worker owns the snapshot; the Hold event is the
    // rendezvous if the result has not been polled in before then.
    let (tx, rx) = mpsc::channel();
    let token = CancellationToken::default();
    let worker_token = token.clone();
    let worker_dispatcher = dispatcher.0.clone();
    let handle = std::thread::spawn(move || {
        let result = worker_dispatcher.dispatch(snapshot, scope, &worker_token);
        let _ = tx.send(result);
    });
    agent.insert_in_flight(
        idx,
        InFlightDispatch {
            rx: Mutex::new(rx),
            cancel: token,
            handle: Some(handle),
        },
    );
    clock.schedule_at(now + config.freeze_interval, EventKind::Hold, subject);
}
