use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use bevy_ecs::prelude::{Res, ResMut};
use tracing::{debug, error, warn};

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::error::{FatalError, SimulationError};
use crate::optimization::{OptimizationAgent, OptimizationConfig};
use crate::state_machine::OptimizationState;
use crate::snapshot::unfreeze;

/// Rendezvous with an asynchronous dispatch at the end of its freeze
/// interval. Blocks (wall clock) up to `max_optimization_time`; a dispatch
/// that does not finish in time is cancelled, given a grace period to wind
/// down, and the run aborts. There is no partial-result merge.
pub fn hold_system(
    mut clock: ResMut<SimulationClock>,
    mut agent: ResMut<OptimizationAgent>,
    mut fatal: ResMut<FatalError>,
    config: Res<OptimizationConfig>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::Hold {
        return;
    }
    let idx = match event.0.subject {
        Some(EventSubject::Subset(s)) => s as usize,
        _ => 0,
    };
    let Some(mut dispatch) = agent.take_in_flight(idx) else {
        // Completed early and already polled in; its Hold was tombstoned, so
        // reaching here usually means a stale rendezvous. The exception is a
        // run resumed from a checkpoint taken mid-cycle: the worker is gone
        // but the machine is still mid-protocol. Restart the cycle so the
        // subset does not sit at Optimizing forever.
        if agent.machine_state(idx) == OptimizationState::Optimizing && !agent.has_result(idx) {
            warn!(subset = idx, "hold with no dispatch in flight, restarting the cycle");
            agent.machine_mut(idx).set_current(OptimizationState::Idle);
            let now = clock.now();
            clock.schedule_at(now, EventKind::Optimize, Some(EventSubject::Subset(idx as u32)));
        }
        return;
    };
    let rx = dispatch.rx.into_inner().unwrap_or_else(|e| e.into_inner());

    match rx.recv_timeout(Duration::from_millis(config.max_optimization_time)) {
        Ok(mut result) => {
            if let Some(handle) = dispatch.handle.take() {
                let _ = handle.join();
            }
            unfreeze(&mut result.state);
            agent.store_result(idx, result);
            let now = clock.now();
            debug!(subset = idx, "async dispatch arrived at the hold");
            clock.schedule_at(now, EventKind::EnvironmentUpdate, Some(EventSubject::Subset(idx as u32)));
        }
        Err(RecvTimeoutError::Timeout) => {
            error!(
                subset = idx,
                limit_ms = config.max_optimization_time,
                "async dispatch exceeded its budget, cancelling"
            );
            dispatch.cancel.cancel();
            // Grace period for the worker to notice the token; the worker is
            // detached either way, its result is discarded.
            let _ = rx.recv_timeout(Duration::from_millis(config.termination_waiting_time));
            drop(dispatch.handle.take());
            fatal.set(SimulationError::OptimizationTimeout {
                scope: format!("subset {idx}"),
                limit_ms: config.max_optimization_time,
            });
        }
        Err(RecvTimeoutError::Disconnected) => {
            drop(dispatch.handle.take());
            fatal.set(SimulationError::MissingUpdate("dispatch result (worker died)"));
        }
    }
}
