use bevy_ecs::prelude::{Res, ResMut};
use tracing::debug;

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::error::FatalError;
use crate::optimization::{schedule_optimize, OptimizationAgent, OptimizationConfig};

/// Closes an optimization cycle. An Optimize that arrived while this subset
/// was busy is replayed now.
pub fn environment_idle_system(
    mut clock: ResMut<SimulationClock>,
    mut agent: ResMut<OptimizationAgent>,
    mut fatal: ResMut<FatalError>,
    config: Res<OptimizationConfig>,
    event: Res<CurrentEvent>,
) {
    if event.0.kind != EventKind::EnvironmentIdle {
        return;
    }
    let idx = match event.0.subject {
        Some(EventSubject::Subset(s)) => s as usize,
        _ => 0,
    };
    if let Err(err) = agent.machine_mut(idx).advance(EventKind::EnvironmentIdle, &()) {
        fatal.set(err);
        return;
    }
    if agent.take_deferred(idx) {
        debug!(subset = idx, "replaying deferred optimize");
        let now = clock.now();
        schedule_optimize(&mut clock, &config, now, Some(EventSubject::Subset(idx as u32)));
    }
}
