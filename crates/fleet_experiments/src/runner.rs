//! Parallel simulation execution using rayon.
//!
//! Runs single parameter sets to completion and fans whole sweeps out across
//! the available CPU cores. Each run owns its world; nothing is shared.

use bevy_ecs::prelude::World;
use fleet_core::error::SimulationError;
use fleet_core::partition::{ModuloPartition, PartitionResource};
use fleet_core::runner::{run_until_empty, simulation_schedule};
use fleet_core::scenario::build_scenario;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::metrics::{extract_metrics, SimulationResult};
use crate::parameters::ParameterSet;

/// Safety bound; a drained queue ends the run long before this.
const MAX_STEPS: usize = 2_000_000;

/// Run a single simulation with the given parameter set.
///
/// Creates a new world, builds the scenario, runs the queue dry, and extracts
/// metrics from the final state.
pub fn run_single_simulation(param_set: &ParameterSet) -> Result<SimulationResult, SimulationError> {
    let mut world = World::new();
    build_scenario(&mut world, param_set.scenario_params());
    world.insert_resource(param_set.config.clone());
    if let Some(subsets) = param_set.partitions {
        world.insert_resource(PartitionResource::new(ModuloPartition::new(subsets)));
    }

    let mut schedule = simulation_schedule();
    run_until_empty(&mut world, &mut schedule, Some(MAX_STEPS))?;

    Ok(extract_metrics(
        &mut world,
        &param_set.experiment_id,
        param_set.run_id,
        param_set.seed,
    ))
}

/// Run multiple simulations in parallel.
///
/// Results come back in input order. A run that aborts on a fatal simulation
/// error carries the error in its slot.
pub fn run_parallel_experiments(
    parameter_sets: Vec<ParameterSet>,
    num_threads: Option<usize>,
) -> Vec<Result<SimulationResult, SimulationError>> {
    run_parallel_experiments_with_progress(parameter_sets, num_threads, true)
}

/// Run multiple simulations in parallel with an optional progress bar.
pub fn run_parallel_experiments_with_progress(
    parameter_sets: Vec<ParameterSet>,
    num_threads: Option<usize>,
    show_progress: bool,
) -> Vec<Result<SimulationResult, SimulationError>> {
    let total = parameter_sets.len();
    let pb = if show_progress && total > 0 {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Some(bar)
    } else {
        None
    };

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(threads) = num_threads {
        builder = builder.num_threads(threads);
    }
    let pool = builder.build().expect("thread pool");

    let pb_worker = pb.clone();
    let results = pool.install(|| {
        parameter_sets
            .par_iter()
            .map(|param_set| {
                let result = run_single_simulation(param_set);
                if let Some(ref bar) = pb_worker {
                    bar.inc(1);
                }
                result
            })
            .collect()
    });

    if let Some(ref bar) = pb {
        bar.finish_with_message("Completed");
    }
    results
}
