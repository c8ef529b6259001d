//! Parallel experimentation framework for fleet simulation parameter sweeps.
//!
//! Runs many simulations in parallel with varying scenario and coordinator
//! parameters, extracts service-quality metrics from the final worlds, and
//! exports the results for analysis.
//!
//! # Quick Start
//!
//! ```no_run
//! use fleet_experiments::{run_parallel_experiments, ParameterSpace};
//!
//! let sets = ParameterSpace::grid()
//!     .num_trips(vec![100, 200])
//!     .num_vehicles(vec![10, 20])
//!     .freeze_interval(vec![5_000, 10_000])
//!     .generate();
//!
//! let results = run_parallel_experiments(sets, None);
//! for result in results.iter().flatten() {
//!     println!("{}: {:.0}% served", result.experiment_id, result.completion_rate * 100.0);
//! }
//! ```

pub mod export;
pub mod metrics;
pub mod parameters;
pub mod runner;

pub use export::{export_to_json, find_best_result_index};
pub use metrics::{extract_metrics, SimulationResult};
pub use parameters::{ParameterSet, ParameterSpace};
pub use runner::{run_parallel_experiments, run_single_simulation};
