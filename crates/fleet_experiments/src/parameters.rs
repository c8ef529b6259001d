//! Parameter variation framework for exploring simulation parameter space.
//!
//! Defines a grid of scenario and coordinator settings and expands it into
//! concrete parameter sets, one per combination and run.

use fleet_core::optimization::OptimizationConfig;
use fleet_core::scenario::ScenarioParams;

/// A single parameter configuration for a simulation run.
///
/// Wraps `ScenarioParams` and `OptimizationConfig` with experiment metadata
/// for tracking and reproducibility.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    /// Base scenario parameters.
    pub params: ScenarioParams,
    /// Coordinator settings for this run.
    pub config: OptimizationConfig,
    /// Partition the fleet into this many modulo subsets, if set.
    pub partitions: Option<usize>,
    /// Unique experiment ID for this parameter configuration.
    pub experiment_id: String,
    /// Run ID within the experiment (for multiple runs with same params).
    pub run_id: usize,
    /// Seed used for this run (ensures reproducibility).
    pub seed: u64,
}

impl ParameterSet {
    /// Get the scenario params with the run seed applied.
    pub fn scenario_params(&self) -> ScenarioParams {
        let mut params = self.params.clone();
        params.seed = Some(self.seed);
        params
    }
}

/// Defines a parameter space for grid exploration.
///
/// Every axis left empty falls back to the base value, so the grid size is
/// the product of the non-empty axes times `runs_per_combination`.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    base: ScenarioParams,
    base_config: OptimizationConfig,
    num_trips: Vec<usize>,
    num_vehicles: Vec<usize>,
    vehicle_capacities: Vec<u32>,
    freeze_intervals: Vec<u64>,
    batch_intervals: Vec<Option<u64>>,
    partitions: Vec<Option<usize>>,
    runs_per_combination: usize,
    base_seed: u64,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self {
            base: ScenarioParams::default(),
            base_config: OptimizationConfig::default(),
            num_trips: vec![],
            num_vehicles: vec![],
            vehicle_capacities: vec![],
            freeze_intervals: vec![],
            batch_intervals: vec![],
            partitions: vec![],
            runs_per_combination: 1,
            base_seed: 42,
        }
    }

    /// Create a new parameter space for grid search.
    pub fn grid() -> Self {
        Self::new()
    }

    pub fn with_base(mut self, base: ScenarioParams) -> Self {
        self.base = base;
        self
    }

    pub fn with_base_config(mut self, config: OptimizationConfig) -> Self {
        self.base_config = config;
        self
    }

    /// Set trip counts to explore.
    pub fn num_trips(mut self, counts: Vec<usize>) -> Self {
        self.num_trips = counts;
        self
    }

    /// Set fleet sizes to explore.
    pub fn num_vehicles(mut self, counts: Vec<usize>) -> Self {
        self.num_vehicles = counts;
        self
    }

    /// Set vehicle capacities to explore.
    pub fn vehicle_capacity(mut self, capacities: Vec<u32>) -> Self {
        self.vehicle_capacities = capacities;
        self
    }

    /// Set freeze-horizon lengths (ms) to explore.
    pub fn freeze_interval(mut self, intervals: Vec<u64>) -> Self {
        self.freeze_intervals = intervals;
        self
    }

    /// Set Optimize batching grids (ms) to explore; `None` disables batching.
    pub fn batch_interval(mut self, intervals: Vec<Option<u64>>) -> Self {
        self.batch_intervals = intervals;
        self
    }

    /// Set partition subset counts to explore; `None` runs unpartitioned.
    pub fn partitions(mut self, partitions: Vec<Option<usize>>) -> Self {
        self.partitions = partitions;
        self
    }

    /// Repeat each combination this many times with distinct seeds.
    pub fn runs(mut self, runs: usize) -> Self {
        self.runs_per_combination = runs.max(1);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.base_seed = seed;
        self
    }

    /// Expand the grid into concrete parameter sets.
    pub fn generate(&self) -> Vec<ParameterSet> {
        fn axis<T: Clone>(values: &[T], default: T) -> Vec<T> {
            if values.is_empty() {
                vec![default]
            } else {
                values.to_vec()
            }
        }

        let num_trips = axis(&self.num_trips, self.base.num_trips);
        let num_vehicles = axis(&self.num_vehicles, self.base.num_vehicles);
        let capacities = axis(&self.vehicle_capacities, self.base.vehicle_capacity);
        let freezes = axis(&self.freeze_intervals, self.base_config.freeze_interval);
        let batches = axis(&self.batch_intervals, self.base_config.batch);
        let partitions = axis(&self.partitions, None);

        let mut sets = Vec::new();
        for &trips in &num_trips {
            for &vehicles in &num_vehicles {
                for &capacity in &capacities {
                    for &freeze in &freezes {
                        for &batch in &batches {
                            for &partition in &partitions {
                                let mut params = self.base.clone();
                                params.num_trips = trips;
                                params.num_vehicles = vehicles;
                                params.vehicle_capacity = capacity;

                                let mut config = self.base_config.clone();
                                config.freeze_interval = freeze;
                                config.batch = batch;

                                let experiment_id = format!(
                                    "t{trips}-v{vehicles}-c{capacity}-f{freeze}-b{}-p{}",
                                    batch.map_or_else(|| "off".into(), |b| b.to_string()),
                                    partition.map_or_else(|| "off".into(), |p| p.to_string()),
                                );
                                for run_id in 0..self.runs_per_combination {
                                    sets.push(ParameterSet {
                                        params: params.clone(),
                                        config: config.clone(),
                                        partitions: partition,
                                        experiment_id: experiment_id.clone(),
                                        run_id,
                                        seed: self
                                            .base_seed
                                            .wrapping_add(sets.len() as u64),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        sets
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::new()
    }
}
