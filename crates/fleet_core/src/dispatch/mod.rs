//! Pluggable dispatch/optimization strategies and their resource wrappers.

pub mod algorithm;
pub mod greedy;
pub mod splitter;
pub mod stats;
pub mod types;

use std::sync::Arc;

use bevy_ecs::prelude::Resource;

pub use algorithm::{Dispatcher, EnvironmentStatisticsExtractor, Splitter};
pub use greedy::GreedyDispatcher;
pub use splitter::DirectSplitter;
pub use stats::{DefaultStatsExtractor, EnvironmentStatistics};
pub use types::{OptimizationResult, RouteUpdate, TripUpdate};

/// Resource wrapper for the dispatcher trait object.
///
/// `Arc`, not `Box`: asynchronous dispatch hands a clone to the worker thread.
#[derive(Resource, Clone)]
pub struct DispatcherResource(pub Arc<dyn Dispatcher>);

impl DispatcherResource {
    pub fn new(dispatcher: impl Dispatcher + 'static) -> Self {
        Self(Arc::new(dispatcher))
    }
}

#[derive(Resource, Clone)]
pub struct SplitterResource(pub Arc<dyn Splitter>);

impl SplitterResource {
    pub fn new(splitter: impl Splitter + 'static) -> Self {
        Self(Arc::new(splitter))
    }
}

#[derive(Resource, Clone)]
pub struct StatsExtractorResource(pub Arc<dyn EnvironmentStatisticsExtractor>);

impl StatsExtractorResource {
    pub fn new(extractor: impl EnvironmentStatisticsExtractor + 'static) -> Self {
        Self(Arc::new(extractor))
    }
}
