//! Result export and ranking.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::metrics::SimulationResult;

/// Write results as pretty-printed JSON.
pub fn export_to_json(
    path: &Path,
    results: &[SimulationResult],
) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), results)?;
    Ok(())
}

/// Index of the best run: highest completion rate, ties broken by the lower
/// average pickup delay. `None` for an empty slice.
pub fn find_best_result_index(results: &[SimulationResult]) -> Option<usize> {
    results
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.completion_rate
                .partial_cmp(&b.completion_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.avg_pickup_delay_ms
                        .partial_cmp(&a.avg_pickup_delay_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        })
        .map(|(i, _)| i)
}
