use crate::{
    series_loader::Series,
    slice::SliceRecord,
    voxel_grid::{AccumulateError, GridError, GridGeometry, VoxelGrid},
};

use rayon::{ThreadPoolBuildError, ThreadPoolBuilder, prelude::*};
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Worker for chunk {chunk} failed: {source}")]
    WorkerFailure {
        chunk: usize,
        #[source]
        source: AccumulateError,
    },

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

#[derive(Debug)]
enum ChunkOutcome {
    Done(VoxelGrid),
    Cancelled,
    Failed(SchedulerError),
}

/// Fans slices out to a fixed pool of workers, each filling a private
/// [`VoxelGrid`], then sums the private grids into one.
///
/// Slices are split into contiguous, equally sized chunks, one per worker.
/// Nothing is shared between workers except a cancellation marker, so the
/// merge after the pool joins is the only synchronization point.
#[derive(Debug, Clone, Copy)]
pub struct AggregationScheduler {
    workers: usize,
    memory_limit: Option<usize>,
}

impl Default for AggregationScheduler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AggregationScheduler {
    /// `None` sizes the pool to the available hardware concurrency.
    pub fn new(workers: Option<usize>) -> Self {
        let workers = workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get));
        Self {
            workers,
            memory_limit: None,
        }
    }

    /// Cap the bytes all private grids may take together.
    pub fn with_memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    /// Accumulate every slice of `series` into a grid laid out by `geometry`.
    ///
    /// # Errors
    ///
    /// When workers fail, the failure with the lowest chunk index is returned
    /// as [`SchedulerError::WorkerFailure`] and all partial grids are dropped.
    /// Grids that exceed the memory limit, or that cannot be allocated, fail
    /// with [`GridError::TooLarge`].
    pub fn run(
        &self,
        series: &Series,
        geometry: GridGeometry,
    ) -> Result<VoxelGrid, SchedulerError> {
        let slices = series.slices();
        let chunk_len = slices.len().div_ceil(self.workers).max(1);
        let chunks: Vec<&[SliceRecord]> = slices.chunks(chunk_len).collect();

        let required = geometry
            .memory_bytes()
            .and_then(|bytes| bytes.checked_mul(chunks.len().max(1)))
            .ok_or_else(|| geometry.too_large())?;
        if let Some(limit) = self.memory_limit.filter(|&limit| required > limit) {
            warn!(required, limit, "voxel grids exceed the memory limit");
            return Err(geometry.too_large().into());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(chunks.len().max(1))
            .thread_name(|i| format!("voxelize-worker-{i}"))
            .build()?;

        info!(
            workers = chunks.len(),
            slices = slices.len(),
            cells = geometry.len(),
            bytes = required,
            "accumulating"
        );

        // Lowest index of a failed chunk; chunks above it stop early.
        let first_failure = AtomicUsize::new(usize::MAX);
        let outcomes: Vec<ChunkOutcome> = pool.install(|| {
            chunks
                .par_iter()
                .enumerate()
                .map(|(index, chunk)| {
                    Self::accumulate_chunk(index, chunk, geometry, &first_failure)
                })
                .collect()
        });

        Self::merge(outcomes, geometry)
    }

    fn accumulate_chunk(
        index: usize,
        chunk: &[SliceRecord],
        geometry: GridGeometry,
        first_failure: &AtomicUsize,
    ) -> ChunkOutcome {
        let fail = |error: SchedulerError| {
            first_failure.fetch_min(index, Ordering::AcqRel);
            ChunkOutcome::Failed(error)
        };

        let mut grid = match VoxelGrid::new(geometry) {
            Ok(grid) => grid,
            Err(e) => return fail(e.into()),
        };
        let mut samples = 0;
        for slice in chunk {
            if first_failure.load(Ordering::Acquire) < index {
                debug!(chunk = index, "cancelled");
                return ChunkOutcome::Cancelled;
            }
            match grid.accumulate_slice(slice) {
                Ok(pushed) => samples += pushed,
                Err(source) => {
                    return fail(SchedulerError::WorkerFailure {
                        chunk: index,
                        source,
                    });
                }
            }
        }
        debug!(chunk = index, slices = chunk.len(), samples, "chunk done");
        ChunkOutcome::Done(grid)
    }

    /// Sum the private grids in chunk order.
    fn merge(
        outcomes: Vec<ChunkOutcome>,
        geometry: GridGeometry,
    ) -> Result<VoxelGrid, SchedulerError> {
        let mut merged: Option<VoxelGrid> = None;
        for outcome in outcomes {
            match outcome {
                ChunkOutcome::Done(grid) => match merged.as_mut() {
                    Some(total) => total.merge(&grid),
                    None => merged = Some(grid),
                },
                ChunkOutcome::Failed(error) => return Err(error),
                // Only chunks after a failed one are cancelled, and that
                // failure has already been returned above.
                ChunkOutcome::Cancelled => {}
            }
        }
        match merged {
            Some(grid) => Ok(grid),
            None => Ok(VoxelGrid::new(geometry)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{spatial_index::SpatialIndex, voxel_grid::VoxelSize};
    use ndarray::Array2;

    fn series_with(values: impl Fn(usize, usize, usize) -> f32, depth: usize) -> Series {
        let slices = (0..depth)
            .map(|z| {
                let pixels = Array2::from_shape_fn((5, 7), |(r, c)| values(z, r, c));
                SliceRecord::new(
                    format!("slice-{z}"),
                    pixels,
                    (0.7, 0.9),
                    [0.0, 0.0, z as f64 * 1.25],
                    1.25,
                )
                .unwrap()
            })
            .collect();
        Series::from_slices(slices, 1e-4).unwrap()
    }

    fn geometry(series: &Series, voxel: VoxelSize) -> GridGeometry {
        GridGeometry::from_bounds(SpatialIndex::new(series).bounds(), voxel).unwrap()
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let series = series_with(|z, r, c| ((z * 31 + r * 7 + c * 3) % 97) as f32 * 0.37, 13);
        let geometry = geometry(&series, VoxelSize::new(1.5, 2.0, 3.0).unwrap());

        let single = AggregationScheduler::new(Some(1))
            .run(&series, geometry)
            .unwrap();
        for workers in [2, 3, 8, 64] {
            let parallel = AggregationScheduler::new(Some(workers))
                .run(&series, geometry)
                .unwrap();
            ndarray::Zip::from(single.cells())
                .and(parallel.cells())
                .for_each(|a, b| {
                    assert_eq!(a.count, b.count);
                    assert!((a.sum - b.sum).abs() <= 1e-9 * a.sum.abs().max(1.0));
                    assert!(
                        (a.sum_of_squares - b.sum_of_squares).abs()
                            <= 1e-9 * a.sum_of_squares.abs().max(1.0)
                    );
                });
        }
    }

    #[test]
    fn every_pixel_is_counted_once_per_overlapped_bin() {
        let series = series_with(|_, _, _| 1.0, 4);
        let geometry = geometry(&series, VoxelSize::new(100.0, 100.0, 100.0).unwrap());
        let grid = AggregationScheduler::new(Some(3))
            .run(&series, geometry)
            .unwrap();
        assert_eq!(grid.geometry().dims(), (1, 1, 1));
        assert_eq!(grid.get(0, 0, 0).unwrap().count, 4 * 5 * 7);
    }

    #[test]
    fn lowest_failing_chunk_is_reported() {
        let series = series_with(|z, _, _| if z == 3 || z == 6 { f32::NAN } else { 1.0 }, 8);
        let geometry = geometry(&series, VoxelSize::new(1.0, 1.0, 1.0).unwrap());

        for _ in 0..10 {
            let err = AggregationScheduler::new(Some(4))
                .run(&series, geometry)
                .unwrap_err();
            match err {
                SchedulerError::WorkerFailure { chunk, source } => {
                    assert_eq!(chunk, 1);
                    assert!(source.to_string().contains("slice-3"));
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn chunks_after_a_failure_are_cancelled() {
        let series = series_with(|_, _, _| 1.0, 4);
        let geometry = geometry(&series, VoxelSize::new(1.0, 1.0, 100.0).unwrap());
        let chunk = series.slices();

        let failed_below = AtomicUsize::new(0);
        let outcome = AggregationScheduler::accumulate_chunk(1, chunk, geometry, &failed_below);
        assert!(matches!(outcome, ChunkOutcome::Cancelled));

        // A failure above this chunk does not stop it.
        let failed_above = AtomicUsize::new(1);
        let outcome = AggregationScheduler::accumulate_chunk(0, chunk, geometry, &failed_above);
        match outcome {
            ChunkOutcome::Done(grid) => {
                assert_eq!(grid.cells().iter().map(|a| a.count).sum::<u64>(), 4 * 5 * 7);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(failed_above.load(Ordering::Acquire), 1);
    }

    #[test]
    fn failing_chunk_lowers_the_failure_marker() {
        let series = series_with(|z, _, _| if z == 2 { f32::NAN } else { 1.0 }, 4);
        let geometry = geometry(&series, VoxelSize::new(1.0, 1.0, 1.0).unwrap());

        let first_failure = AtomicUsize::new(usize::MAX);
        let outcome =
            AggregationScheduler::accumulate_chunk(3, series.slices(), geometry, &first_failure);
        assert!(matches!(
            outcome,
            ChunkOutcome::Failed(SchedulerError::WorkerFailure { chunk: 3, .. })
        ));
        assert_eq!(first_failure.load(Ordering::Acquire), 3);
    }

    #[test]
    fn grids_over_the_memory_limit_are_rejected() {
        let series = series_with(|_, _, _| 1.0, 4);
        let geometry = geometry(&series, VoxelSize::new(1.0, 1.0, 1.0).unwrap());
        let one_grid = geometry.memory_bytes().unwrap();

        let err = AggregationScheduler::new(Some(2))
            .with_memory_limit(Some(2 * one_grid - 1))
            .run(&series, geometry)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Grid(GridError::TooLarge { .. })));

        let grid = AggregationScheduler::new(Some(2))
            .with_memory_limit(Some(2 * one_grid))
            .run(&series, geometry)
            .unwrap();
        assert_eq!(grid.geometry().dims(), geometry.dims());
    }

    #[test]
    fn unallocatable_grid_fails_without_aborting() {
        let series = series_with(|_, _, _| 1.0, 2);
        let fine = 1.0 / 65536.0;
        let geometry = geometry(&series, VoxelSize::new(fine, fine, fine).unwrap());

        let err = AggregationScheduler::new(Some(2))
            .run(&series, geometry)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Grid(GridError::TooLarge { .. })));
    }

    #[test]
    fn zero_workers_falls_back_to_hardware() {
        assert!(AggregationScheduler::new(Some(0)).workers() >= 1);
        assert_eq!(AggregationScheduler::new(Some(5)).workers(), 5);
    }
}
