use crate::{
    config::EngineConfig,
    encoder::{EncodeError, PngEncoder, RasterEncoder},
    enums::Aggregation,
    rasterizer::{QuantizeRange, Rasterizer},
    reducer::Reducer,
    scheduler::{AggregationScheduler, SchedulerError},
    series_loader::{SeriesLoader, SeriesLoaderError},
    slice::{DicomSliceDecoder, SliceDecodeError, SliceDecoder},
    spatial_index::SpatialIndex,
    voxel_grid::{AccumulateError, GridError, GridGeometry, VoxelSize},
};

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum VoxelizeError {
    #[error("DirectoryNotFound: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("EmptySeries: no decodable slices in {}", .0.display())]
    EmptySeries(PathBuf),

    #[error("EmptySeries: no slices to voxelize")]
    NoSlices,

    #[error("InconsistentGeometry: {} {reason}", .path.display())]
    InconsistentGeometry { path: PathBuf, reason: String },

    #[error("InvalidVoxelSize: {value} along {axis} axis must be positive")]
    InvalidVoxelSize { axis: char, value: f64 },

    #[error("GridTooLarge: {nx}x{ny}x{nz} voxels")]
    GridTooLarge { nx: usize, ny: usize, nz: usize },

    #[error("WorkerFailure: chunk {chunk}: {source}")]
    WorkerFailure {
        chunk: usize,
        #[source]
        source: AccumulateError,
    },

    #[error("SliceDecode: {0}")]
    SliceDecode(#[source] SliceDecodeError),

    #[error("EncodeError: {0}")]
    Encode(#[from] EncodeError),

    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to start workers: {0}")]
    ThreadPool(#[source] rayon::ThreadPoolBuildError),
}

impl From<SeriesLoaderError> for VoxelizeError {
    fn from(e: SeriesLoaderError) -> Self {
        match e {
            SeriesLoaderError::DirectoryNotFound(path) => VoxelizeError::DirectoryNotFound(path),
            SeriesLoaderError::EmptySeries(path) => VoxelizeError::EmptySeries(path),
            SeriesLoaderError::NoSlices => VoxelizeError::NoSlices,
            SeriesLoaderError::InconsistentGeometry { path, reason } => {
                VoxelizeError::InconsistentGeometry { path, reason }
            }
            SeriesLoaderError::SliceDecode(e) => VoxelizeError::SliceDecode(e),
            SeriesLoaderError::Io(e) => VoxelizeError::Io(e),
        }
    }
}

impl From<GridError> for VoxelizeError {
    fn from(e: GridError) -> Self {
        match e {
            GridError::InvalidVoxelSize { axis, value } => {
                VoxelizeError::InvalidVoxelSize { axis, value }
            }
            GridError::TooLarge { nx, ny, nz } => VoxelizeError::GridTooLarge { nx, ny, nz },
        }
    }
}

impl From<SchedulerError> for VoxelizeError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::WorkerFailure { chunk, source } => {
                VoxelizeError::WorkerFailure { chunk, source }
            }
            SchedulerError::Grid(e) => e.into(),
            SchedulerError::ThreadPool(e) => VoxelizeError::ThreadPool(e),
        }
    }
}

/// One voxelization run.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelizeRequest {
    pub input_dir: PathBuf,
    pub output_file: PathBuf,
    /// Voxel size in mm as `[x, y, z]`, in the units of the slice metadata.
    pub voxel_size: [f64; 3],
    pub aggregation: Aggregation,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub slices: usize,
    pub grid_dims: (usize, usize, usize),
    pub canvas: (usize, usize),
    pub range: QuantizeRange,
    /// Voxel layers whose center no slice covers.
    pub uncovered_layers: usize,
    pub workers: usize,
    pub elapsed: Duration,
}

/// Runs the whole pipeline with injected decode and encode collaborators.
pub struct Voxelizer<D, E> {
    decoder: D,
    encoder: E,
    config: EngineConfig,
}

impl Voxelizer<DicomSliceDecoder, PngEncoder> {
    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(DicomSliceDecoder, PngEncoder, config)
    }
}

impl<D: SliceDecoder, E: RasterEncoder> Voxelizer<D, E> {
    pub fn new(decoder: D, encoder: E, config: EngineConfig) -> Self {
        Self {
            decoder,
            encoder,
            config,
        }
    }

    /// Load the series, aggregate it and write exactly one output raster.
    ///
    /// # Errors
    ///
    /// Voxel sizes are checked before anything is read. The output file is
    /// only written once the whole grid has been finalized.
    pub fn run(&self, request: &VoxelizeRequest) -> Result<RunSummary, VoxelizeError> {
        let start = Instant::now();
        let [x, y, z] = request.voxel_size;
        let voxel = VoxelSize::new(x, y, z)?;

        let loader = SeriesLoader::new(&self.decoder, self.config.loader.clone());
        let series = loader.load_from_directory(&request.input_dir)?;

        let index = SpatialIndex::new(&series);
        let bounds = index.bounds();
        let geometry = GridGeometry::from_bounds(bounds, voxel)?;
        info!(
            min = ?bounds.min,
            max = ?bounds.max,
            dims = ?geometry.dims(),
            "voxel grid"
        );

        let uncovered_layers = count_uncovered_layers(&index, &geometry);
        if uncovered_layers > 0 {
            warn!(
                uncovered_layers,
                "voxel layers fall between slices and may hold no data"
            );
        }

        let scheduler = AggregationScheduler::new(self.config.workers)
            .with_memory_limit(self.config.max_grid_memory_bytes());
        let grid = scheduler.run(&series, geometry)?;

        let finalized = Reducer::new(request.aggregation, self.config.variance).finalize(grid);
        let raster = Rasterizer::new(self.config.bit_depth).rasterize(&finalized);
        self.encoder.encode(&raster, &request.output_file)?;

        let summary = RunSummary {
            slices: series.len(),
            grid_dims: geometry.dims(),
            canvas: (raster.width(), raster.height()),
            range: raster.range(),
            uncovered_layers,
            workers: scheduler.workers(),
            elapsed: start.elapsed(),
        };
        info!(?summary, "voxelization complete");
        Ok(summary)
    }
}

/// Count z layers of `geometry` whose center lies in no slice.
fn count_uncovered_layers(index: &SpatialIndex<'_>, geometry: &GridGeometry) -> usize {
    let (_, _, nz) = geometry.dims();
    let origin_z = geometry.origin()[2];
    let voxel_z = geometry.voxel().z;
    (0..nz)
        .filter(|&iz| {
            let center = origin_z + (iz as f64 + 0.5) * voxel_z;
            index.locate(center).is_none()
        })
        .count()
}

/// Voxelize a directory of DICOM slices into a PNG.
pub fn voxelize(
    request: &VoxelizeRequest,
    config: &EngineConfig,
) -> Result<RunSummary, VoxelizeError> {
    Voxelizer::with_config(config.clone()).run(request)
}
