use crate::{
    enums::{Aggregation, VarianceNormalization},
    spatial_index::BoundingBox,
    slice::SliceRecord,
};

use ndarray::{Array3, Zip};
use std::{ops::Range, path::PathBuf};
use thiserror::Error;

/// Slack, in mm, absorbed when mapping physical coordinates onto bins.
const BIN_TOLERANCE_MM: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("Invalid voxel size {value} along {axis} axis")]
    InvalidVoxelSize { axis: char, value: f64 },

    #[error("Voxel grid {nx}x{ny}x{nz} is too large")]
    TooLarge { nx: usize, ny: usize, nz: usize },
}

#[derive(Debug, Error)]
pub enum AccumulateError {
    #[error("Non-finite pixel value {value} at row {row}, column {column} in {}", .path.display())]
    NonFiniteSample {
        path: PathBuf,
        row: usize,
        column: usize,
        value: f32,
    },
}

/// Requested physical size of one voxel, in mm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl VoxelSize {
    /// # Errors
    ///
    /// Returns [`GridError::InvalidVoxelSize`] for the first dimension that is
    /// zero, negative or not finite.
    pub fn new(x: f64, y: f64, z: f64) -> Result<Self, GridError> {
        for (axis, value) in [('x', x), ('y', y), ('z', z)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(GridError::InvalidVoxelSize { axis, value });
            }
        }
        Ok(Self { x, y, z })
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Placement and size of the voxel grid in physical space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    origin: [f64; 3],
    extent: [f64; 3],
    voxel: VoxelSize,
    dims: (usize, usize, usize),
}

impl GridGeometry {
    /// Size a grid so that it covers `bounds` with as few voxels as possible.
    pub fn from_bounds(bounds: BoundingBox, voxel: VoxelSize) -> Result<Self, GridError> {
        let extent = bounds.extent();
        let sizes = voxel.as_array();
        let nx = Self::cells_along(extent[0], sizes[0]);
        let ny = Self::cells_along(extent[1], sizes[1]);
        let nz = Self::cells_along(extent[2], sizes[2]);

        let geometry = Self {
            origin: bounds.min,
            extent,
            voxel,
            dims: (nx, ny, nz),
        };
        geometry.memory_bytes().ok_or_else(|| geometry.too_large())?;
        Ok(geometry)
    }

    /// Smallest `n` with `n * size >= extent`.
    fn cells_along(extent: f64, size: f64) -> usize {
        let estimate = (extent / size).ceil();
        if !estimate.is_finite() || estimate >= usize::MAX as f64 {
            return usize::MAX;
        }
        let mut n = (estimate as usize).max(1);
        while (n as f64) * size < extent {
            n += 1;
        }
        while n > 1 && ((n - 1) as f64) * size >= extent {
            n -= 1;
        }
        n
    }

    /// Grid dimensions `(nx, ny, nz)`
    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn extent(&self) -> [f64; 3] {
        self.extent
    }

    pub fn voxel(&self) -> VoxelSize {
        self.voxel
    }

    pub fn len(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// Bytes taken by one grid of accumulators, `None` if that overflows.
    pub fn memory_bytes(&self) -> Option<usize> {
        let (nx, ny, nz) = self.dims;
        nx.checked_mul(ny)
            .and_then(|n| n.checked_mul(nz))
            .and_then(|n| n.checked_mul(std::mem::size_of::<Accumulator>()))
            .filter(|&bytes| bytes <= isize::MAX as usize)
    }

    pub(crate) fn too_large(&self) -> GridError {
        let (nx, ny, nz) = self.dims;
        GridError::TooLarge { nx, ny, nz }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bin_of(coordinate: f64, origin: f64, size: f64, count: usize) -> usize {
        let bin = ((coordinate - origin) / size + BIN_TOLERANCE_MM / size).floor();
        (bin.max(0.0) as usize).min(count - 1)
    }

    /// `ix` for every column of `slice`.
    pub fn x_bins(&self, slice: &SliceRecord) -> Vec<usize> {
        let (spacing_x, _) = slice.spacing();
        let x0 = slice.position()[0];
        (0..slice.width())
            .map(|col| {
                Self::bin_of(
                    x0 + col as f64 * spacing_x,
                    self.origin[0],
                    self.voxel.x,
                    self.dims.0,
                )
            })
            .collect()
    }

    /// `iy` for every row of `slice`.
    pub fn y_bins(&self, slice: &SliceRecord) -> Vec<usize> {
        let (_, spacing_y) = slice.spacing();
        let y0 = slice.position()[1];
        (0..slice.height())
            .map(|row| {
                Self::bin_of(
                    y0 + row as f64 * spacing_y,
                    self.origin[1],
                    self.voxel.y,
                    self.dims.1,
                )
            })
            .collect()
    }

    /// Every `iz` whose voxel interval overlaps the slice's `[z0, z0 + t)`.
    ///
    /// Bin `iz` spans `[origin_z + iz * voxel_z, origin_z + (iz + 1) * voxel_z)`.
    pub fn z_bins(&self, slice: &SliceRecord) -> Range<usize> {
        let nz = self.dims.2;
        let tolerance = BIN_TOLERANCE_MM / self.voxel.z;
        let lo = (slice.z() - self.origin[2]) / self.voxel.z;
        let hi = (slice.z() + slice.thickness() - self.origin[2]) / self.voxel.z;

        let start = ((lo + tolerance).floor().max(0.0) as usize).min(nz);
        // A slice thinner than the tolerance still lands in the bin it starts in.
        let end = ((hi - tolerance).ceil().max(0.0) as usize)
            .max(start + 1)
            .min(nz);
        start.min(end)..end
    }
}

/// Streaming statistics for one voxel.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Accumulator {
    pub count: u64,
    pub sum: f64,
    pub sum_of_squares: f64,
}

impl Accumulator {
    #[inline]
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_of_squares += value * value;
    }

    #[inline]
    pub fn merge(&mut self, other: &Accumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
    }

    /// Reduce to a scalar; `None` when no sample reached this voxel.
    pub fn finalize(
        &self,
        aggregation: Aggregation,
        normalization: VarianceNormalization,
    ) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        match aggregation {
            Aggregation::Mean => Some(mean),
            Aggregation::StdDev => {
                // Cancellation can leave a tiny negative value for uniform voxels.
                let population = (self.sum_of_squares / n - mean * mean).max(0.0);
                let variance = match normalization {
                    VarianceNormalization::Population => population,
                    VarianceNormalization::Sample if self.count > 1 => population * n / (n - 1.0),
                    VarianceNormalization::Sample => 0.0,
                };
                Some(variance.sqrt())
            }
        }
    }
}

/// Accumulators for every voxel, stored as `(nz, ny, nx)`.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    geometry: GridGeometry,
    cells: Array3<Accumulator>,
}

impl VoxelGrid {
    /// Allocate an empty grid.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::TooLarge`] when the accumulators cannot be
    /// allocated.
    pub fn new(geometry: GridGeometry) -> Result<Self, GridError> {
        let (nx, ny, nz) = geometry.dims();
        let len = geometry
            .memory_bytes()
            .map(|_| geometry.len())
            .ok_or_else(|| geometry.too_large())?;

        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| geometry.too_large())?;
        cells.resize(len, Accumulator::default());
        let cells =
            Array3::from_shape_vec((nz, ny, nx), cells).map_err(|_| geometry.too_large())?;

        Ok(Self { geometry, cells })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn cells(&self) -> &Array3<Accumulator> {
        &self.cells
    }

    pub fn get(&self, ix: usize, iy: usize, iz: usize) -> Option<&Accumulator> {
        self.cells.get([iz, iy, ix])
    }

    /// Feed every pixel of `slice` into the voxels it overlaps.
    ///
    /// Returns the number of samples pushed. A slice spanning several z bins
    /// contributes each pixel to all of them.
    ///
    /// # Errors
    ///
    /// Returns [`AccumulateError::NonFiniteSample`] on the first NaN or
    /// infinite pixel; the grid is then partially updated and must be dropped.
    pub fn accumulate_slice(&mut self, slice: &SliceRecord) -> Result<u64, AccumulateError> {
        let z_bins = self.geometry.z_bins(slice);
        if z_bins.is_empty() {
            return Ok(0);
        }
        let x_bins = self.geometry.x_bins(slice);
        let y_bins = self.geometry.y_bins(slice);

        let mut samples = 0;
        for ((row, column), &value) in slice.pixels().indexed_iter() {
            if !value.is_finite() {
                return Err(AccumulateError::NonFiniteSample {
                    path: slice.source().to_path_buf(),
                    row,
                    column,
                    value,
                });
            }
            let (ix, iy) = (x_bins[column], y_bins[row]);
            for iz in z_bins.clone() {
                self.cells[[iz, iy, ix]].push(value as f64);
                samples += 1;
            }
        }
        Ok(samples)
    }

    /// Add `other`'s accumulators into this grid cell by cell.
    pub fn merge(&mut self, other: &VoxelGrid) {
        debug_assert_eq!(self.geometry.dims(), other.geometry.dims());
        Zip::from(&mut self.cells)
            .and(&other.cells)
            .for_each(|a, b| a.merge(b));
    }

    pub(crate) fn into_parts(self) -> (GridGeometry, Array3<Accumulator>) {
        (self.geometry, self.cells)
    }
}
