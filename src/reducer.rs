use crate::{
    enums::{Aggregation, VarianceNormalization},
    voxel_grid::{GridGeometry, VoxelGrid},
};

use ndarray::{Array3, Zip};

/// Per-voxel scalars, `(nz, ny, nx)`. `None` marks voxels no slice reached.
#[derive(Debug, Clone)]
pub struct FinalizedGrid {
    geometry: GridGeometry,
    values: Array3<Option<f64>>,
}

impl FinalizedGrid {
    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn values(&self) -> &Array3<Option<f64>> {
        &self.values
    }

    /// Grid dimensions `(nx, ny, nz)`
    pub fn dims(&self) -> (usize, usize, usize) {
        self.geometry.dims()
    }

    pub fn get(&self, ix: usize, iy: usize, iz: usize) -> Option<f64> {
        self.values.get([iz, iy, ix]).copied().flatten()
    }

    /// Smallest and largest value over voxels that hold data.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.values
            .iter()
            .flatten()
            .fold(None, |range, &v| match range {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Reducer {
    aggregation: Aggregation,
    normalization: VarianceNormalization,
}

impl Reducer {
    pub fn new(aggregation: Aggregation, normalization: VarianceNormalization) -> Self {
        Self {
            aggregation,
            normalization,
        }
    }

    /// Turn every accumulator into its mean or standard deviation.
    pub fn finalize(&self, grid: VoxelGrid) -> FinalizedGrid {
        let (geometry, cells) = grid.into_parts();
        let (aggregation, normalization) = (self.aggregation, self.normalization);
        let values =
            Zip::from(&cells).par_map_collect(|acc| acc.finalize(aggregation, normalization));
        FinalizedGrid { geometry, values }
    }
}

#[cfg(test)]
pub(crate) fn finalized_from_values(values: Array3<Option<f64>>) -> FinalizedGrid {
    use crate::{spatial_index::BoundingBox, voxel_grid::VoxelSize};

    let (nz, ny, nx) = values.dim();
    let bounds = BoundingBox {
        min: [0.0; 3],
        max: [nx as f64, ny as f64, nz as f64],
    };
    let voxel = VoxelSize::new(1.0, 1.0, 1.0).unwrap();
    FinalizedGrid {
        geometry: GridGeometry::from_bounds(bounds, voxel).unwrap(),
        values,
    }
}
