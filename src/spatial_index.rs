use crate::{series_loader::Series, slice::SliceRecord};

/// Axis-aligned physical bounds of a series, in mm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn extent(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Physical placement of every slice in a [`Series`].
///
/// Slices are kept in ascending z order, so third-axis lookups are a binary
/// search over slice start positions.
pub struct SpatialIndex<'a> {
    series: &'a Series,
    starts: Vec<f64>,
    max_thickness: f64,
    bounds: BoundingBox,
}

impl<'a> SpatialIndex<'a> {
    pub fn new(series: &'a Series) -> Self {
        let slices = series.slices();
        let starts: Vec<f64> = slices.iter().map(SliceRecord::z).collect();
        let max_thickness = slices
            .iter()
            .map(SliceRecord::thickness)
            .fold(0.0, f64::max);

        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for slice in slices {
            let position = slice.position();
            let extent = slice.extent();
            for axis in 0..3 {
                min[axis] = min[axis].min(position[axis]);
                max[axis] = max[axis].max(position[axis] + extent[axis]);
            }
        }

        Self {
            series,
            starts,
            max_thickness,
            bounds: BoundingBox { min, max },
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    pub fn series(&self) -> &'a Series {
        self.series
    }

    /// Index of the slice covering third-axis coordinate `z`.
    ///
    /// A slice covers `[z0, z0 + thickness)`. When slices overlap the one
    /// with the greatest start position wins. Gaps between slices yield `None`.
    pub fn locate_index(&self, z: f64) -> Option<usize> {
        let slices = self.series.slices();
        // First slice starting strictly after z; candidates lie before it.
        let upper = self.starts.partition_point(|&start| start <= z);
        (0..upper)
            .rev()
            .take_while(|&i| self.starts[i] + self.max_thickness > z)
            .find(|&i| z < self.starts[i] + slices[i].thickness())
    }

    /// The slice covering third-axis coordinate `z`, if any.
    pub fn locate(&self, z: f64) -> Option<&'a SliceRecord> {
        let series = self.series;
        self.locate_index(z).map(|i| &series.slices()[i])
    }
}
