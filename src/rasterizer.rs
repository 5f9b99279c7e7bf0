use crate::{enums::BitDepth, reducer::FinalizedGrid};

use image::{DynamicImage, ImageBuffer, Luma};
use rayon::prelude::*;
use tracing::{debug, warn};

/// How the 3D grid is tiled onto the 2D canvas.
///
/// Each z layer becomes one `nx` x `ny` tile; tiles are placed left to right
/// in ascending `iz` order, so voxel `(ix, iy, iz)` lands at canvas pixel
/// `(iz * nx + ix, iy)` and the canvas is `(nx * nz)` x `ny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterLayout {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl RasterLayout {
    pub fn new((nx, ny, nz): (usize, usize, usize)) -> Self {
        Self { nx, ny, nz }
    }

    pub fn width(&self) -> usize {
        self.nx * self.nz
    }

    pub fn height(&self) -> usize {
        self.ny
    }

    pub fn canvas_position(&self, ix: usize, iy: usize, iz: usize) -> (usize, usize) {
        (iz * self.nx + ix, iy)
    }

    /// Inverse of [`canvas_position`](Self::canvas_position).
    pub fn voxel_at(&self, x: usize, y: usize) -> Option<(usize, usize, usize)> {
        (x < self.width() && y < self.height()).then(|| (x % self.nx, y, x / self.nx))
    }
}

/// Mapping from finalized values to output samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuantizeRange {
    /// No voxel holds data; everything maps to 0.
    Empty,
    /// All voxels with data share one value, mapped to the output midpoint.
    Degenerate { value: f64 },
    Linear { min: f64, max: f64 },
}

/// Quantized canvas ready for encoding.
#[derive(Debug, Clone)]
pub struct OutputRaster {
    layout: RasterLayout,
    bit_depth: BitDepth,
    range: QuantizeRange,
    samples: Vec<u16>,
}

impl OutputRaster {
    pub fn width(&self) -> usize {
        self.layout.width()
    }

    pub fn height(&self) -> usize {
        self.layout.height()
    }

    pub fn layout(&self) -> RasterLayout {
        self.layout
    }

    pub fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    pub fn range(&self) -> QuantizeRange {
        self.range
    }

    /// Row-major samples, `width * height` long.
    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub fn get(&self, x: usize, y: usize) -> Option<u16> {
        (x < self.width() && y < self.height()).then(|| self.samples[y * self.width() + x])
    }

    /// Grayscale image at the raster's bit depth; `None` if the canvas does
    /// not fit an image buffer.
    pub fn to_image(&self) -> Option<DynamicImage> {
        let width = u32::try_from(self.width()).ok()?;
        let height = u32::try_from(self.height()).ok()?;
        match self.bit_depth {
            BitDepth::Eight => {
                let pixel_data: Vec<u8> = self.samples.iter().map(|&s| s as u8).collect();
                ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixel_data)
                    .map(DynamicImage::ImageLuma8)
            }
            BitDepth::Sixteen => {
                ImageBuffer::<Luma<u16>, _>::from_raw(width, height, self.samples.clone())
                    .map(DynamicImage::ImageLuma16)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Rasterizer {
    bit_depth: BitDepth,
}

impl Rasterizer {
    pub fn new(bit_depth: BitDepth) -> Self {
        Self { bit_depth }
    }

    pub fn rasterize(&self, grid: &FinalizedGrid) -> OutputRaster {
        let layout = RasterLayout::new(grid.dims());
        let range = match grid.value_range() {
            None => QuantizeRange::Empty,
            Some((min, max)) if min == max => {
                warn!(
                    value = min,
                    "degenerate intensity range, using output midpoint"
                );
                QuantizeRange::Degenerate { value: min }
            }
            Some((min, max)) => QuantizeRange::Linear { min, max },
        };
        debug!(width = layout.width(), height = layout.height(), ?range, "rasterizing");

        let values = grid.values();
        let bit_depth = self.bit_depth;
        let width = layout.width();
        let samples: Vec<u16> = (0..layout.height())
            .into_par_iter()
            .flat_map_iter(|y| {
                (0..width).map(move |x| {
                    let (ix, iy, iz) = (x % layout.nx, y, x / layout.nx);
                    Self::quantize(values[[iz, iy, ix]], range, bit_depth)
                })
            })
            .collect();

        OutputRaster {
            layout,
            bit_depth,
            range,
            samples,
        }
    }

    #[inline]
    fn quantize(value: Option<f64>, range: QuantizeRange, bit_depth: BitDepth) -> u16 {
        let Some(value) = value else {
            return 0;
        };
        match range {
            QuantizeRange::Empty => 0,
            QuantizeRange::Degenerate { .. } => bit_depth.midpoint(),
            QuantizeRange::Linear { min, max } => {
                let max_out = bit_depth.max_value() as f64;
                ((value - min) / (max - min) * max_out)
                    .round()
                    .clamp(0.0, max_out) as u16
            }
        }
    }
}
