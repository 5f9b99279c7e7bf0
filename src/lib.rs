//! # DICOM-voxelize library
//!
//! This crate reduces a DICOM series (a directory of 2D slices that together
//! form a scanned volume) into per-voxel statistics at a caller-chosen
//! physical resolution, and writes the result as a single grayscale image.
//!
//! The pipeline runs in stages:
//!  - [`series_loader`] decodes every slice and sorts the series by z
//!    position, rejecting series whose slices disagree in size or spacing
//!  - [`spatial_index`] derives the physical bounding box of the volume
//!  - [`voxel_grid`] sizes a grid of `(count, sum, sum_of_squares)`
//!    accumulators that covers the bounding box
//!  - [`scheduler`] accumulates slices in parallel using rayon, each worker
//!    into its own grid, and merges the grids once all workers have joined
//!  - [`reducer`] turns every accumulator into a mean or standard deviation
//!  - [`rasterizer`] tiles the z layers of the grid left to right into one
//!    canvas and quantizes it to 8 or 16 bits
//!
//! Slices are placed along the third axis by their `ImagePositionPatient`
//! and `SliceThickness`. A slice contributes to every voxel layer it
//! overlaps, so voxels thinner than a slice repeat its pixels and voxels
//! thicker than a slice average several of them.
//!
//! DICOM files are assumed to have the following attributes:
//!  - Images from the same series and acquisition
//!  - No multiframe (always the first frame is used)
//!
//! # Examples
//!
//! ## Mean intensity per 2cm cube
//!
//! ```no_run
//! # use dicom_voxelize::{voxelize, Aggregation, EngineConfig, VoxelizeRequest};
//! # use std::path::PathBuf;
//! let request = VoxelizeRequest {
//!     input_dir: PathBuf::from("dicom"),
//!     output_file: PathBuf::from("dicom.means.png"),
//!     voxel_size: [20.0, 20.0, 20.0],
//!     aggregation: Aggregation::Mean,
//! };
//! let summary = voxelize(&request, &EngineConfig::default())
//!     .expect("should have voxelized the series");
//! println!("{:?}", summary.grid_dims);
//! ```

pub mod config;
pub mod encoder;
pub mod engine;
pub mod enums;
pub mod rasterizer;
pub mod reducer;
pub mod scheduler;
pub mod series_loader;
pub mod slice;
pub mod spatial_index;
pub mod voxel_grid;

pub use config::EngineConfig;
pub use engine::{RunSummary, VoxelizeError, VoxelizeRequest, Voxelizer, voxelize};
pub use enums::{Aggregation, BitDepth, VarianceNormalization};
