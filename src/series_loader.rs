use crate::slice::{SliceDecodeError, SliceDecoder, SliceRecord};

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SeriesLoaderError {
    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("No decodable slices found in {}", .0.display())]
    EmptySeries(PathBuf),

    #[error("No slices to assemble into a series")]
    NoSlices,

    #[error("Inconsistent geometry in {}: {reason}", .path.display())]
    InconsistentGeometry { path: PathBuf, reason: String },

    #[error(transparent)]
    SliceDecode(#[from] SliceDecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options for discovering and validating a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderOptions {
    /// Largest tolerated in-plane spacing difference between slices, in mm.
    #[serde(default = "default_spacing_epsilon")]
    pub spacing_epsilon: f64,

    /// File extensions to consider (case-insensitive). Empty means every
    /// regular file in the directory.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Fail on the first undecodable file instead of skipping it.
    #[serde(default)]
    pub strict: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            spacing_epsilon: default_spacing_epsilon(),
            extensions: Vec::new(),
            strict: false,
        }
    }
}

fn default_spacing_epsilon() -> f64 {
    1e-4
}

/// Slices of one volume sorted by ascending z position.
#[derive(Debug, Clone)]
pub struct Series {
    slices: Vec<SliceRecord>,
}

impl Series {
    /// Sort and validate already decoded slices.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesLoaderError::NoSlices`] when `slices` is empty and
    /// [`SeriesLoaderError::InconsistentGeometry`] when a slice's size or
    /// in-plane spacing differs from the first slice.
    pub fn from_slices(
        mut slices: Vec<SliceRecord>,
        spacing_epsilon: f64,
    ) -> Result<Self, SeriesLoaderError> {
        if slices.is_empty() {
            return Err(SeriesLoaderError::NoSlices);
        }

        slices.sort_by(|a, b| {
            a.z()
                .total_cmp(&b.z())
                .then_with(|| a.source().cmp(b.source()))
        });

        Self::validate_geometry(&slices, spacing_epsilon)?;
        Ok(Self { slices })
    }

    fn validate_geometry(
        slices: &[SliceRecord],
        spacing_epsilon: f64,
    ) -> Result<(), SeriesLoaderError> {
        let first = &slices[0];
        let (first_w, first_h) = (first.width(), first.height());
        let (first_sx, first_sy) = first.spacing();

        for slice in &slices[1..] {
            let reason = if (slice.width(), slice.height()) != (first_w, first_h) {
                Some(format!(
                    "dimensions {}x{} differ from {}x{}",
                    slice.width(),
                    slice.height(),
                    first_w,
                    first_h
                ))
            } else {
                let (sx, sy) = slice.spacing();
                let differs = (sx - first_sx).abs() > spacing_epsilon
                    || (sy - first_sy).abs() > spacing_epsilon;
                differs.then(|| {
                    format!("pixel spacing ({sx}, {sy}) differs from ({first_sx}, {first_sy})")
                })
            };

            if let Some(reason) = reason {
                return Err(SeriesLoaderError::InconsistentGeometry {
                    path: slice.source().to_path_buf(),
                    reason,
                });
            }
        }
        Ok(())
    }

    pub fn slices(&self) -> &[SliceRecord] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Width and height shared by every slice.
    pub fn slice_dim(&self) -> (usize, usize) {
        (self.slices[0].width(), self.slices[0].height())
    }
}

pub struct SeriesLoader<D> {
    decoder: D,
    options: LoaderOptions,
}

impl<D: SliceDecoder> SeriesLoader<D> {
    pub fn new(decoder: D, options: LoaderOptions) -> Self {
        Self { decoder, options }
    }

    /// Load a series from a directory of slice files
    ///
    /// # Errors
    ///
    /// Returns error if the directory is missing, no slice decodes, or the
    /// slices disagree in geometry
    pub fn load_from_directory(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Series, SeriesLoaderError> {
        let path = path.as_ref();
        let paths = discover_slice_files(path, &self.options.extensions)?;
        info!(directory = %path.display(), files = paths.len(), "discovered slice files");

        self.load_from_file_paths(&paths).map_err(|e| match e {
            SeriesLoaderError::NoSlices => SeriesLoaderError::EmptySeries(path.to_path_buf()),
            other => other,
        })
    }

    /// Load a series from file paths
    ///
    /// # Errors
    ///
    /// Returns [`SeriesLoaderError::NoSlices`] when none of `paths` decodes.
    pub fn load_from_file_paths(
        &self,
        paths: &[impl AsRef<Path>],
    ) -> Result<Series, SeriesLoaderError> {
        let mut slices = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            match self.decoder.decode(path) {
                Ok(slice) => {
                    debug!(file = %path.display(), z = slice.z(), "decoded slice");
                    slices.push(slice);
                }
                Err(e) if self.options.strict => return Err(e.into()),
                Err(e) => warn!("skipping {}: {}", path.display(), e),
            }
        }

        let series = Series::from_slices(slices, self.options.spacing_epsilon)?;
        let (width, height) = series.slice_dim();
        info!(slices = series.len(), width, height, "loaded series");
        Ok(series)
    }
}

/// List candidate slice files in `path`, sorted for a stable load order.
///
/// # Errors
///
/// Returns [`SeriesLoaderError::DirectoryNotFound`] if `path` is not a
/// directory.
pub fn discover_slice_files(
    path: &Path,
    extensions: &[String],
) -> Result<Vec<PathBuf>, SeriesLoaderError> {
    if !path.is_dir() {
        return Err(SeriesLoaderError::DirectoryNotFound(path.to_path_buf()));
    }

    let mut paths: Vec<_> = fs::read_dir(path)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            extensions.is_empty()
                || path
                    .extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        })
        .collect();
    paths.sort();
    Ok(paths)
}
