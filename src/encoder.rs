use crate::rasterizer::OutputRaster;

use image::{ImageError, ImageFormat};
use std::{
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Failed to encode {}: {reason}", .path.display())]
    Encode { path: PathBuf, reason: String },

    #[error("Permission denied writing {}", .0.display())]
    WritePermissionDenied(PathBuf),

    #[error("IO error writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EncodeError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            EncodeError::WritePermissionDenied(path.to_path_buf())
        } else {
            EncodeError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Writes an [`OutputRaster`] to disk.
pub trait RasterEncoder: Send + Sync {
    fn encode(&self, raster: &OutputRaster, path: &Path) -> Result<(), EncodeError>;
}

/// Lossless grayscale PNG at the raster's bit depth.
///
/// The image is written to a temporary file next to `path` and renamed into
/// place, so a failed run never leaves a truncated file behind.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngEncoder;

impl RasterEncoder for PngEncoder {
    fn encode(&self, raster: &OutputRaster, path: &Path) -> Result<(), EncodeError> {
        let image = raster
            .to_image()
            .ok_or_else(|| EncodeError::Encode {
                path: path.to_path_buf(),
                reason: format!("canvas {}x{} is too large", raster.width(), raster.height()),
            })?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(dir).map_err(|e| EncodeError::from_io(path, e))?;

        let mut writer = BufWriter::new(temp);
        image
            .write_to(&mut writer, ImageFormat::Png)
            .map_err(|e| match e {
                ImageError::IoError(source) => EncodeError::from_io(path, source),
                other => EncodeError::Encode {
                    path: path.to_path_buf(),
                    reason: other.to_string(),
                },
            })?;
        writer.flush().map_err(|e| EncodeError::from_io(path, e))?;
        let temp = writer
            .into_inner()
            .map_err(|e| EncodeError::from_io(path, e.into_error()))?;

        temp.persist(path)
            .map_err(|e| EncodeError::from_io(path, e.error))?;

        info!(
            file = %path.display(),
            width = raster.width(),
            height = raster.height(),
            bits = raster.bit_depth().bits(),
            "wrote raster"
        );
        Ok(())
    }
}
