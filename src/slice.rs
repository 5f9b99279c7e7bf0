use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, s};
use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Offset of the `DICM` magic code in a Part 10 file.
const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Error)]
pub enum SliceDecodeError {
    #[error("Unsupported format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Corrupt file {}: {reason}", .path.display())]
    CorruptFile { path: PathBuf, reason: String },

    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SliceDecodeError {
    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        SliceDecodeError::CorruptFile {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// One decoded 2D image and its placement in patient space.
///
/// Pixels are stored row-major as `(rows, columns)`. The position anchors the
/// corner of the first transmitted pixel; the slice occupies
/// `[z, z + thickness)` along the third axis.
#[derive(Debug, Clone)]
pub struct SliceRecord {
    source: PathBuf,
    pixels: Array2<f32>,
    spacing: (f64, f64),
    position: [f64; 3],
    thickness: f64,
}

impl SliceRecord {
    /// Build a slice record, validating its geometry.
    ///
    /// # Arguments
    ///
    /// * `source` - File the slice was decoded from (used in error messages)
    /// * `pixels` - Intensity buffer, `(rows, columns)`
    /// * `spacing` - In-plane pixel size in mm as `(x, y)`
    /// * `position` - Physical position of the slice origin corner
    /// * `thickness` - Extent along the third axis in mm
    ///
    /// # Errors
    ///
    /// Returns [`SliceDecodeError::CorruptFile`] for empty buffers and
    /// non-positive or non-finite geometry.
    pub fn new(
        source: impl Into<PathBuf>,
        pixels: Array2<f32>,
        spacing: (f64, f64),
        position: [f64; 3],
        thickness: f64,
    ) -> Result<Self, SliceDecodeError> {
        let source = source.into();
        if pixels.is_empty() {
            return Err(SliceDecodeError::corrupt(&source, "empty pixel buffer"));
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(spacing.0) || !positive(spacing.1) {
            return Err(SliceDecodeError::corrupt(
                &source,
                format!("invalid pixel spacing {spacing:?}"),
            ));
        }
        if !positive(thickness) {
            return Err(SliceDecodeError::corrupt(
                &source,
                format!("invalid slice thickness {thickness}"),
            ));
        }
        if position.iter().any(|p| !p.is_finite()) {
            return Err(SliceDecodeError::corrupt(
                &source,
                format!("invalid position {position:?}"),
            ));
        }
        Ok(Self {
            source,
            pixels,
            spacing,
            position,
            thickness,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn pixels(&self) -> &Array2<f32> {
        &self.pixels
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    /// In-plane pixel size `(x, y)` in mm
    pub fn spacing(&self) -> (f64, f64) {
        self.spacing
    }

    pub fn position(&self) -> [f64; 3] {
        self.position
    }

    pub fn z(&self) -> f64 {
        self.position[2]
    }

    pub fn thickness(&self) -> f64 {
        self.thickness
    }

    /// Physical size covered by the slice along each axis.
    pub fn extent(&self) -> [f64; 3] {
        [
            self.width() as f64 * self.spacing.0,
            self.height() as f64 * self.spacing.1,
            self.thickness,
        ]
    }
}

/// Turns one file into a [`SliceRecord`].
pub trait SliceDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<SliceRecord, SliceDecodeError>;
}

impl<T: SliceDecoder + ?Sized> SliceDecoder for &T {
    fn decode(&self, path: &Path) -> Result<SliceRecord, SliceDecodeError> {
        (**self).decode(path)
    }
}

/// Decodes single-frame DICOM Part 10 files.
///
/// Only the first frame and first sample are used. The modality rescale is
/// applied; no VOI LUT is, so the stored intensities keep their full range.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomSliceDecoder;

impl DicomSliceDecoder {
    fn has_magic(path: &Path) -> Result<bool, SliceDecodeError> {
        let io_err = |source| SliceDecodeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut header = [0u8; PREAMBLE_LEN + 4];
        let mut file = File::open(path).map_err(io_err)?;
        match file.read_exact(&mut header) {
            Ok(()) => Ok(&header[PREAMBLE_LEN..] == MAGIC),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(io_err(e)),
        }
    }

    fn decode_image(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        path: &Path,
    ) -> Result<Array2<f32>, SliceDecodeError> {
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|e| SliceDecodeError::corrupt(path, e.to_string()))?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
            .map_err(|e| SliceDecodeError::corrupt(path, e.to_string()))
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<[f64; 3]> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        match pos.as_slice() {
            [x, y, z, ..] => Some([*x, *y, *z]),
            _ => None,
        }
    }

    fn get_spacing(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<(f64, f64)> {
        let pixel_spacing = dicom_object
            .element(tags::PIXEL_SPACING)
            .ok()?
            .to_multi_float64()
            .ok()?;
        // PixelSpacing is stored as row spacing (y) then column spacing (x)
        match pixel_spacing.as_slice() {
            [row, column, ..] => Some((*column, *row)),
            _ => None,
        }
    }

    fn get_thickness(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<f64> {
        [tags::SLICE_THICKNESS, tags::SPACING_BETWEEN_SLICES]
            .into_iter()
            .find_map(|tag| dicom_object.element(tag).ok()?.to_float64().ok())
    }
}

impl SliceDecoder for DicomSliceDecoder {
    fn decode(&self, path: &Path) -> Result<SliceRecord, SliceDecodeError> {
        if !Self::has_magic(path)? {
            return Err(SliceDecodeError::UnsupportedFormat(path.to_path_buf()));
        }
        let dicom_object =
            open_file(path).map_err(|e| SliceDecodeError::corrupt(path, e.to_string()))?;

        let position = Self::get_position(&dicom_object)
            .ok_or_else(|| SliceDecodeError::corrupt(path, "missing ImagePositionPatient"))?;
        let spacing = Self::get_spacing(&dicom_object)
            .ok_or_else(|| SliceDecodeError::corrupt(path, "missing PixelSpacing"))?;
        let thickness = Self::get_thickness(&dicom_object)
            .ok_or_else(|| SliceDecodeError::corrupt(path, "missing SliceThickness"))?;
        let pixels = Self::decode_image(&dicom_object, path)?;

        SliceRecord::new(path, pixels, spacing, position, thickness)
    }
}
