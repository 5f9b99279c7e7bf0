use serde::{Deserialize, Serialize};

/// Statistic computed for every voxel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    #[default]
    Mean,
    StdDev,
}

/// Denominator used when turning an accumulator into a variance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarianceNormalization {
    /// Divide by `count`.
    #[default]
    Population,
    /// Divide by `count - 1` (Bessel's correction).
    Sample,
}

/// Bits per sample of the output raster.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitDepth {
    Eight,
    #[default]
    Sixteen,
}

impl BitDepth {
    /// Largest representable sample value.
    pub fn max_value(self) -> u16 {
        match self {
            BitDepth::Eight => u8::MAX as u16,
            BitDepth::Sixteen => u16::MAX,
        }
    }

    /// Value that uniform (zero-range) volumes are mapped to.
    pub fn midpoint(self) -> u16 {
        ((self.max_value() as u32 + 1) / 2) as u16
    }

    pub fn bits(self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }
}

impl TryFrom<u8> for BitDepth {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(BitDepth::Eight),
            16 => Ok(BitDepth::Sixteen),
            other => Err(format!("unsupported bit depth {other}, expected 8 or 16")),
        }
    }
}

impl From<BitDepth> for u8 {
    fn from(depth: BitDepth) -> Self {
        depth.bits()
    }
}
