//! dicom-voxelize - reduce a DICOM series to per-voxel statistics
//!
//! Exit codes:
//!   0 - The output image was written
//!   1 - Any failure (bad arguments, unreadable series, encode error)

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use dicom_voxelize::{
    Aggregation, BitDepth, EngineConfig, VarianceNormalization, VoxelizeRequest, voxelize,
};
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Voxelize a folder of DICOM slices into a PNG of per-voxel means or
/// standard deviations.
///
/// Voxel sizes are given in millimeters. The z layers of the voxel grid are
/// tiled left to right into a single image.
///
/// Examples:
///   dicom-voxelize --voxelize-mean 20 20 20 --input-folder images/folder1 --output-file folder1.means.png
///   dicom-voxelize --voxelize-stddev 20 20 20 --input-folder images/folder1 --output-file folder1.stddev.png
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("operation")
        .required(true)
        .args(["voxelize_mean", "voxelize_stddev"])
))]
pub struct Args {
    /// Compute the pixel mean of every voxel
    #[arg(
        long,
        num_args = 3,
        value_names = ["X_MM", "Y_MM", "Z_MM"],
        allow_negative_numbers = true
    )]
    pub voxelize_mean: Option<Vec<f64>>,

    /// Compute the pixel standard deviation of every voxel
    #[arg(
        long,
        num_args = 3,
        value_names = ["X_MM", "Y_MM", "Z_MM"],
        allow_negative_numbers = true
    )]
    pub voxelize_stddev: Option<Vec<f64>>,

    /// Folder containing the slices of one series
    #[arg(long, value_name = "DIR")]
    pub input_folder: PathBuf,

    /// Output image (PNG container)
    #[arg(long, value_name = "FILE")]
    pub output_file: PathBuf,

    /// Bits per output sample (8 or 16)
    #[arg(long, value_name = "BITS", value_parser = parse_bit_depth)]
    pub bit_depth: Option<BitDepth>,

    /// Worker threads (defaults to the number of hardware threads)
    #[arg(long, value_name = "NUM", env = "DICOM_VOXELIZE_WORKERS")]
    pub workers: Option<usize>,

    /// Upper bound on accumulator memory across all workers, in MiB
    #[arg(long, value_name = "MIB")]
    pub max_grid_memory_mb: Option<usize>,

    /// Use sample (n - 1) instead of population variance for standard deviation
    #[arg(long)]
    pub sample_variance: bool,

    /// Fail on the first file that cannot be decoded instead of skipping it
    #[arg(long)]
    pub strict: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

fn parse_bit_depth(s: &str) -> Result<BitDepth, String> {
    let bits: u8 = s.parse().map_err(|_| format!("invalid bit depth '{s}'"))?;
    BitDepth::try_from(bits)
}

impl Args {
    fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    fn request(&self) -> Result<VoxelizeRequest> {
        let (aggregation, sizes) = match (&self.voxelize_mean, &self.voxelize_stddev) {
            (Some(sizes), _) => (Aggregation::Mean, sizes),
            (None, Some(sizes)) => (Aggregation::StdDev, sizes),
            (None, None) => bail!("one of --voxelize-mean or --voxelize-stddev is required"),
        };
        let &[x, y, z] = sizes.as_slice() else {
            bail!("expected three voxel dimensions, got {}", sizes.len());
        };
        Ok(VoxelizeRequest {
            input_dir: self.input_folder.clone(),
            output_file: self.output_file.clone(),
            voxel_size: [x, y, z],
            aggregation,
        })
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(bit_depth) = self.bit_depth {
            config.bit_depth = bit_depth;
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        if self.max_grid_memory_mb.is_some() {
            config.max_grid_memory_mb = self.max_grid_memory_mb;
        }
        if self.sample_variance {
            config.variance = VarianceNormalization::Sample;
        }
        if self.strict {
            config.loader.strict = true;
        }
        Ok(config)
    }
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run(args: &Args) -> Result<()> {
    let config = args.engine_config()?;
    debug!(?config, "engine configuration");
    let request = args.request()?;

    let summary = voxelize(&request, &config)
        .with_context(|| format!("Voxelization of {} failed", request.input_dir.display()))?;

    info!(
        slices = summary.slices,
        grid = ?summary.grid_dims,
        canvas = ?summary.canvas,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "wrote {}",
        request.output_file.display()
    );
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(&args);
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(&args) {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mean_operation() {
        let args = Args::try_parse_from([
            "dicom-voxelize",
            "--voxelize-mean",
            "20",
            "20",
            "2.5",
            "--input-folder",
            "images/folder1",
            "--output-file",
            "out.png",
        ])
        .unwrap();
        let request = args.request().unwrap();
        assert_eq!(request.aggregation, Aggregation::Mean);
        assert_eq!(request.voxel_size, [20.0, 20.0, 2.5]);
        assert_eq!(request.input_dir, PathBuf::from("images/folder1"));
    }

    #[test]
    fn negative_sizes_reach_the_engine() {
        let args = Args::try_parse_from([
            "dicom-voxelize",
            "--voxelize-stddev",
            "1",
            "-1",
            "1",
            "--input-folder",
            "in",
            "--output-file",
            "out.png",
        ])
        .unwrap();
        let request = args.request().unwrap();
        assert_eq!(request.aggregation, Aggregation::StdDev);
        assert_eq!(request.voxel_size, [1.0, -1.0, 1.0]);
    }

    #[test]
    fn requires_exactly_one_operation() {
        let missing = Args::try_parse_from([
            "dicom-voxelize",
            "--input-folder",
            "in",
            "--output-file",
            "out.png",
        ]);
        assert!(missing.is_err());

        let both = Args::try_parse_from([
            "dicom-voxelize",
            "--voxelize-mean",
            "1",
            "1",
            "1",
            "--voxelize-stddev",
            "1",
            "1",
            "1",
            "--input-folder",
            "in",
            "--output-file",
            "out.png",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn flags_override_config() {
        let args = Args::try_parse_from([
            "dicom-voxelize",
            "--voxelize-mean",
            "1",
            "1",
            "1",
            "--input-folder",
            "in",
            "--output-file",
            "out.png",
            "--bit-depth",
            "8",
            "--sample-variance",
            "--workers",
            "2",
            "--max-grid-memory-mb",
            "512",
        ])
        .unwrap();
        let config = args.engine_config().unwrap();
        assert_eq!(config.bit_depth, BitDepth::Eight);
        assert_eq!(config.variance, VarianceNormalization::Sample);
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.max_grid_memory_mb, Some(512));
    }

    #[test]
    fn rejects_unsupported_bit_depth() {
        let args = Args::try_parse_from([
            "dicom-voxelize",
            "--voxelize-mean",
            "1",
            "1",
            "1",
            "--input-folder",
            "in",
            "--output-file",
            "out.png",
            "--bit-depth",
            "12",
        ]);
        assert!(args.is_err());
    }
}
