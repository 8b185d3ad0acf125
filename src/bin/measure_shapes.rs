use std::str::FromStr;
use std::time::Instant;

use clap::Parser;
use env_logger;
use image::{ImageBuffer, ImageReader, Luma};
use log::{info, warn};

use sdss_shape::{fixed_moments_flux, measure_adaptive_moments, AdaptiveMomentConfig,
                 ImageWithVariance, PixelSource, ShapeResult};

/// Measures SDSS adaptive moments of objects at given positions in an image.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Path of the image file to process.
    #[arg(short, long)]
    input: String,

    /// Approximate object position as X,Y in pixel coordinates (the center
    /// of the upper left pixel is 0,0). May be repeated.
    #[arg(short, long, required = true)]
    position: Vec<Position>,

    /// Background level subtracted from every pixel.
    #[arg(short, long, default_value_t = 0.0)]
    background: f64,

    /// Per-pixel noise variance. When given, errors are estimated for the
    /// measured moments.
    #[arg(short, long)]
    variance: Option<f32>,

    /// Use the looser convergence tolerances of production processing.
    #[arg(long, default_value_t = false)]
    production: std::primitive::bool,

    /// Largest allowed centroid shift in pixels (clamped to 2..10).
    #[arg(short, long, default_value_t = 1.0)]
    max_shift: f64,

    /// Also report the flux within the measured weight.
    #[arg(short, long, default_value_t = false)]
    fixed_flux: std::primitive::bool,
}

#[derive(Copy, Clone, Debug)]
struct Position {
    x: f64,
    y: f64,
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s.split_once(',')
            .ok_or_else(|| format!("expected X,Y but got '{}'", s))?;
        let x = x.trim().parse::<f64>().map_err(|e| format!("bad X '{}': {}", x, e))?;
        let y = y.trim().parse::<f64>().map_err(|e| format!("bad Y '{}': {}", y, e))?;
        Ok(Position{x, y})
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let img = ImageReader::open(&args.input).unwrap_or_else(|e| {
        panic!("Could not open '{}': {:?}", args.input, e);
    }).decode().unwrap_or_else(|e| {
        panic!("Could not decode '{}': {:?}", args.input, e);
    });
    let img_u16 = img.into_luma16();
    let (width, height) = img_u16.dimensions();
    info!("Image width x height: {}x{}", width, height);

    let mut config = if args.production {
        AdaptiveMomentConfig::production()
    } else {
        AdaptiveMomentConfig::default()
    };
    config.max_shift = args.max_shift;

    match args.variance {
        Some(variance) => {
            let variance_plane =
                ImageBuffer::<Luma<f32>, Vec<f32>>::from_pixel(width, height,
                                                               Luma([variance]));
            let with_variance = ImageWithVariance::new(&img_u16, &variance_plane)
                .unwrap_or_else(|e| panic!("{}", e));
            measure_positions(&with_variance, &args, &config);
        },
        None => measure_positions(&img_u16, &args, &config),
    }
}

fn measure_positions<P: PixelSource>(image: &P, args: &Args,
                                     config: &AdaptiveMomentConfig) {
    let measure_start = Instant::now();
    for position in &args.position {
        let result = measure_adaptive_moments(image, args.background,
                                              position.x, position.y, config);
        report(position, &result);
        if args.fixed_flux && result.success {
            let (flux, _) = fixed_moments_flux(image, args.background,
                                               position.x, position.y,
                                               &result.moments, config.max_radius);
            info!("  fixed moments flux {:.3}", flux);
        }
    }
    info!("Measured {} positions in {:?}",
          args.position.len(), measure_start.elapsed());
}

fn report(position: &Position, result: &ShapeResult) {
    if !result.success {
        warn!("({}, {}): measurement failed, flags {}",
              position.x, position.y, result.flags);
        return;
    }
    info!("({}, {}): centroid ({:.3}, {:.3}) Ixx {:.4} Ixy {:.4} Iyy {:.4} \
           amplitude {:.3} after {} iterations, flags {}",
          position.x, position.y, result.x, result.y,
          result.moments.ixx, result.moments.ixy, result.moments.iyy,
          result.amplitude, result.iterations, result.flags);
    if let Some(axes) = result.moments.to_axes() {
        info!("  axes a {:.4} b {:.4} theta {:.4}", axes.a, axes.b, axes.theta);
    }
    if let (Some(ixx_var), Some(iyy_var), Some(ixy_var)) =
        (result.ixx_variance(), result.iyy_variance(), result.ixy_variance())
    {
        info!("  errors Ixx {:.4} Iyy {:.4} Ixy {:.4}",
              ixx_var.sqrt(), iyy_var.sqrt(), ixy_var.sqrt());
    }
}
