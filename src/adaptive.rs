//! Adaptive moments: the SDSS shape measurement.
//!
//! The object is multiplied by an elliptical Gaussian weight and the second
//! moments of the product are measured. The product of two Gaussians is a
//! Gaussian whose inverse covariance is the sum of the factors' inverse
//! covariances, so subtracting the weight's inverse covariance from that of
//! the product estimates the object's own. That estimate becomes the next
//! weight, and the process repeats until the weight matches the object.
//!
//! The iteration assumes a roughly Gaussian object. When it breaks down the
//! result falls back to unweighted moments and says so in its
//! [ShapeFlags]; callers must check the flags as well as `success`.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::f64::consts::PI;
use std::time::Instant;

use imageproc::rect::Rect;
use log::debug;
use nalgebra::Matrix4;

use crate::error::ShapeError;
use crate::fisher::{parameter_covariance, AMPLITUDE, IXX, IXY, IYY};
use crate::image_funcs::PixelSource;
use crate::moments::{accumulate_moments, AccumulationMode, MomentSums};
use crate::quadrupole::Quadrupole;
use crate::region::{select_region, DEFAULT_MAX_RADIUS};
use crate::weights::{compute_weights, should_interpolate, WeightParams,
                     SINGLE_PIXEL_MOMENT};

// The first weight tried: a moderately broad round Gaussian.
const INITIAL_WEIGHT_VARIANCE: f64 = 1.5;

/// Quality bits of a shape measurement.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ShapeFlags(u32);

impl ShapeFlags {
    /// The weighted fit failed; the moments are unweighted.
    pub const UNWEIGHTED: ShapeFlags = ShapeFlags(1 << 0);
    /// Even the unweighted moments could not be computed.
    pub const UNWEIGHTED_BAD: ShapeFlags = ShapeFlags(1 << 1);
    /// The iteration limit was reached.
    pub const MAXITER: ShapeFlags = ShapeFlags(1 << 2);
    /// The centroid moved further than the allowed maximum shift.
    pub const SHIFT: ShapeFlags = ShapeFlags(1 << 3);

    pub const fn empty() -> Self {
        ShapeFlags(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: ShapeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: ShapeFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for ShapeFlags {
    type Output = ShapeFlags;

    fn bitor(self, rhs: ShapeFlags) -> ShapeFlags {
        ShapeFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ShapeFlags {
    fn bitor_assign(&mut self, rhs: ShapeFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ShapeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [(ShapeFlags::UNWEIGHTED, "UNWEIGHTED"),
                     (ShapeFlags::UNWEIGHTED_BAD, "UNWEIGHTED_BAD"),
                     (ShapeFlags::MAXITER, "MAXITER"),
                     (ShapeFlags::SHIFT, "SHIFT")];
        let set: Vec<&str> = names.iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "OK")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Tuning of the adaptive moments iteration.
#[derive(Clone, Debug)]
pub struct AdaptiveMomentConfig {
    /// Maximum number of weight refinements before giving up.
    /// Default: 100
    pub max_iterations: usize,

    /// Convergence tolerance on the change of each ellipticity component
    /// between iterations.
    /// Default: 1e-5
    pub tol1: f64,

    /// Convergence tolerance on the fractional change of the weighted xx
    /// moment between iterations.
    /// Default: 1e-4
    pub tol2: f64,

    /// Largest centroid shift (pixels, each axis) not flagged with
    /// [ShapeFlags::SHIFT]. Clamped to [2, 10] when used.
    /// Default: 1 (hence effectively 2)
    pub max_shift: f64,

    /// Cap on the radius of the region examined around the object.
    /// Default: 1000
    pub max_radius: f64,
}

impl Default for AdaptiveMomentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tol1: 1e-5,
            tol2: 1e-4,
            max_shift: 1.0,
            max_radius: DEFAULT_MAX_RADIUS,
        }
    }
}

impl AdaptiveMomentConfig {
    /// Looser tolerances, adequate for survey processing.
    pub fn production() -> Self {
        Self {
            tol1: 1e-3,
            tol2: 1e-2,
            ..Self::default()
        }
    }

    pub fn clamped_max_shift(&self) -> f64 {
        self.max_shift.clamp(2.0, 10.0)
    }
}

/// Result of measure_adaptive_moments().
#[derive(Clone, Debug)]
pub struct ShapeResult {
    /// False only when no usable moments could be measured at all (the
    /// centroid was NaN, or [ShapeFlags::UNWEIGHTED_BAD]). A true value
    /// may still carry flags.
    pub success: bool,

    pub flags: ShapeFlags,

    /// Centroid of the weighted light, in pixel coordinates (the center of
    /// pixel (0, 0) is (0, 0)). NaN if it was never measured.
    pub x: f64,
    pub y: f64,

    /// Amplitude of the best fit Gaussian. With [ShapeFlags::UNWEIGHTED]
    /// this is the estimate from the last weighted round (zero if there was
    /// none); NaN on failure.
    pub amplitude: f64,

    /// Second moments of the object.
    pub moments: Quadrupole,

    /// Fourth-moment term: sum(weight * value * exponent^2) / sum. With
    /// [ShapeFlags::UNWEIGHTED] the numerator is from the last weighted round
    /// (zero if there was none) and the denominator is the unweighted sum.
    pub ixy4: f64,

    /// Covariance of (amplitude, Ixx, Iyy, Ixy), present when the weighted
    /// fit converged and the image supplied a positive variance at the
    /// object's position.
    pub covariance: Option<Matrix4<f64>>,

    /// Number of weight refinements performed.
    pub iterations: usize,
}

impl ShapeResult {
    fn failed(flags: ShapeFlags) -> Self {
        ShapeResult{success: false, flags,
                    x: f64::NAN, y: f64::NAN,
                    amplitude: f64::NAN,
                    moments: Quadrupole::new(f64::NAN, f64::NAN, f64::NAN),
                    ixy4: f64::NAN,
                    covariance: None,
                    iterations: 0}
    }

    /// Centroid errors are not estimated by this algorithm.
    pub fn x_variance(&self) -> Option<f64> {
        None
    }

    pub fn y_variance(&self) -> Option<f64> {
        None
    }

    fn variance_of(&self, index: usize) -> Option<f64> {
        self.covariance.map(|c| c[(index, index)])
    }

    pub fn amplitude_variance(&self) -> Option<f64> {
        self.variance_of(AMPLITUDE)
    }

    pub fn ixx_variance(&self) -> Option<f64> {
        self.variance_of(IXX)
    }

    pub fn iyy_variance(&self) -> Option<f64> {
        self.variance_of(IYY)
    }

    pub fn ixy_variance(&self) -> Option<f64> {
        self.variance_of(IXY)
    }
}

// Where the weighted iteration stopped.
struct IterationOutcome {
    flags: ShapeFlags,
    // The trial weight covariance at termination. On convergence this is the
    // measurement.
    weight_covariance: Quadrupole,
    // Last successful weighted accumulation, and the latest round's weights.
    sums: Option<MomentSums>,
    weights: Option<WeightParams>,
    region: Option<Rect>,
    interpolate: bool,
    centroid: Option<(f64, f64)>,
    amplitude: f64,
    iterations: usize,
}

// Ellipticity and size of the weighted object from the previous round.
struct History {
    e1: f64,
    e2: f64,
    sigma11_ow: f64,
}

impl History {
    fn unset() -> Self {
        History{e1: 1e6, e2: 1e6, sigma11_ow: 1e6}
    }
}

// Runs the fixed-point iteration. Any failure ends it with UNWEIGHTED set.
fn iterate_weighted<P: PixelSource>(image: &P, background: f64,
                                    xcen: f64, ycen: f64,
                                    config: &AdaptiveMomentConfig)
                                    -> IterationOutcome {
    let (width, height) = image.dimensions();
    let max_shift = config.clamped_max_shift();
    let mut outcome = IterationOutcome{
        flags: ShapeFlags::empty(),
        weight_covariance: Quadrupole::new(INITIAL_WEIGHT_VARIANCE, 0.0,
                                           INITIAL_WEIGHT_VARIANCE),
        sums: None,
        weights: None,
        region: None,
        interpolate: false,
        centroid: None,
        amplitude: 0.0,
        iterations: 0,
    };
    let mut history = History::unset();

    while outcome.iterations < config.max_iterations {
        let trial = outcome.weight_covariance;
        outcome.region = select_region(width, height, xcen, ycen, &trial,
                                       config.max_radius);

        let mut weights = match compute_weights(&trial) {
            Ok(w) => w,
            Err(e) => {
                debug!("Iteration {}: {}", outcome.iterations, e);
                outcome.flags |= ShapeFlags::UNWEIGHTED;
                break;
            },
        };

        let mut repeat_round = false;
        if !outcome.interpolate &&
            should_interpolate(trial.ixx, trial.iyy, weights.determinant)
        {
            // Stays set for this object.
            outcome.interpolate = true;
            if let Some(previous) = outcome.weights {
                // Redo the previous round's weights with interpolation, and
                // make sure at least one more round follows.
                debug!("Iteration {}: switching to sub-pixel interpolation",
                       outcome.iterations);
                weights = previous;
                history.sigma11_ow = 1e6;
                repeat_round = true;
            }
        }
        outcome.weights = Some(weights);

        let sums = match outcome.region {
            Some(roi) => accumulate_moments(image, &roi, background, xcen, ycen,
                                            &weights, outcome.interpolate,
                                            AccumulationMode::Full),
            None => Err(ShapeError::EmptyRegion{x: xcen, y: ycen}),
        };
        let sums = match sums {
            Ok(sums) => sums,
            Err(e) => {
                debug!("Iteration {}: {}", outcome.iterations, e);
                outcome.flags |= ShapeFlags::UNWEIGHTED;
                break;
            },
        };
        outcome.sums = Some(sums);

        outcome.amplitude = sums.sum / (PI * weights.determinant.sqrt());
        let (x, y) = (sums.sum_x / sums.sum, sums.sum_y / sums.sum);
        outcome.centroid = Some((x, y));
        if (x - xcen).abs() > max_shift || (y - ycen).abs() > max_shift {
            outcome.flags |= ShapeFlags::SHIFT;
        }

        // Second moments of weight * object.
        let object_weighted = Quadrupole::new(sums.sum_xx / sums.sum,
                                              sums.sum_xy / sums.sum,
                                              sums.sum_yy / sums.sum);
        if object_weighted.ixx <= 0.0 || object_weighted.iyy <= 0.0 {
            debug!("Iteration {}: {}", outcome.iterations,
                   ShapeError::NonPositiveMoments{sigma11: object_weighted.ixx,
                                                  sigma22: object_weighted.iyy});
            outcome.flags |= ShapeFlags::UNWEIGHTED;
            break;
        }
        let (e1, e2) = object_weighted.ellipticity();
        debug!("Iteration {}: weight {:?} object*weight {:?} e1 {} e2 {}",
               outcome.iterations, trial, object_weighted, e1, e2);

        if outcome.iterations > 0 &&
            (e1 - history.e1).abs() < config.tol1 &&
            (e2 - history.e2).abs() < config.tol1 &&
            (object_weighted.ixx / history.sigma11_ow - 1.0).abs() < config.tol2
        {
            debug!("Converged after {} iterations", outcome.iterations);
            return outcome;
        }
        history = History{e1, e2, sigma11_ow: object_weighted.ixx};

        match next_weight_covariance(&object_weighted, &weights) {
            Ok(next) => outcome.weight_covariance = next,
            Err(e) => {
                debug!("Iteration {}: {}", outcome.iterations, e);
                outcome.flags |= ShapeFlags::UNWEIGHTED;
                break;
            },
        }
        if !repeat_round {
            outcome.iterations += 1;
        }
    }

    if outcome.iterations >= config.max_iterations {
        outcome.flags |= ShapeFlags::MAXITER | ShapeFlags::UNWEIGHTED;
    }
    if let Some(sums) = outcome.sums {
        if sums.sum_xx + sums.sum_yy == 0.0 {
            outcome.flags |= ShapeFlags::UNWEIGHTED;
        }
    }
    outcome
}

// Deconvolves the current weight from the weighted object: the object's
// inverse covariance is that of weight*object minus that of the weight.
fn next_weight_covariance(object_weighted: &Quadrupole, weights: &WeightParams)
                          -> Result<Quadrupole, ShapeError> {
    let ow = compute_weights(object_weighted)?;
    let n = Quadrupole::new(ow.w11 - weights.w11,
                            ow.w12 - weights.w12,
                            ow.w22 - weights.w22);
    let next = compute_weights(&n)?.as_quadrupole();
    if next.ixx <= 0.0 || next.iyy <= 0.0 {
        return Err(ShapeError::NonPositiveMoments{sigma11: next.ixx,
                                                  sigma22: next.iyy});
    }
    Ok(next)
}

/// Measures the adaptive second moments, centroid and amplitude of the
/// object near (`xcen`, `ycen`) in `image`, after subtracting `background`.
///
/// The weight function stays centered on the given position; the reported
/// centroid is the first moment of the weighted light and
/// [ShapeFlags::SHIFT] is raised if it lies more than the (clamped)
/// `config.max_shift` from the starting position.
///
/// If the weighted fit converges, the moments are those of the matched
/// weight, and if `image` has a positive variance at the object's pixel the
/// Fisher matrix covariance is attached. Otherwise unweighted moments over
/// the last region are returned with [ShapeFlags::UNWEIGHTED], or, if those
/// too are unusable, `success` is false with [ShapeFlags::UNWEIGHTED_BAD].
///
/// A NaN starting position fails immediately without reading any pixels.
pub fn measure_adaptive_moments<P: PixelSource>(image: &P, background: f64,
                                                xcen: f64, ycen: f64,
                                                config: &AdaptiveMomentConfig)
                                                -> ShapeResult {
    if xcen.is_nan() || ycen.is_nan() {
        debug!("{}", ShapeError::InvalidCentroid{x: xcen, y: ycen});
        return ShapeResult::failed(ShapeFlags::UNWEIGHTED_BAD);
    }
    let measure_start = Instant::now();
    let outcome = iterate_weighted(image, background, xcen, ycen, config);
    let mut flags = outcome.flags;

    let mut result = if !flags.contains(ShapeFlags::UNWEIGHTED) {
        let sums = outcome.sums.unwrap_or_default();
        let (x, y) = outcome.centroid.unwrap_or((f64::NAN, f64::NAN));
        ShapeResult{success: true, flags, x, y,
                    amplitude: outcome.amplitude,
                    moments: outcome.weight_covariance,
                    ixy4: sums.sum_s4 / sums.sum,
                    covariance: None,
                    iterations: outcome.iterations}
    } else {
        let (width, height) = image.dimensions();
        let region = outcome.region.or_else(|| select_region(
            width, height, xcen, ycen, &outcome.weight_covariance,
            config.max_radius));
        let unweighted = match region {
            Some(roi) => accumulate_moments(image, &roi, background, xcen, ycen,
                                            &WeightParams::unweighted(),
                                            outcome.interpolate,
                                            AccumulationMode::Full),
            None => Err(ShapeError::EmptyRegion{x: xcen, y: ycen}),
        };
        match unweighted {
            Ok(sums) if sums.sum > 0.0 => {
                let (x, y) = outcome.centroid.unwrap_or(
                    (sums.sum_x / sums.sum, sums.sum_y / sums.sum));
                ShapeResult{success: true, flags, x, y,
                            amplitude: outcome.amplitude,
                            moments: Quadrupole::new(sums.sum_xx / sums.sum,
                                                     sums.sum_xy / sums.sum,
                                                     sums.sum_yy / sums.sum),
                            ixy4: outcome.sums.map_or(0.0, |w| w.sum_s4) / sums.sum,
                            covariance: None,
                            iterations: outcome.iterations}
            },
            other => {
                let sum = match other {
                    Ok(sums) => sums.sum,
                    Err(ShapeError::NonPositiveSums{sum, ..}) => sum,
                    Err(_) => 0.0,
                };
                debug!("Unweighted moments failed; sum {}", sum);
                flags.remove(ShapeFlags::UNWEIGHTED);
                flags |= ShapeFlags::UNWEIGHTED_BAD;
                let mut failed = ShapeResult::failed(flags);
                if let Some((x, y)) = outcome.centroid {
                    failed.x = x;
                    failed.y = y;
                }
                if sum > 0.0 {
                    failed.moments = Quadrupole::new(SINGLE_PIXEL_MOMENT, 0.0,
                                                     SINGLE_PIXEL_MOMENT);
                }
                failed.iterations = outcome.iterations;
                return failed;
            },
        }
    };

    if result.moments.trace() != 0.0 && !flags.contains(ShapeFlags::UNWEIGHTED) {
        if let Some(variance) = variance_near(image, xcen, ycen) {
            // NaN is not > 0.
            if variance > 0.0 {
                match parameter_covariance(result.amplitude, &result.moments, variance) {
                    Ok(covariance) => result.covariance = Some(covariance),
                    Err(e) => debug!("No covariance: {}", e),
                }
            }
        }
    }
    debug!("Adaptive moments at ({}, {}): {:?} flags {} in {:?}",
           xcen, ycen, result.moments, result.flags, measure_start.elapsed());
    result
}

// Variance of the pixel containing (x, y), if the image has one there.
fn variance_near<P: PixelSource>(image: &P, x: f64, y: f64) -> Option<f64> {
    let (width, height) = image.dimensions();
    let ix = (x + 0.5).floor();
    let iy = (y + 0.5).floor();
    if ix < 0.0 || iy < 0.0 || ix >= width as f64 || iy >= height as f64 {
        return None;
    }
    image.variance(ix as u32, iy as u32)
}

/// Flux inside a fixed elliptical Gaussian weight of covariance `shape`
/// centered at (`xcen`, `ycen`), after subtracting `background`. Typically
/// `shape` comes from an earlier measure_adaptive_moments() call, possibly
/// on a different image of the same object.
///
/// Returns (flux, flux error). The flux is NaN if `shape` cannot be turned
/// into a weight. The error is not estimated and is always None.
pub fn fixed_moments_flux<P: PixelSource>(image: &P, background: f64,
                                          xcen: f64, ycen: f64,
                                          shape: &Quadrupole, max_radius: f64)
                                          -> (f64, Option<f64>) {
    let weights = match compute_weights(shape) {
        Ok(w) => w,
        Err(e) => {
            debug!("Fixed moments flux: {}", e);
            return (f64::NAN, None);
        },
    };
    let (width, height) = image.dimensions();
    let Some(roi) = select_region(width, height, xcen, ycen, shape, max_radius) else {
        debug!("Fixed moments flux: {}", ShapeError::EmptyRegion{x: xcen, y: ycen});
        return (0.0, None);
    };
    let interpolate = should_interpolate(shape.ixx, shape.iyy, weights.determinant);
    match accumulate_moments(image, &roi, background, xcen, ycen, &weights,
                             interpolate, AccumulationMode::FluxOnly) {
        Ok(sums) => (sums.sum, None),
        Err(e) => {
            debug!("Fixed moments flux: {}", e);
            (0.0, None)
        },
    }
}
