use log::debug;

use crate::error::ShapeError;
use crate::quadrupole::Quadrupole;

/// Second moment of a single uniformly illuminated pixel.
pub const SINGLE_PIXEL_MOMENT: f64 = 1.0 / 12.0;

// Below this (half a pixel, squared) the weight function is too narrow to be
// sampled at pixel centers.
const INTERPOLATION_THRESHOLD: f64 = 0.25;

/// Coefficients of the quadratic form x'Wx of an elliptical Gaussian weight
/// exp(-0.5 * (w11 x^2 + 2 w12 xy + w22 y^2)). `determinant` is that of the
/// covariance the weights were derived from, not of W.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WeightParams {
    pub w11: f64,
    pub w12: f64,
    pub w22: f64,
    pub determinant: f64,
}

impl WeightParams {
    /// A flat weight; every pixel in the region counts fully.
    pub fn unweighted() -> Self {
        WeightParams{w11: 0.0, w12: 0.0, w22: 0.0, determinant: f64::INFINITY}
    }

    pub fn is_unstable(&self) -> bool {
        self.w11.abs() > 1e6 || self.w12.abs() > 1e6 || self.w22.abs() > 1e6
    }

    /// The weights viewed as a (inverse covariance) matrix.
    pub fn as_quadrupole(&self) -> Quadrupole {
        Quadrupole::new(self.w11, self.w12, self.w22)
    }
}

/// Inverts a trial covariance into weight coefficients.
///
/// A covariance whose determinant is below single-precision epsilon (for
/// example an object that is non-zero only along a line) is regularized by
/// adding the second moment of one pixel in quadrature to each principal
/// axis before inverting. The returned determinant is then that of the
/// regularized covariance.
///
/// # Errors
/// [ShapeError::NanCovariance] if any input is NaN, or if a near-singular
/// input is not a covariance at all (indefinite) and so has no principal
/// axes to regularize.
pub fn compute_weights(covariance: &Quadrupole) -> Result<WeightParams, ShapeError> {
    let nan_error = ShapeError::NanCovariance{sigma11: covariance.ixx,
                                              sigma12: covariance.ixy,
                                              sigma22: covariance.iyy};
    if covariance.has_nan() {
        return Err(nan_error);
    }
    let det = covariance.determinant();
    if det.is_nan() || det < f32::EPSILON as f64 {
        let mut axes = match covariance.to_axes() {
            Some(axes) => axes,
            None => {
                debug!("Covariance {:?} is indefinite", covariance);
                return Err(nan_error);
            }
        };
        axes.a = (axes.a * axes.a + SINGLE_PIXEL_MOMENT).sqrt();
        axes.b = (axes.b * axes.b + SINGLE_PIXEL_MOMENT).sqrt();
        let regularized = Quadrupole::from_axes(&axes);
        // Both axes are now at least sqrt(1/12), so this cannot be singular.
        let inverse = regularized.inverse().ok_or(nan_error)?;
        debug!("Regularized degenerate covariance {:?} to {:?}",
               covariance, regularized);
        return Ok(WeightParams{w11: inverse.ixx, w12: inverse.ixy, w22: inverse.iyy,
                               determinant: regularized.determinant()});
    }
    Ok(WeightParams{w11: covariance.iyy / det,
                    w12: -covariance.ixy / det,
                    w22: covariance.ixx / det,
                    determinant: det})
}

/// Whether a weight function with this covariance is narrow enough (less
/// than about half a pixel) that moments must be computed on a sub-pixel
/// grid.
pub fn should_interpolate(sigma11: f64, sigma22: f64, determinant: f64) -> bool {
    sigma11 < INTERPOLATION_THRESHOLD || sigma22 < INTERPOLATION_THRESHOLD ||
        determinant < INTERPOLATION_THRESHOLD * INTERPOLATION_THRESHOLD
}
