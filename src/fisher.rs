// Analytic error estimates for adaptive moments.
//
// The Fisher matrix of a least squares fit of an elliptical Gaussian
// A exp(-0.5 x' S^-1 x) to an image with uniform background noise variance v.
// As in Numerical Recipes section 15.5, second derivative terms are dropped,
// so the matrix depends only on the best fit parameters; its inverse is only
// meaningful near a converged fit.
//
// Parameter order is (A, Ixx, Iyy, Ixy).

use std::f64::consts::PI;

use log::debug;
use nalgebra::Matrix4;

use crate::error::ShapeError;
use crate::quadrupole::Quadrupole;

pub const AMPLITUDE: usize = 0;
pub const IXX: usize = 1;
pub const IYY: usize = 2;
pub const IXY: usize = 3;

/// Computes the 4x4 Fisher matrix for amplitude `amplitude` and weight
/// covariance `weight`, given `background_variance` per pixel.
///
/// # Errors
/// [ShapeError::DegenerateDeterminant] if the determinant of `weight` is not
/// above f64 epsilon; [ShapeError::NonPositiveVariance] if
/// `background_variance` is not positive.
pub fn fisher_matrix(amplitude: f64, weight: &Quadrupole, background_variance: f64)
                     -> Result<Matrix4<f64>, ShapeError> {
    let sigma11 = weight.ixx;
    let sigma12 = weight.ixy;
    let sigma22 = weight.iyy;
    let d = weight.determinant();
    if !(d > f64::EPSILON) {
        return Err(ShapeError::DegenerateDeterminant(d));
    }
    if !(background_variance > 0.0) {
        return Err(ShapeError::NonPositiveVariance(background_variance));
    }
    let f = PI * d.sqrt() / background_variance;

    let mut fisher = Matrix4::<f64>::zeros();
    let fac = f * amplitude / (4.0 * d);
    fisher[(AMPLITUDE, AMPLITUDE)] = f;
    fisher[(AMPLITUDE, IXX)] = fac * sigma22;
    fisher[(AMPLITUDE, IYY)] = fac * sigma11;
    fisher[(AMPLITUDE, IXY)] = -2.0 * fac * sigma12;

    let g = 3.0 * f * amplitude * amplitude / (16.0 * d * d);
    fisher[(IXX, IXX)] = g * sigma22 * sigma22;
    fisher[(IYY, IYY)] = g * sigma11 * sigma11;
    fisher[(IXY, IXY)] = 4.0 * g * (sigma12 * sigma12 + d / 3.0);
    fisher[(IXX, IYY)] = fisher[(IXY, IXY)] / 4.0;
    fisher[(IXX, IXY)] = -2.0 * g * sigma22 * sigma12;
    fisher[(IYY, IXY)] = -2.0 * g * sigma11 * sigma12;

    for row in 0..4 {
        for col in 0..row {
            fisher[(row, col)] = fisher[(col, row)];
        }
    }
    Ok(fisher)
}

/// Covariance of (A, Ixx, Iyy, Ixy): the inverse of fisher_matrix().
///
/// # Errors
/// As fisher_matrix(), plus [ShapeError::SingularFisher] if the matrix
/// cannot be inverted.
pub fn parameter_covariance(amplitude: f64, weight: &Quadrupole, background_variance: f64)
                            -> Result<Matrix4<f64>, ShapeError> {
    let fisher = fisher_matrix(amplitude, weight, background_variance)?;
    let covariance = fisher.try_inverse().ok_or(ShapeError::SingularFisher)?;
    debug!("Fisher matrix {:?} inverted to {:?}", fisher, covariance);
    Ok(covariance)
}
