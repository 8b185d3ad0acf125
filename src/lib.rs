//! SdssShape measures the shapes of compact astronomical sources with the
//! adaptive moments method used by the Sloan Digital Sky Survey. Given an
//! image patch and the approximate position of an object, it returns the
//! object's centroid, second moments (Ixx, Ixy, Iyy), amplitude and, when
//! pixel variances are supplied, the covariance of those estimates.
//!
//! Features:
//!
//! * Elliptical Gaussian weight matched iteratively to the object, so that
//!   noise in the wings contributes little to the result.
//! * Sub-pixel evaluation of the weight when the object is only a pixel or
//!   so across.
//! * Graceful fallback to unweighted moments, with flags that say exactly
//!   what happened.
//! * Analytic error estimates from the Fisher matrix of a Gaussian fit.
//! * Works on any single channel image from the `image` crate (8 bit, 16
//!   bit, floating point), or on anything implementing [PixelSource].
//!
//! # Algorithm
//!
//! The product of two Gaussians is a Gaussian whose inverse covariance is
//! the sum of the inverse covariances of the factors. Starting from a round
//! weight, [measure_adaptive_moments()] measures the second moments of
//! weight * object, subtracts the weight's inverse covariance from theirs to
//! estimate the object's own covariance, and uses that as the next weight.
//! At convergence the weight has the same covariance as the object.
//!
//! The weight is centered on the caller's position throughout; the reported
//! centroid is the first moment of the weighted light.
//!
//! [fixed_moments_flux()] reuses the moment machinery with a frozen weight,
//! for example to measure flux in a second image at a shape already
//! measured. [gaussian_width()] estimates the width of a centered patch such
//! as a rendered PSF.
//!
//! # Caveats
//!
//! * The method assumes a roughly Gaussian object. For other profiles (a
//!   pair of points, say) the weighted fit fails and unweighted moments are
//!   returned, flagged [ShapeFlags::UNWEIGHTED].
//! * `success` true does not mean the weighted fit converged; check
//!   [ShapeResult::flags].
//! * Centroid errors are not estimated, nor is the error of the fixed
//!   moments flux.
//! * The library does no background estimation; the caller passes the
//!   background level to subtract.

pub mod adaptive;
pub mod error;
pub mod fisher;
pub mod gaussian_width;
pub mod image_funcs;
pub mod moments;
pub mod quadrupole;
pub mod region;
pub mod weights;

pub use crate::adaptive::{fixed_moments_flux, measure_adaptive_moments,
                          AdaptiveMomentConfig, ShapeFlags, ShapeResult};
pub use crate::error::ShapeError;
pub use crate::gaussian_width::{effective_area, gaussian_width, WidthMethod};
pub use crate::image_funcs::{ImageWithVariance, PixelSource};
pub use crate::quadrupole::{Axes, Quadrupole};
