// Failure conditions raised inside the adaptive moments machinery. Most of
// these never reach the caller of measure_adaptive_moments(); the solver
// turns them into ShapeFlags bits and logs them.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("centroid ({x}, {y}) is not a number")]
    InvalidCentroid { x: f64, y: f64 },

    #[error("covariance ({sigma11}, {sigma12}, {sigma22}) contains a NaN")]
    NanCovariance { sigma11: f64, sigma12: f64, sigma22: f64 },

    #[error("weight ({w11}, {w12}, {w22}) is numerically unstable")]
    UnstableWeight { w11: f64, w12: f64, w22: f64 },

    #[error("region {left},{top} {width}x{height} exceeds image {image_width}x{image_height}")]
    RegionOutOfBounds {
        left: i32,
        top: i32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },

    #[error("no pixels of the image lie near ({x:.1}, {y:.1})")]
    EmptyRegion { x: f64, y: f64 },

    #[error("moment sums are not positive: sum {sum}, sum_xx {sum_xx}, sum_yy {sum_yy}")]
    NonPositiveSums { sum: f64, sum_xx: f64, sum_yy: f64 },

    #[error("object-weighted moments are not positive: {sigma11}, {sigma22}")]
    NonPositiveMoments { sigma11: f64, sigma22: f64 },

    #[error("determinant {0} is too small for a Fisher matrix")]
    DegenerateDeterminant(f64),

    #[error("background variance must be positive (saw {0})")]
    NonPositiveVariance(f64),

    #[error("Fisher matrix is singular")]
    SingularFisher,

    #[error("image is degenerate: {0}")]
    DegenerateImage(String),
}
