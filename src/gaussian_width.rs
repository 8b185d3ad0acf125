//! Equivalent Gaussian width of a centered image patch, such as a rendered
//! PSF. All methods agree for a well sampled circular Gaussian; they differ
//! in how they weight the wings of other profiles.

use std::f64::consts::PI;

use imageproc::rect::Rect;
use log::debug;

use crate::error::ShapeError;
use crate::image_funcs::{EnumeratePixels, PixelSource};
use crate::weights::SINGLE_PIXEL_MOMENT;

const MAX_ITERATIONS: usize = 100;
const TOLERANCE: f64 = 1e-4;
const MAX_EXPONENT: f64 = 14.0;

/// How gaussian_width() estimates sigma.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WidthMethod {
    /// Circular adaptive moments.
    AdaptiveMoment,
    /// sqrt(2/pi) <r>.
    FirstMoment,
    /// sqrt(<r^2> / 2).
    SecondMoment,
    /// From the effective area, sqrt(A_eff / 4 pi).
    NoiseEquivalent,
    /// sqrt(sum((I r)^2) / sum(I^2)).
    Bickerton,
}

// The whole image, with its source assumed at (width / 2, height / 2).
fn full_image<P: PixelSource>(image: &P) -> Result<(Rect, f64, f64), ShapeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ShapeError::DegenerateImage(
            format!("image is {}x{}", width, height)));
    }
    Ok((Rect::at(0, 0).of_size(width, height),
        (width / 2) as f64, (height / 2) as f64))
}

/// Estimates the sigma of the Gaussian equivalent to the source at the
/// center of `image` (pixel (width / 2, height / 2), integer division).
///
/// # Errors
/// [ShapeError::DegenerateImage] if the image is empty, or if its light
/// sums make the chosen estimator meaningless (e.g. non-positive total
/// flux for the moment methods).
pub fn gaussian_width<P: PixelSource>(image: &P, method: WidthMethod)
                                      -> Result<f64, ShapeError> {
    let (roi, xcen, ycen) = full_image(image)?;
    let width = match method {
        WidthMethod::AdaptiveMoment => {
            adaptive_second_moment(image, &roi, xcen, ycen).sqrt()
        },
        WidthMethod::FirstMoment => {
            let mut sum = 0.0;
            let mut norm = 0.0;
            for (x, y, value) in EnumeratePixels::new(image, &roi) {
                let r = (x as f64 - xcen).hypot(y as f64 - ycen);
                sum += value * r;
                norm += value;
            }
            check_moment_sums("sum(I r)", sum, norm)?;
            (2.0 / PI).sqrt() * sum / norm
        },
        WidthMethod::SecondMoment => {
            let mut sum = 0.0;
            let mut norm = 0.0;
            for (x, y, value) in EnumeratePixels::new(image, &roi) {
                let dx = x as f64 - xcen;
                let dy = y as f64 - ycen;
                sum += value * (dx * dx + dy * dy);
                norm += value;
            }
            check_moment_sums("sum(I r^2)", sum, norm)?;
            (0.5 * sum / norm).sqrt()
        },
        WidthMethod::NoiseEquivalent => {
            (effective_area(image)? / (4.0 * PI)).sqrt()
        },
        WidthMethod::Bickerton => {
            let mut sum = 0.0;
            let mut norm = 0.0;
            for (x, y, value) in EnumeratePixels::new(image, &roi) {
                let r = (x as f64 - xcen).hypot(y as f64 - ycen);
                sum += (value * r) * (value * r);
                norm += value * value;
            }
            if !(norm > 0.0) {
                return Err(ShapeError::DegenerateImage("sum(I^2) is zero".to_string()));
            }
            (sum / norm).sqrt()
        },
    };
    debug!("Gaussian width by {:?}: {}", method, width);
    Ok(width)
}

fn check_moment_sums(name: &str, sum: f64, norm: f64) -> Result<(), ShapeError> {
    let mut problems = Vec::<String>::new();
    if sum < 0.0 {
        problems.push(format!("{} is negative", name));
    }
    if !(norm > 0.0) {
        problems.push("sum(I) is not positive".to_string());
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ShapeError::DegenerateImage(problems.join("; ")))
    }
}

/// Effective area of the image, sum(I)^2 / sum(I^2).
pub fn effective_area<P: PixelSource>(image: &P) -> Result<f64, ShapeError> {
    let (roi, _, _) = full_image(image)?;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for (_, _, value) in EnumeratePixels::new(image, &roi) {
        sum += value;
        sum_sq += value * value;
    }
    if !(sum_sq > 0.0) {
        return Err(ShapeError::DegenerateImage("sum(I^2) is zero".to_string()));
    }
    Ok(sum * sum / sum_sq)
}

// One-dimensional moment 0.5 * sum(r^2 w I) / sum(w I) under the circular
// weight exp(-0.5 r^2 w11). None if the weight is unstable or the sums are
// unusable.
fn circular_moment(image: &impl PixelSource, roi: &Rect, xcen: f64, ycen: f64,
                   w11: f64) -> Option<f64> {
    if w11.abs() > 1e6 {
        return None;
    }
    let mut sum = 0.0;
    let mut sum_rr = 0.0;
    for (x, y, value) in EnumeratePixels::new(image, roi) {
        let dx = x as f64 - xcen;
        let dy = y as f64 - ycen;
        let r2 = dx * dx + dy * dy;
        let expon = r2 * w11;
        if expon <= MAX_EXPONENT {
            let weighted = value * (-0.5 * expon).exp();
            sum += weighted;
            sum_rr += r2 * weighted;
        }
    }
    if !(sum > 0.0) || sum_rr < 0.0 {
        return None;
    }
    Some(0.5 * sum_rr / sum)
}

// The per-axis variance of the circular Gaussian matching the image, found
// the same way as measure_adaptive_moments() does for ellipses.
fn adaptive_second_moment(image: &impl PixelSource, roi: &Rect,
                          xcen: f64, ycen: f64) -> f64 {
    let mut w11 = 0.5;
    let mut sigma11_ow_old = 1e6;
    let mut converged = false;
    for iteration in 0..MAX_ITERATIONS {
        let Some(sigma11_ow) = circular_moment(image, roi, xcen, ycen, w11) else {
            debug!("Circular moment failed at iteration {}", iteration);
            break;
        };
        if iteration > 0 && (sigma11_ow / sigma11_ow_old - 1.0).abs() < TOLERANCE {
            converged = true;
            break;
        }
        sigma11_ow_old = sigma11_ow;

        // Inverse variances of Gaussian products add.
        w11 = 1.0 / sigma11_ow - w11;
        if w11 <= 0.0 {
            debug!("Object is not Gaussian-like at iteration {}", iteration);
            break;
        }
    }
    if converged {
        return 1.0 / w11;
    }
    circular_moment(image, roi, xcen, ycen, 0.0).unwrap_or(SINGLE_PIXEL_MOMENT)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use image::{ImageBuffer, Luma};
    use super::*;

    type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

    fn round_gaussian(size: u32, sigma: f64) -> FloatImage {
        let center = (size / 2) as f64;
        ImageBuffer::from_fn(size, size, |x, y| {
            let dx = x as f64 - center;
            let dy = y as f64 - center;
            Luma([(-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp() as f32])
        })
    }

    #[test]
    fn test_methods_agree_on_gaussian() {
        let image = round_gaussian(24, 2.0);
        let adaptive = gaussian_width(&image, WidthMethod::AdaptiveMoment).unwrap();
        let second = gaussian_width(&image, WidthMethod::SecondMoment).unwrap();
        assert_relative_eq!(adaptive, 2.0, max_relative = 0.01);
        assert_relative_eq!(second, 2.0, max_relative = 0.01);
        assert_relative_eq!(adaptive, second, max_relative = 0.01);

        for method in [WidthMethod::FirstMoment, WidthMethod::NoiseEquivalent,
                       WidthMethod::Bickerton] {
            let width = gaussian_width(&image, method).unwrap();
            assert_relative_eq!(width, 2.0, max_relative = 0.01);
        }
    }

    #[test]
    fn test_effective_area() {
        // 4 pi sigma^2 for a Gaussian.
        let image = round_gaussian(24, 2.0);
        assert_relative_eq!(effective_area(&image).unwrap(), 16.0 * PI,
                            max_relative = 1e-5);

        // N equal pixels have an area of N.
        let flat = FloatImage::from_pixel(5, 4, Luma([3.0]));
        assert_relative_eq!(effective_area(&flat).unwrap(), 20.0, max_relative = 1e-12);
    }

    #[test]
    fn test_single_pixel() {
        let mut image = FloatImage::new(9, 9);
        image.put_pixel(4, 4, Luma([1.0]));
        // Adaptive and unweighted moments are both zero; the adaptive
        // estimate falls back to zero width, not NaN.
        let adaptive = gaussian_width(&image, WidthMethod::AdaptiveMoment).unwrap();
        assert!(adaptive.is_finite());
        assert_eq!(gaussian_width(&image, WidthMethod::SecondMoment).unwrap(), 0.0);
        assert_relative_eq!(effective_area(&image).unwrap(), 1.0);
    }

    #[test]
    fn test_degenerate_images() {
        let zero = FloatImage::new(8, 8);
        for method in [WidthMethod::FirstMoment, WidthMethod::SecondMoment,
                       WidthMethod::NoiseEquivalent, WidthMethod::Bickerton] {
            assert!(matches!(gaussian_width(&zero, method),
                             Err(ShapeError::DegenerateImage(_))));
        }
        // Nothing to measure: a single pixel's moment.
        let adaptive = gaussian_width(&zero, WidthMethod::AdaptiveMoment).unwrap();
        assert_relative_eq!(adaptive, SINGLE_PIXEL_MOMENT.sqrt());

        let negative = FloatImage::from_pixel(4, 4, Luma([-1.0]));
        assert!(gaussian_width(&negative, WidthMethod::SecondMoment).is_err());

        let empty = FloatImage::new(0, 0);
        assert!(effective_area(&empty).is_err());
        assert!(gaussian_width(&empty, WidthMethod::AdaptiveMoment).is_err());
    }
}
