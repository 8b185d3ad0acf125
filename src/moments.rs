use imageproc::rect::Rect;

use crate::error::ShapeError;
use crate::image_funcs::{roi_within_image, EnumeratePixels, PixelSource};
use crate::weights::WeightParams;

// Pixels whose weight exponent exceeds this contribute nothing measurable;
// exp(-7) is below single precision resolution relative to the peak.
const MAX_EXPONENT: f64 = 14.0;

// Tighter cutoff for the interpolated case, applied to the farthest corner
// of the sub-pixel cell.
const MAX_EXPONENT_INTERPOLATED: f64 = 9.0;

// Sub-pixel sample offsets from the pixel center, one axis. Each of the 4x4
// samples carries the full pixel value, so interpolated sums are 16 times
// the plain ones for a flat weight.
const SUBPIXEL_OFFSETS: [f64; 4] = [-0.375, -0.125, 0.125, 0.375];

/// What accumulate_moments() computes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccumulationMode {
    /// Zeroth through second moments plus the fourth-moment term.
    Full,
    /// Only the weighted flux (`sum`); the other sums are left at zero.
    FluxOnly,
}

/// Weighted moment sums of background-subtracted pixel values. `sum_x` and
/// `sum_y` use absolute pixel coordinates; the second order sums use
/// coordinates relative to the weight center.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MomentSums {
    pub sum: f64,
    pub sum_x: f64,
    pub sum_y: f64,
    pub sum_xx: f64,
    pub sum_xy: f64,
    pub sum_yy: f64,

    /// Sum of weight * value * exponent^2, used for the fourth moment.
    pub sum_s4: f64,
}

impl MomentSums {
    fn add(&mut self, value: f64, x: f64, y: f64, abs_x: f64, abs_y: f64,
           expon: f64, mode: AccumulationMode) {
        self.sum += value;
        if mode == AccumulationMode::FluxOnly {
            return;
        }
        self.sum_x += value * abs_x;
        self.sum_y += value * abs_y;
        self.sum_xx += value * x * x;
        self.sum_xy += value * x * y;
        self.sum_yy += value * y * y;
        self.sum_s4 += value * expon * expon;
    }
}

fn quadratic_form(weights: &WeightParams, x: f64, y: f64) -> f64 {
    x * x * weights.w11 + 2.0 * x * y * weights.w12 + y * y * weights.w22
}

/// Accumulates moments of the pixels of `roi`, weighted by the Gaussian
/// `weights` centered at (`xcen`, `ycen`), after subtracting `background`.
///
/// With `interpolate` set each pixel is evaluated on a 4x4 sub-pixel grid,
/// which removes the pixelization bias of weight functions only a pixel or
/// two across.
///
/// # Errors
/// * [ShapeError::UnstableWeight] if any weight coefficient exceeds 1e6 in
///   magnitude.
/// * [ShapeError::RegionOutOfBounds] if `roi` is not within the image.
/// * [ShapeError::NonPositiveSums] in [AccumulationMode::Full] if the sum,
///   sum_xx or sum_yy is not strictly positive.
pub fn accumulate_moments<P: PixelSource>(
    image: &P, roi: &Rect, background: f64, xcen: f64, ycen: f64,
    weights: &WeightParams, interpolate: bool, mode: AccumulationMode)
    -> Result<MomentSums, ShapeError>
{
    if weights.is_unstable() {
        return Err(ShapeError::UnstableWeight{w11: weights.w11, w12: weights.w12,
                                              w22: weights.w22});
    }
    let (width, height) = image.dimensions();
    if !roi_within_image(roi, width, height) {
        return Err(ShapeError::RegionOutOfBounds{
            left: roi.left(), top: roi.top(),
            width: roi.width(), height: roi.height(),
            image_width: width, image_height: height});
    }

    let mut sums = MomentSums::default();
    for (px, py, pixel_value) in EnumeratePixels::new(image, roi) {
        let x = px as f64 - xcen;
        let y = py as f64 - ycen;
        if !interpolate {
            let expon = quadratic_form(weights, x, y);
            if expon > MAX_EXPONENT {
                continue;
            }
            let value = (pixel_value - background) * (-0.5 * expon).exp();
            sums.add(value, x, y, px as f64, py as f64, expon, mode);
            continue;
        }

        // Skip the pixel if the farthest corner of its sub-pixel cell is far
        // out in the weight's tail.
        let (xl, xh) = (x + SUBPIXEL_OFFSETS[0], x + SUBPIXEL_OFFSETS[3]);
        let (yl, yh) = (y + SUBPIXEL_OFFSETS[0], y + SUBPIXEL_OFFSETS[3]);
        let corner_expon = [quadratic_form(weights, xl, yl),
                            quadratic_form(weights, xh, yh),
                            quadratic_form(weights, xl, yh),
                            quadratic_form(weights, xh, yl)]
            .into_iter().fold(f64::MIN, f64::max);
        if corner_expon > MAX_EXPONENT_INTERPOLATED {
            continue;
        }
        let sub_value = pixel_value - background;
        for dy in SUBPIXEL_OFFSETS {
            let sub_y = y + dy;
            for dx in SUBPIXEL_OFFSETS {
                let sub_x = x + dx;
                let expon = quadratic_form(weights, sub_x, sub_y);
                let value = sub_value * (-0.5 * expon).exp();
                sums.add(value, sub_x, sub_y, sub_x + xcen, sub_y + ycen,
                         expon, mode);
            }
        }
    }

    if mode == AccumulationMode::Full &&
        !(sums.sum > 0.0 && sums.sum_xx > 0.0 && sums.sum_yy > 0.0)
    {
        return Err(ShapeError::NonPositiveSums{sum: sums.sum, sum_xx: sums.sum_xx,
                                               sum_yy: sums.sum_yy});
    }
    Ok(sums)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use image::{ImageBuffer, Luma};
    use imageproc::gray_image;
    use crate::quadrupole::Quadrupole;
    use crate::weights::compute_weights;
    use super::*;

    type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

    fn flat_weights() -> WeightParams {
        WeightParams::unweighted()
    }

    #[test]
    fn test_unweighted_sums() {
        let image = gray_image!(
            0, 0, 0;
            0, 4, 2;
            0, 0, 0);
        let roi = Rect::at(0, 0).of_size(3, 3);
        let sums = accumulate_moments(&image, &roi, 0.0, 1.0, 1.0,
                                      &flat_weights(), false,
                                      AccumulationMode::Full);
        // sum_yy is zero: all light is on one row.
        assert!(matches!(sums, Err(ShapeError::NonPositiveSums{..})));

        let image = gray_image!(
            0, 1, 0;
            0, 4, 2;
            0, 1, 0);
        let sums = accumulate_moments(&image, &roi, 0.0, 1.0, 1.0,
                                      &flat_weights(), false,
                                      AccumulationMode::Full).unwrap();
        assert_eq!(sums.sum, 8.0);
        assert_eq!(sums.sum_x, 1.0 + 4.0 + 2.0 * 2.0 + 1.0);
        assert_eq!(sums.sum_y, 0.0 + 4.0 + 2.0 + 2.0 * 1.0);
        assert_eq!(sums.sum_xx, 2.0);
        assert_eq!(sums.sum_xy, 0.0);
        assert_eq!(sums.sum_yy, 2.0);
        assert_eq!(sums.sum_s4, 0.0);
    }

    #[test]
    fn test_background_subtracted() {
        let image = gray_image!(
            10, 11, 10;
            10, 14, 12;
            10, 11, 10);
        let roi = Rect::at(0, 0).of_size(3, 3);
        let sums = accumulate_moments(&image, &roi, 10.0, 1.0, 1.0,
                                      &flat_weights(), false,
                                      AccumulationMode::Full).unwrap();
        assert_eq!(sums.sum, 8.0);
        assert_eq!(sums.sum_xx, 2.0);
    }

    #[test]
    fn test_gaussian_weight() {
        let mut image = FloatImage::new(5, 5);
        image.put_pixel(2, 2, Luma([1.0]));
        image.put_pixel(3, 2, Luma([1.0]));
        image.put_pixel(2, 3, Luma([1.0]));
        let weights = compute_weights(&Quadrupole::new(1.0, 0.0, 1.0)).unwrap();
        let roi = Rect::at(0, 0).of_size(5, 5);
        let sums = accumulate_moments(&image, &roi, 0.0, 2.0, 2.0, &weights,
                                      false, AccumulationMode::Full).unwrap();
        let w1 = (-0.5_f64).exp();
        assert_abs_diff_eq!(sums.sum, 1.0 + 2.0 * w1, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.sum_x, 2.0 + 3.0 * w1 + 2.0 * w1, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.sum_xx, w1, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.sum_yy, w1, epsilon = 1e-12);
        // Exponent is 1 for each offset pixel.
        assert_abs_diff_eq!(sums.sum_s4, 2.0 * w1, epsilon = 1e-12);
    }

    #[test]
    fn test_exponent_cutoff() {
        // A bright pixel 8 sigma away from the weight center (expon 64) is
        // ignored entirely.
        let mut image = FloatImage::new(9, 9);
        image.put_pixel(4, 4, Luma([1.0]));
        image.put_pixel(4, 5, Luma([1.0]));
        image.put_pixel(5, 4, Luma([1.0]));
        let with_far = {
            let mut img = image.clone();
            img.put_pixel(8, 8, Luma([1000.0]));
            img
        };
        let weights = compute_weights(&Quadrupole::new(0.5, 0.0, 0.5)).unwrap();
        let roi = Rect::at(0, 0).of_size(9, 9);
        let near = accumulate_moments(&image, &roi, 0.0, 4.0, 4.0, &weights,
                                      false, AccumulationMode::Full).unwrap();
        let far = accumulate_moments(&with_far, &roi, 0.0, 4.0, 4.0, &weights,
                                     false, AccumulationMode::Full).unwrap();
        assert_eq!(near, far);
    }

    #[test]
    fn test_interpolated_single_pixel() {
        let mut image = FloatImage::new(3, 3);
        image.put_pixel(1, 1, Luma([16.0]));
        let roi = Rect::at(0, 0).of_size(3, 3);
        let sums = accumulate_moments(&image, &roi, 0.0, 1.0, 1.0,
                                      &flat_weights(), true,
                                      AccumulationMode::Full).unwrap();
        // Every one of the 16 subsamples counts the whole pixel.
        assert_abs_diff_eq!(sums.sum, 256.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.sum_x, 256.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.sum_y, 256.0, epsilon = 1e-12);
        // Mean square sub-pixel offset is (2*0.375^2 + 2*0.125^2)/4, which is
        // close to the 1/12 of a uniformly filled pixel.
        assert_abs_diff_eq!(sums.sum_xx / sums.sum, 0.078125, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.sum_yy / sums.sum, 0.078125, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.sum_xy, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolated_matches_plain_for_wide_weight() {
        // For a weight much wider than a pixel the two modes nearly agree.
        let mut image = FloatImage::new(41, 41);
        for y in 0..41 {
            for x in 0..41 {
                let dx = x as f64 - 20.0;
                let dy = y as f64 - 20.0;
                let v = 100.0 * (-(dx * dx + dy * dy) / (2.0 * 9.0)).exp();
                image.put_pixel(x, y, Luma([v as f32]));
            }
        }
        let weights = compute_weights(&Quadrupole::new(9.0, 0.0, 9.0)).unwrap();
        let roi = Rect::at(0, 0).of_size(41, 41);
        let plain = accumulate_moments(&image, &roi, 0.0, 20.0, 20.0, &weights,
                                       false, AccumulationMode::Full).unwrap();
        let interp = accumulate_moments(&image, &roi, 0.0, 20.0, 20.0, &weights,
                                        true, AccumulationMode::Full).unwrap();
        assert_abs_diff_eq!(interp.sum / (16.0 * plain.sum), 1.0, epsilon = 0.01);
        assert_abs_diff_eq!(interp.sum_xx / interp.sum, plain.sum_xx / plain.sum,
                            epsilon = 0.1);
    }

    #[test]
    fn test_flux_only() {
        let image = gray_image!(
            0, 1, 0;
            0, 4, 0;
            0, 0, 0);
        let roi = Rect::at(0, 0).of_size(3, 3);
        // sum_xx is zero, which would make Full mode fail; FluxOnly never checks.
        let sums = accumulate_moments(&image, &roi, 0.0, 1.0, 1.0,
                                      &flat_weights(), false,
                                      AccumulationMode::FluxOnly).unwrap();
        assert_eq!(sums.sum, 5.0);
        assert_eq!(sums.sum_x, 0.0);
        assert_eq!(sums.sum_xx, 0.0);
        assert_eq!(sums.sum_s4, 0.0);
    }

    #[test]
    fn test_failures() {
        let image = gray_image!(
            0, 1, 0;
            1, 4, 1;
            0, 1, 0);
        let roi = Rect::at(0, 0).of_size(3, 3);
        let unstable = WeightParams{w11: 2e6, w12: 0.0, w22: 1.0, determinant: 1.0};
        assert!(matches!(
            accumulate_moments(&image, &roi, 0.0, 1.0, 1.0, &unstable, false,
                               AccumulationMode::Full),
            Err(ShapeError::UnstableWeight{..})));

        let too_big = Rect::at(0, 0).of_size(4, 3);
        assert!(matches!(
            accumulate_moments(&image, &too_big, 0.0, 1.0, 1.0, &flat_weights(),
                               false, AccumulationMode::Full),
            Err(ShapeError::RegionOutOfBounds{..})));

        // Everything below background.
        assert!(matches!(
            accumulate_moments(&image, &roi, 10.0, 1.0, 1.0, &flat_weights(),
                               false, AccumulationMode::Full),
            Err(ShapeError::NonPositiveSums{..})));
    }
}
