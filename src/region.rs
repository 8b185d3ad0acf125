use imageproc::rect::Rect;

use crate::quadrupole::Quadrupole;

/// Default cap on the radius of the region examined around an object.
pub const DEFAULT_MAX_RADIUS: f64 = 1000.0;

/// Chooses the pixels to examine when computing moments with a weight of the
/// given covariance centered at (`xcen`, `ycen`): a square of half-size four
/// sigma along the wider axis (at most `max_radius`), clipped to the image.
/// The off-diagonal term of `weight_covariance` is not used.
///
/// Returns None if no pixel of the image falls within the region (the
/// center is far outside the image).
pub fn select_region(width: u32, height: u32, xcen: f64, ycen: f64,
                     weight_covariance: &Quadrupole, max_radius: f64)
                     -> Option<Rect> {
    if width == 0 || height == 0 {
        return None;
    }
    let sigma2 = f64::max(weight_covariance.ixx, weight_covariance.iyy);
    let rad = f64::min(4.0 * sigma2.sqrt(), max_radius);
    if rad.is_nan() || xcen.is_nan() || ycen.is_nan() {
        return None;
    }

    let x0 = ((xcen - rad - 0.5).floor() as i64).max(0);
    let y0 = ((ycen - rad - 0.5).floor() as i64).max(0);
    let x1 = ((xcen + rad + 0.5).floor() as i64).min(width as i64 - 1);
    let y1 = ((ycen + rad + 0.5).floor() as i64).min(height as i64 - 1);
    if x1 < x0 || y1 < y0 {
        return None;
    }
    Some(Rect::at(x0 as i32, y0 as i32)
         .of_size((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32))
}
