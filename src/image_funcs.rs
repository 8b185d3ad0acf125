use std::ops::Deref;

use image::{ImageBuffer, Luma, Pixel, Primitive};
use imageproc::rect::Rect;
use num_traits::ToPrimitive;

use crate::error::ShapeError;

/// Read access to the pixels of the image patch being measured. (0, 0) is
/// the upper left pixel; the center of pixel (x, y) is at coordinates
/// (x, y).
///
/// Implementations must be cheap to call per pixel and must not change
/// while a measurement is in progress.
pub trait PixelSource {
    /// (width, height) in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// The value of pixel (x, y), not background subtracted.
    fn intensity(&self, x: u32, y: u32) -> f64;

    /// The variance of pixel (x, y), if the source carries a variance plane.
    fn variance(&self, _x: u32, _y: u32) -> Option<f64> {
        None
    }
}

// Any single channel image from the `image` crate: GrayImage, 16 bit and
// floating point buffers alike.
impl<T, C> PixelSource for ImageBuffer<Luma<T>, C>
where
    T: Primitive + ToPrimitive,
    Luma<T>: Pixel<Subpixel = T>,
    C: Deref<Target = [T]>,
{
    fn dimensions(&self) -> (u32, u32) {
        ImageBuffer::dimensions(self)
    }

    fn intensity(&self, x: u32, y: u32) -> f64 {
        self.get_pixel(x, y).0[0].to_f64().unwrap_or(f64::NAN)
    }
}

/// Pairs an image with a per-pixel variance plane of the same size.
pub struct ImageWithVariance<'a, I: PixelSource> {
    image: &'a I,
    variance: &'a ImageBuffer<Luma<f32>, Vec<f32>>,
}

impl<'a, I: PixelSource> ImageWithVariance<'a, I> {
    pub fn new(image: &'a I, variance: &'a ImageBuffer<Luma<f32>, Vec<f32>>)
               -> Result<Self, ShapeError> {
        let (width, height) = image.dimensions();
        let (var_width, var_height) = variance.dimensions();
        if width != var_width || height != var_height {
            return Err(ShapeError::DegenerateImage(format!(
                "variance plane {}x{} does not match image {}x{}",
                var_width, var_height, width, height)));
        }
        Ok(ImageWithVariance{image, variance})
    }
}

impl<'a, I: PixelSource> PixelSource for ImageWithVariance<'a, I> {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn intensity(&self, x: u32, y: u32) -> f64 {
        self.image.intensity(x, y)
    }

    fn variance(&self, x: u32, y: u32) -> Option<f64> {
        Some(self.variance.get_pixel(x, y).0[0] as f64)
    }
}

/// Whether `roi` lies entirely within an image of the given size.
pub fn roi_within_image(roi: &Rect, width: u32, height: u32) -> bool {
    roi.left() >= 0 && roi.top() >= 0 &&
        roi.right() < width as i32 && roi.bottom() < height as i32
}

// An iterator over the pixels of a region of interest. Yields pixels in raster
// scan order.
pub struct EnumeratePixels<'a, P: PixelSource> {
    image: &'a P,
    roi: &'a Rect,

    // Identifies the next pixel to be yielded. If cur_y is beyond the ROI's
    // bottom, the iteration is finished.
    cur_x: i32,
    cur_y: i32,
}

impl<'a, P: PixelSource> EnumeratePixels<'a, P> {
    // The caller must have checked roi_within_image().
    pub fn new(image: &'a P, roi: &'a Rect) -> EnumeratePixels<'a, P> {
        let (width, height) = image.dimensions();
        debug_assert!(roi_within_image(roi, width, height));
        EnumeratePixels{image, roi, cur_x: roi.left(), cur_y: roi.top()}
    }
}

impl<'a, P: PixelSource> Iterator for EnumeratePixels<'a, P> {
    type Item = (i32, i32, f64);  // x, y, pixel value.

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur_y > self.roi.bottom() {
            return None;
        }
        let item: Self::Item = (self.cur_x, self.cur_y,
                                self.image.intensity(self.cur_x as u32,
                                                     self.cur_y as u32));
        if self.cur_x == self.roi.right() {
            self.cur_x = self.roi.left();
            self.cur_y += 1;
        } else {
            self.cur_x += 1;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, ImageBuffer, Luma};
    use imageproc::gray_image;
    use super::*;

    #[test]
    fn test_enumerate_pixels_1x1() {
        let image_1x1 = gray_image!(127);
        let pixels: Vec<(i32, i32, f64)> =
            EnumeratePixels::new(&image_1x1, &Rect::at(0, 0).of_size(1, 1))
            .collect();
        assert_eq!(pixels, vec!((0, 0, 127.0)));
    }

    #[test]
    fn test_enumerate_pixels_3x3() {
        let image_3x3 = gray_image!(
            0, 1, 2;
            127, 253, 254;
            255, 0, 1);

        // Entire ROI.
        let mut pixels: Vec<(i32, i32, f64)> =
            EnumeratePixels::new(&image_3x3, &Rect::at(0, 0).of_size(3, 3))
            .collect();
        assert_eq!(pixels, vec!((0, 0, 0.0),
                                (1, 0, 1.0),
                                (2, 0, 2.0),
                                (0, 1, 127.0),
                                (1, 1, 253.0),
                                (2, 1, 254.0),
                                (0, 2, 255.0),
                                (1, 2, 0.0),
                                (2, 2, 1.0)));
        // Lower right corner only.
        pixels = EnumeratePixels::new(&image_3x3, &Rect::at(1, 1).of_size(2, 2))
            .collect();
        assert_eq!(pixels, vec!((1, 1, 253.0),
                                (2, 1, 254.0),
                                (1, 2, 0.0),
                                (2, 2, 1.0)));
    }

    #[test]
    fn test_roi_within_image() {
        assert!(roi_within_image(&Rect::at(0, 0).of_size(4, 3), 4, 3));
        assert!(!roi_within_image(&Rect::at(0, 0).of_size(5, 3), 4, 3));
        assert!(!roi_within_image(&Rect::at(-1, 0).of_size(2, 2), 4, 3));
        assert!(!roi_within_image(&Rect::at(0, 2).of_size(2, 2), 4, 3));
    }

    #[test]
    fn test_pixel_types() {
        let mut img16 = ImageBuffer::<Luma<u16>, Vec<u16>>::new(2, 2);
        img16.put_pixel(1, 0, Luma([40000]));
        assert_eq!(PixelSource::dimensions(&img16), (2, 2));
        assert_eq!(img16.intensity(1, 0), 40000.0);
        assert_eq!(img16.variance(1, 0), None);

        let mut imgf = ImageBuffer::<Luma<f32>, Vec<f32>>::new(2, 2);
        imgf.put_pixel(0, 1, Luma([-2.5]));
        assert_eq!(imgf.intensity(0, 1), -2.5);
    }

    #[test]
    fn test_image_with_variance() {
        let image = GrayImage::from_pixel(3, 2, Luma([7]));
        let variance = ImageBuffer::<Luma<f32>, Vec<f32>>::from_pixel(3, 2, Luma([4.0]));
        let with_var = ImageWithVariance::new(&image, &variance).unwrap();
        assert_eq!(with_var.dimensions(), (3, 2));
        assert_eq!(with_var.intensity(2, 1), 7.0);
        assert_eq!(with_var.variance(2, 1), Some(4.0));

        let wrong_size = ImageBuffer::<Luma<f32>, Vec<f32>>::new(2, 3);
        assert!(ImageWithVariance::new(&image, &wrong_size).is_err());
    }
}
