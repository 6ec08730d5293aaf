//! Grayscale image primitives used by frame differencing.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::{filter, map, morphology};

/// Gaussian sigma for an odd kernel size, derived the way OpenCV does when
/// only the size is given.
pub fn gaussian_sigma(kernel_size: u32) -> f32 {
    let half = (kernel_size.max(1) - 1) as f32 * 0.5;
    0.3 * (half - 1.0) + 0.8
}

/// Gaussian blur sized by `kernel_size`. A size of 1 leaves the image unchanged.
pub fn gaussian_blur(src: &GrayImage, kernel_size: u32) -> GrayImage {
    if kernel_size <= 1 || src.width() == 0 || src.height() == 0 {
        return src.clone();
    }
    filter::gaussian_blur_f32(src, gaussian_sigma(kernel_size))
}

/// Per-pixel absolute difference. Both images must have the same size.
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> Result<GrayImage> {
    if a.dimensions() != b.dimensions() {
        return Err(anyhow!(
            "cannot diff {:?} against {:?}",
            a.dimensions(),
            b.dimensions()
        ));
    }
    Ok(map::map_colors2(a, b, |p: Luma<u8>, q: Luma<u8>| {
        Luma([p[0].abs_diff(q[0])])
    }))
}

/// Binary threshold: values strictly above `level` become 255, the rest 0.
pub fn threshold(src: &GrayImage, level: u8) -> GrayImage {
    map::map_colors(src, |p: Luma<u8>| {
        Luma([if p[0] > level { 255 } else { 0 }])
    })
}

/// Dilation with a 3x3 square element, repeated `iterations` times.
///
/// Repeating the 3x3 element `n` times equals one chessboard-distance dilation
/// of radius `n`.
pub fn dilate(src: &GrayImage, iterations: u32) -> GrayImage {
    if iterations == 0 {
        return src.clone();
    }
    let radius = u8::try_from(iterations).unwrap_or(u8::MAX);
    morphology::dilate(src, Norm::LInf, radius)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigma_follows_kernel_size() {
        assert!((gaussian_sigma(21) - 3.5).abs() < 1e-6);
        assert!((gaussian_sigma(3) - 0.8).abs() < 1e-6);
        assert!(gaussian_sigma(5) > gaussian_sigma(3));
    }

    #[test]
    fn blur_of_flat_image_is_flat() {
        let src = GrayImage::from_pixel(30, 12, Luma([90]));
        let out = gaussian_blur(&src, 21);
        assert!(out.pixels().all(|p| p.0[0].abs_diff(90) <= 1));
    }

    #[test]
    fn blur_spreads_a_single_bright_pixel() {
        let mut src = GrayImage::new(15, 15);
        src.put_pixel(7, 7, Luma([255]));
        let out = gaussian_blur(&src, 5);
        assert!(out.get_pixel(7, 7).0[0] < 255);
        assert!(out.get_pixel(8, 7).0[0] > 0);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn kernel_of_one_is_identity() {
        let src = GrayImage::from_fn(6, 4, |x, y| Luma([(x * 10 + y) as u8]));
        assert_eq!(gaussian_blur(&src, 1), src);
    }

    #[test]
    fn diff_and_threshold() {
        let a = GrayImage::from_pixel(4, 1, Luma([100]));
        let b = GrayImage::from_fn(4, 1, |x, _| Luma([100 + x as u8 * 10]));
        let diff = abs_diff(&a, &b).unwrap();
        assert_eq!(diff.as_raw(), &vec![0, 10, 20, 30]);
        assert_eq!(abs_diff(&b, &a).unwrap(), diff);
        let mask = threshold(&diff, 10);
        assert_eq!(mask.as_raw(), &vec![0, 0, 255, 255]);

        assert!(abs_diff(&a, &GrayImage::new(3, 1)).is_err());
    }

    #[test]
    fn dilate_grows_by_one_pixel_per_iteration() {
        let mut src = GrayImage::new(9, 9);
        src.put_pixel(4, 4, Luma([255]));
        assert_eq!(dilate(&src, 0), src);
        let once = dilate(&src, 1);
        assert_eq!(once.pixels().filter(|p| p.0[0] == 255).count(), 9);
        let twice = dilate(&src, 2);
        assert_eq!(twice.pixels().filter(|p| p.0[0] == 255).count(), 25);
        assert_eq!(twice.get_pixel(2, 2).0[0], 255);
        assert_eq!(twice.get_pixel(1, 1).0[0], 0);
    }

    #[test]
    fn dilate_at_border_stays_in_bounds() {
        let mut src = GrayImage::new(3, 3);
        src.put_pixel(0, 0, Luma([255]));
        let out = dilate(&src, 1);
        assert_eq!(out.pixels().filter(|p| p.0[0] == 255).count(), 4);
    }
}
