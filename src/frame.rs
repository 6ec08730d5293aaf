//! Frame container and the pixel operations the pipeline needs before detection.
//!
//! - `Frame`: owned RGB8 pixels plus capture time and the resolution the source produced.
//! - `ProcessingSize`: how frames are resized before analysis.
//!
//! Frames are never shared between the live loop and dispatched jobs. A job that
//! needs pixels receives its own `Frame` via `Clone`.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use std::time::SystemTime;

use crate::geometry::{Rect, Resolution};

/// A decoded video frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    captured_at: SystemTime,
    /// Resolution the frame had when it left the source (before any resize).
    source_resolution: Resolution,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: SystemTime) -> Self {
        let source_resolution = Resolution::new(image.width(), image.height());
        Self {
            image,
            captured_at,
            source_resolution,
        }
    }

    /// Build a frame from tightly packed RGB24 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, captured_at: SystemTime) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB frame buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, captured_at))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.image.width(), self.image.height())
    }

    pub fn source_resolution(&self) -> Resolution {
        self.source_resolution
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    /// Bilinear resize. Capture time and source resolution are preserved.
    pub fn resized(&self, target: Resolution) -> Frame {
        if target == self.resolution() {
            return self.clone();
        }
        let image = imageops::resize(&self.image, target.width, target.height, FilterType::Triangle);
        Frame {
            image,
            captured_at: self.captured_at,
            source_resolution: self.source_resolution,
        }
    }

    /// Copy out a sub-region. Fails when the region is empty or leaves the frame.
    pub fn crop(&self, region: Rect) -> Result<RgbImage> {
        if region.is_empty() {
            return Err(anyhow!("crop region {} is empty", region));
        }
        if !region.fits_within(self.resolution()) {
            return Err(anyhow!(
                "crop region {} exceeds frame {}",
                region,
                self.resolution()
            ));
        }
        Ok(imageops::crop_imm(&self.image, region.x, region.y, region.width, region.height).to_image())
    }
}

/// Luma conversion with BT.601 weights in 14-bit fixed point.
pub fn grayscale(image: &RgbImage) -> GrayImage {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;
    const ROUND: u32 = 1 << 13;

    let mut gray = GrayImage::new(image.width(), image.height());
    for (src, dst) in image.pixels().zip(gray.pixels_mut()) {
        let [r, g, b] = src.0;
        let luma = (r as u32 * R + g as u32 * G + b as u32 * B + ROUND) >> 14;
        *dst = Luma([luma.min(255) as u8]);
    }
    gray
}

/// Resolution frames are brought to before analysis.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum ProcessingSize {
    /// Analyse frames at whatever resolution the source delivers.
    #[default]
    Native,
    /// Resize every frame to a fixed resolution.
    Fixed(Resolution),
    /// Scale both axes by the same factor.
    Scale(f64),
}

impl ProcessingSize {
    pub fn target_for(&self, native: Resolution) -> Resolution {
        match *self {
            ProcessingSize::Native => native,
            ProcessingSize::Fixed(resolution) => resolution,
            ProcessingSize::Scale(factor) => Resolution::new(
                ((native.width as f64 * factor).round() as u32).max(1),
                ((native.height as f64 * factor).round() as u32).max(1),
            ),
        }
    }

    pub fn apply(&self, frame: &Frame) -> Frame {
        frame.resized(self.target_for(frame.resolution()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, value: u8) -> Frame {
        Frame::new(
            RgbImage::from_pixel(width, height, Rgb([value, value, value])),
            SystemTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn from_rgb_validates_length() {
        assert!(Frame::from_rgb(vec![0u8; 11], 2, 2, SystemTime::now()).is_err());
        let frame = Frame::from_rgb(vec![7u8; 12], 2, 2, SystemTime::now()).unwrap();
        assert_eq!(frame.resolution(), Resolution::new(2, 2));
    }

    #[test]
    fn grayscale_of_neutral_gray_is_identity() {
        let frame = solid(3, 2, 128);
        let gray = grayscale(frame.image());
        assert!(gray.pixels().all(|p| p.0[0] == 128));
    }

    #[test]
    fn grayscale_weights_green_heaviest() {
        let image = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        });
        let gray = grayscale(&image);
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
        assert_eq!(gray.get_pixel(1, 0).0[0], 150);
        assert_eq!(gray.get_pixel(2, 0).0[0], 29);
    }

    #[test]
    fn resize_keeps_source_resolution() {
        let frame = solid(40, 20, 10);
        let small = frame.resized(Resolution::new(20, 10));
        assert_eq!(small.resolution(), Resolution::new(20, 10));
        assert_eq!(small.source_resolution(), Resolution::new(40, 20));
        assert_eq!(small.captured_at(), frame.captured_at());
    }

    #[test]
    fn crop_rejects_out_of_bounds_regions() {
        let frame = solid(10, 10, 0);
        assert!(frame.crop(Rect::new(5, 5, 6, 2)).is_err());
        assert!(frame.crop(Rect::new(0, 0, 0, 2)).is_err());
        let roi = frame.crop(Rect::new(2, 3, 4, 5)).unwrap();
        assert_eq!(roi.dimensions(), (4, 5));
    }

    #[test]
    fn processing_size_targets() {
        let native = Resolution::new(1920, 1080);
        assert_eq!(ProcessingSize::Native.target_for(native), native);
        assert_eq!(
            ProcessingSize::Fixed(Resolution::new(800, 600)).target_for(native),
            Resolution::new(800, 600)
        );
        assert_eq!(
            ProcessingSize::Scale(0.4).target_for(native),
            Resolution::new(768, 432)
        );
    }
}
