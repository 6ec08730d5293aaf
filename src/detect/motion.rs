use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use std::time::Duration;

use crate::detect::components::outer_components;
use crate::detect::imgops::{abs_diff, dilate, gaussian_blur, threshold};
use crate::detect::result::DetectionResult;
use crate::frame::{grayscale, Frame};
use crate::geometry::{Rect, Resolution};

pub const DEFAULT_THRESHOLD: u8 = 16;
pub const DEFAULT_MIN_AREA_FULL_FRAME: f64 = 1200.0;
pub const DEFAULT_DEBOUNCE_SECS: u64 = 10;
pub const DEFAULT_BLUR_KERNEL: u32 = 21;
pub const DEFAULT_DILATE_ITERATIONS: u32 = 2;

/// Tunables for frame differencing and triggering.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionConfig {
    /// Per-pixel intensity delta that counts as change.
    pub threshold: u8,
    /// Minimum region area, in pixels, as if the ROI covered the whole reference frame.
    pub min_area_full_frame: f64,
    /// Canonical full-frame area `min_area_full_frame` refers to.
    /// `None` uses the area of the processed frame.
    pub reference_area: Option<u64>,
    /// Minimum spacing between confirmed triggers.
    pub debounce: Duration,
    /// Gaussian kernel size (odd).
    pub blur_kernel: u32,
    pub dilate_iterations: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_area_full_frame: DEFAULT_MIN_AREA_FULL_FRAME,
            reference_area: None,
            debounce: Duration::from_secs(DEFAULT_DEBOUNCE_SECS),
            blur_kernel: DEFAULT_BLUR_KERNEL,
            dilate_iterations: DEFAULT_DILATE_ITERATIONS,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.blur_kernel == 0 || self.blur_kernel % 2 == 0 {
            return Err(anyhow!(
                "blur kernel must be a positive odd number, got {}",
                self.blur_kernel
            ));
        }
        if !self.min_area_full_frame.is_finite() || self.min_area_full_frame < 0.0 {
            return Err(anyhow!("minimum area must be a non-negative number"));
        }
        if self.reference_area == Some(0) {
            return Err(anyhow!("reference area must be greater than zero"));
        }
        Ok(())
    }
}

/// Rescale a full-frame area threshold to an ROI.
///
/// A full-frame-sized ROI keeps `min_area_full_frame` unchanged.
pub fn scaled_min_area(min_area_full_frame: f64, roi_area: u64, reference_area: u64) -> f64 {
    if reference_area == 0 {
        return min_area_full_frame;
    }
    min_area_full_frame * (roi_area as f64 / reference_area as f64)
}

/// Frame-differencing detector bound to one ROI.
///
/// Stateless between calls: the caller keeps the previous buffer in a `MotionState`.
#[derive(Clone, Debug)]
pub struct MotionDetector {
    roi: Rect,
    threshold: u8,
    min_area: f64,
    blur_kernel: u32,
    dilate_iterations: u32,
}

impl MotionDetector {
    /// `frame` is the processing resolution the ROI was mapped into.
    pub fn new(config: &DetectionConfig, roi: Rect, frame: Resolution) -> Self {
        let reference_area = config.reference_area.unwrap_or_else(|| frame.area());
        Self {
            roi,
            threshold: config.threshold,
            min_area: scaled_min_area(config.min_area_full_frame, roi.area(), reference_area),
            blur_kernel: config.blur_kernel,
            dilate_iterations: config.dilate_iterations,
        }
    }

    pub fn roi(&self) -> Rect {
        self.roi
    }

    pub fn min_area(&self) -> f64 {
        self.min_area
    }

    /// Extract the ROI, convert to grayscale and blur it.
    ///
    /// Fails when the ROI no longer fits inside `frame`.
    pub fn smooth_roi(&self, frame: &Frame) -> Result<GrayImage> {
        let region = frame
            .crop(self.roi)
            .context("extract region of interest")?;
        Ok(gaussian_blur(&grayscale(&region), self.blur_kernel))
    }

    /// Compare two smoothed ROI buffers.
    pub fn detect(&self, previous: &GrayImage, current: &GrayImage) -> Result<DetectionResult> {
        let diff = abs_diff(previous, current)?;
        let mask = dilate(&threshold(&diff, self.threshold), self.dilate_iterations);

        let mut result = DetectionResult::none();
        for component in outer_components(&mask) {
            if component.area <= self.min_area {
                continue;
            }
            result
                .boxes
                .push(component.bounds.offset_by(self.roi.x, self.roi.y));
            result.largest_area = result.largest_area.max(component.area);
        }
        result.motion_detected = !result.boxes.is_empty();
        Ok(result)
    }
}

/// Previous smoothed ROI buffer, owned by the orchestrator.
#[derive(Clone, Debug)]
pub struct MotionState {
    previous: GrayImage,
}

impl MotionState {
    pub fn new(initial: GrayImage) -> Self {
        Self { previous: initial }
    }

    pub fn previous(&self) -> &GrayImage {
        &self.previous
    }

    /// Make `current` the baseline for the next comparison.
    pub fn advance(&mut self, current: GrayImage) {
        self.previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::time::SystemTime;

    fn frame_with_square(width: u32, height: u32, square: Option<Rect>) -> Frame {
        let image = RgbImage::from_fn(width, height, |x, y| match square {
            Some(r) if x >= r.x && x < r.right() && y >= r.y && y < r.bottom() => {
                Rgb([250, 250, 250])
            }
            _ => Rgb([20, 20, 20]),
        });
        Frame::new(image, SystemTime::now())
    }

    fn detector(roi: Rect, frame: Resolution) -> MotionDetector {
        let config = DetectionConfig {
            min_area_full_frame: 200.0,
            ..DetectionConfig::default()
        };
        MotionDetector::new(&config, roi, frame)
    }

    #[test]
    fn identical_frames_produce_no_motion() {
        let res = Resolution::new(160, 120);
        let det = detector(Rect::new(40, 30, 80, 60), res);
        let frame = frame_with_square(160, 120, Some(Rect::new(60, 50, 10, 10)));
        let a = det.smooth_roi(&frame).unwrap();
        let b = det.smooth_roi(&frame.clone()).unwrap();
        let result = det.detect(&a, &b).unwrap();
        assert!(!result.motion_detected);
        assert!(result.boxes.is_empty());
        assert_eq!(result.largest_area, 0.0);
    }

    #[test]
    fn solid_block_yields_one_box_in_frame_coordinates() {
        let res = Resolution::new(160, 120);
        let roi = Rect::new(40, 30, 80, 60);
        let det = detector(roi, res);
        let square = Rect::new(60, 50, 16, 16);

        let before = det.smooth_roi(&frame_with_square(160, 120, None)).unwrap();
        let after = det
            .smooth_roi(&frame_with_square(160, 120, Some(square)))
            .unwrap();
        let result = det.detect(&before, &after).unwrap();

        assert!(result.motion_detected);
        assert_eq!(result.boxes.len(), 1);
        let b = result.boxes[0];
        assert!(b.contains_rect(&square), "box {} should cover {}", b, square);
        assert!(roi.contains_rect(&b));
        assert!(result.largest_area > det.min_area());
    }

    #[test]
    fn change_outside_roi_is_ignored() {
        let res = Resolution::new(160, 120);
        let det = detector(Rect::new(0, 0, 60, 60), res);
        let before = det.smooth_roi(&frame_with_square(160, 120, None)).unwrap();
        let after = det
            .smooth_roi(&frame_with_square(160, 120, Some(Rect::new(120, 90, 20, 20))))
            .unwrap();
        assert!(!det.detect(&before, &after).unwrap().motion_detected);
    }

    #[test]
    fn small_change_below_min_area_is_filtered() {
        let res = Resolution::new(160, 120);
        let config = DetectionConfig {
            min_area_full_frame: 100_000.0,
            ..DetectionConfig::default()
        };
        let det = MotionDetector::new(&config, res.full_rect(), res);
        let before = det.smooth_roi(&frame_with_square(160, 120, None)).unwrap();
        let after = det
            .smooth_roi(&frame_with_square(160, 120, Some(Rect::new(70, 50, 6, 6))))
            .unwrap();
        let result = det.detect(&before, &after).unwrap();
        assert!(!result.motion_detected);
        assert!(result.boxes.is_empty());
    }

    #[test]
    fn min_area_is_idempotent_for_full_frame_roi() {
        assert_eq!(scaled_min_area(1200.0, 800 * 600, 800 * 600), 1200.0);
        let res = Resolution::new(800, 600);
        let det = MotionDetector::new(&DetectionConfig::default(), res.full_rect(), res);
        assert_eq!(det.min_area(), DEFAULT_MIN_AREA_FULL_FRAME);
    }

    #[test]
    fn min_area_scales_with_roi_and_reference_area() {
        assert_eq!(scaled_min_area(1200.0, 150 * 150, 800 * 600), 56.25);
        let config = DetectionConfig {
            min_area_full_frame: 50.0,
            reference_area: Some(1920 * 1080),
            ..DetectionConfig::default()
        };
        let det = MotionDetector::new(&config, Rect::new(250, 200, 300, 200), Resolution::new(768, 432));
        let expected = 50.0 * (300.0 * 200.0) / (1920.0 * 1080.0);
        assert!((det.min_area() - expected).abs() < 1e-9);
    }

    #[test]
    fn roi_outside_frame_fails_extraction() {
        let det = detector(Rect::new(100, 100, 80, 60), Resolution::new(160, 120));
        assert!(det.smooth_roi(&frame_with_square(160, 120, None)).is_err());
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let det = detector(Rect::new(0, 0, 10, 10), Resolution::new(10, 10));
        assert!(det
            .detect(&GrayImage::new(10, 10), &GrayImage::new(9, 10))
            .is_err());
    }

    #[test]
    fn state_advances_to_current_buffer() {
        let mut state = MotionState::new(GrayImage::new(2, 2));
        let next = GrayImage::from_pixel(2, 2, image::Luma([9]));
        state.advance(next.clone());
        assert_eq!(state.previous(), &next);
    }

    #[test]
    fn config_rejects_even_blur_kernel() {
        let config = DetectionConfig {
            blur_kernel: 20,
            ..DetectionConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(DetectionConfig::default().validate().is_ok());
    }
}
