//! Frame-differencing motion detection inside a region of interest.
//!
//! Pipeline per frame: grayscale + Gaussian blur of the ROI, absolute difference
//! against the previous buffer, binary threshold, dilation, outer contours,
//! area filter, translation back to frame coordinates.

mod components;
mod imgops;
mod motion;
mod result;

pub use components::{outer_components, Component};
pub use imgops::{abs_diff, dilate, gaussian_blur, gaussian_sigma, threshold};
pub use motion::{
    scaled_min_area, DetectionConfig, MotionDetector, MotionState, DEFAULT_BLUR_KERNEL,
    DEFAULT_DEBOUNCE_SECS, DEFAULT_DILATE_ITERATIONS, DEFAULT_MIN_AREA_FULL_FRAME,
    DEFAULT_THRESHOLD,
};
pub use result::DetectionResult;
