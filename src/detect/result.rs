use crate::geometry::Rect;

/// Result of comparing two smoothed ROI buffers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    /// Did any changed region survive the area filter?
    pub motion_detected: bool,
    /// Bounding boxes of surviving regions, in full-frame processing coordinates.
    pub boxes: Vec<Rect>,
    /// Area of the largest surviving region (0 when nothing survived).
    pub largest_area: f64,
}

impl DetectionResult {
    pub fn none() -> Self {
        Self::default()
    }
}
