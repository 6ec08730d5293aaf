//! Region-of-interest mapping.
//!
//! An ROI is written against a reference resolution (usually the camera's native
//! stream) and has to be re-expressed in the resolution frames are analysed at.
//! Mapping runs once, on the first frame, and the result is reused for the
//! whole run.

use anyhow::{anyhow, Result};

use crate::geometry::{Point, Rect, Resolution};

/// How an ROI is written down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoiSpec {
    /// Top-left and bottom-right corners (bottom-right exclusive).
    Corners { top_left: Point, bottom_right: Point },
    /// Origin plus extent.
    Region {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    },
}

impl RoiSpec {
    pub fn corners(&self) -> (Point, Point) {
        match *self {
            RoiSpec::Corners {
                top_left,
                bottom_right,
            } => (top_left, bottom_right),
            RoiSpec::Region {
                x,
                y,
                width,
                height,
            } => (Point::new(x, y), Point::new(x + width, y + height)),
        }
    }
}

/// ROI plus the resolution its coordinates refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoiConfig {
    pub spec: RoiSpec,
    /// `None` means "the native resolution of the stream".
    pub reference: Option<Resolution>,
}

impl RoiConfig {
    /// Map into `target`, using `native` when no reference resolution was configured.
    pub fn resolve(&self, native: Resolution, target: Resolution) -> Result<RoiMapping> {
        map_roi(&self.spec, self.reference.unwrap_or(native), target)
    }
}

/// Ratio of processing resolution to reference resolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleFactors {
    pub fx: f64,
    pub fy: f64,
}

impl ScaleFactors {
    pub fn between(reference: Resolution, target: Resolution) -> Result<Self> {
        if reference.is_empty() {
            return Err(anyhow!("ROI reference resolution {} is empty", reference));
        }
        Ok(Self {
            fx: target.width as f64 / reference.width as f64,
            fy: target.height as f64 / reference.height as f64,
        })
    }

    fn apply(&self, point: Point) -> Point {
        Point::new(
            (point.x as f64 * self.fx).trunc() as i64,
            (point.y as f64 * self.fy).trunc() as i64,
        )
    }
}

/// Validated ROI in processing coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoiMapping {
    pub rect: Rect,
    pub scale: ScaleFactors,
    /// Set when the mapped region was degenerate and the whole frame was substituted.
    pub full_frame_fallback: bool,
}

impl RoiMapping {
    /// Whole-frame ROI, used when no ROI is configured at all.
    pub fn full_frame(target: Resolution) -> Self {
        Self {
            rect: target.full_rect(),
            scale: ScaleFactors { fx: 1.0, fy: 1.0 },
            full_frame_fallback: false,
        }
    }
}

/// Scale an ROI from `reference` into `target`, clamp it, and fall back to the
/// full target frame when nothing of positive area remains.
pub fn map_roi(spec: &RoiSpec, reference: Resolution, target: Resolution) -> Result<RoiMapping> {
    if target.is_empty() {
        return Err(anyhow!("processing resolution {} is empty", target));
    }
    let scale = ScaleFactors::between(reference, target)?;
    let (top_left, bottom_right) = spec.corners();
    let top_left = clamp_point(scale.apply(top_left), target);
    let bottom_right = clamp_point(scale.apply(bottom_right), target);

    match Rect::from_corners(top_left, bottom_right) {
        Some(rect) => Ok(RoiMapping {
            rect,
            scale,
            full_frame_fallback: false,
        }),
        None => {
            log::warn!(
                "ROI {:?} maps to an empty region at {}; using the full frame",
                spec,
                target
            );
            Ok(RoiMapping {
                rect: target.full_rect(),
                scale,
                full_frame_fallback: true,
            })
        }
    }
}

fn clamp_point(point: Point, bounds: Resolution) -> (u32, u32) {
    (
        point.x.clamp(0, bounds.width as i64) as u32,
        point.y.clamp(0, bounds.height as i64) as u32,
    )
}
