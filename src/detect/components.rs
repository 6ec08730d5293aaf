//! Outer contours of a binary mask.
//!
//! Only top-level outer borders count: a blob sitting inside another blob's
//! hole belongs to its enclosing region. Area is the area enclosed by the
//! border polygon, so a one-pixel-wide line has no area.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::point::Point;

use crate::geometry::Rect;

/// One outer connected region of "changed" pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Component {
    /// Tight pixel box around the border.
    pub bounds: Rect,
    /// Area enclosed by the outer border, in pixels.
    pub area: f64,
}

/// Extract outer components (8-connected foreground), in raster order of
/// their first border pixel.
pub fn outer_components(mask: &GrayImage) -> Vec<Component> {
    if mask.width() == 0 || mask.height() == 0 {
        return Vec::new();
    }
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter_map(|c| component(&c))
        .collect()
}

fn component(contour: &Contour<i32>) -> Option<Component> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &contour.points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(Component {
        bounds: Rect::new(
            min_x.max(0) as u32,
            min_y.max(0) as u32,
            (max_x - min_x + 1) as u32,
            (max_y - min_y + 1) as u32,
        ),
        area: polygon_area(&contour.points),
    })
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    twice.abs() as f64 * 0.5
}
