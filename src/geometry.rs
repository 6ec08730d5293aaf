
/// Pixel coordinate in some frame's coordinate space. May be negative before clamping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Width and height of a frame in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Rectangle covering the whole frame.
    pub fn full_rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned pixel rectangle. `x + width` and `y + height` are exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle from a top-left and an exclusive bottom-right corner.
    /// Returns `None` when the corners do not span a positive area.
    pub fn from_corners(top_left: (u32, u32), bottom_right: (u32, u32)) -> Option<Self> {
        if bottom_right.0 <= top_left.0 || bottom_right.1 <= top_left.1 {
            return None;
        }
        Some(Self::new(
            top_left.0,
            top_left.1,
            bottom_right.0 - top_left.0,
            bottom_right.1 - top_left.1,
        ))
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Shift by an origin, e.g. from ROI-local into full-frame coordinates.
    pub fn offset_by(&self, origin_x: u32, origin_y: u32) -> Self {
        Self::new(self.x + origin_x, self.y + origin_y, self.width, self.height)
    }

    /// True when `other` lies entirely inside this rectangle.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// True when the rectangle lies entirely inside a frame of the given size.
    pub fn fits_within(&self, resolution: Resolution) -> bool {
        resolution.full_rect().contains_rect(self)
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({},{})-({},{})",
            self.x,
            self.y,
            self.right(),
            self.bottom()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_must_span_positive_area() {
        assert!(Rect::from_corners((10, 10), (10, 20)).is_none());
        assert!(Rect::from_corners((10, 10), (5, 20)).is_none());
        let rect = Rect::from_corners((10, 20), (30, 25)).unwrap();
        assert_eq!(rect, Rect::new(10, 20, 20, 5));
        assert_eq!(rect.right(), 30);
        assert_eq!(rect.bottom(), 25);
    }

    #[test]
    fn rect_fits_within_frame() {
        let res = Resolution::new(100, 50);
        assert!(Rect::new(0, 0, 100, 50).fits_within(res));
        assert!(!Rect::new(1, 0, 100, 50).fits_within(res));
        assert!(Rect::new(90, 40, 10, 10).fits_within(res));
    }
}
