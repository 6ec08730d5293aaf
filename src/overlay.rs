//! Debug overlay: ROI outline and detection boxes drawn onto a frame copy.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;

use crate::frame::Frame;
use crate::geometry::Rect;

pub const ROI_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const LINE_THICKNESS: u32 = 2;

/// Copy of `frame` with the ROI in blue and each box in green.
pub fn annotate(frame: &Frame, roi: Rect, boxes: &[Rect]) -> Frame {
    let mut annotated = frame.clone();
    let image = annotated.image_mut();
    draw_rect(image, roi, ROI_COLOR, LINE_THICKNESS);
    for rect in boxes {
        draw_rect(image, *rect, BOX_COLOR, LINE_THICKNESS);
    }
    annotated
}

/// Outline drawn inward from the rectangle edge; clipped to the image.
pub fn draw_rect(image: &mut RgbImage, rect: Rect, color: Rgb<u8>, thickness: u32) {
    for inset in 0..thickness.max(1) {
        if rect.width <= 2 * inset || rect.height <= 2 * inset {
            break;
        }
        let outline = imageproc::rect::Rect::at((rect.x + inset) as i32, (rect.y + inset) as i32)
            .of_size(rect.width - 2 * inset, rect.height - 2 * inset);
        draw_hollow_rect_mut(image, outline, color);
    }
}
