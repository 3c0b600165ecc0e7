use anyhow::Result;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Box colours in BGR order, indexed by class id.
const PALETTE: [[u8; 3]; 6] = [
    [0, 255, 0],
    [255, 0, 0],
    [0, 0, 255],
    [0, 255, 255],
    [255, 0, 255],
    [255, 255, 0],
];

const LINE_WIDTH: u32 = 2;

fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Render detections onto a copy of `frame`.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Result<Frame> {
    let mut canvas = frame.to_image()?;
    let (width, height) = frame.dimensions();

    for det in detections {
        let bbox = det.bbox().clamp_to(width, height);
        let color = class_color(det.class_id());
        for inset in 0..LINE_WIDTH {
            let w = (bbox.width().round() as i64 - 2 * inset as i64).max(1) as u32;
            let h = (bbox.height().round() as i64 - 2 * inset as i64).max(1) as u32;
            let rect = Rect::at(
                bbox.x1().round() as i32 + inset as i32,
                bbox.y1().round() as i32 + inset as i32,
            )
            .of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }

    frame.derive_from_image(canvas)
}
