use anyhow::{anyhow, Result};

/// Axis-aligned box in frame pixel coordinates. Always `x1 <= x2`, `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(anyhow!("bounding box has non-finite coordinates"));
        }
        if x1 > x2 || y1 > y2 {
            return Err(anyhow!(
                "bounding box corners out of order: ({}, {}) -> ({}, {})",
                x1,
                y1,
                x2,
                y2
            ));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// Box from center and size.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Result<Self> {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn x1(&self) -> f32 {
        self.x1
    }

    pub fn y1(&self) -> f32 {
        self.y1
    }

    pub fn x2(&self) -> f32 {
        self.x2
    }

    pub fn y2(&self) -> f32 {
        self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Clip to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let l = self.x1.max(other.x1);
        let r = self.x2.min(other.x2);
        let t = self.y1.max(other.y1);
        let b = self.y2.min(other.y2);
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One object found in one frame.
///
/// Built once at the inference boundary; every accessor is infallible
/// downstream.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    bbox: BoundingBox,
    confidence: f32,
    class_id: u32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_id: u32) -> Result<Self> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!("confidence {} outside [0, 1]", confidence));
        }
        Ok(Self {
            bbox,
            confidence,
            class_id,
        })
    }

    pub fn from_xyxy(
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        confidence: f32,
        class_id: u32,
    ) -> Result<Self> {
        Self::new(BoundingBox::new(x1, y1, x2, y2)?, confidence, class_id)
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn center_x(&self) -> f32 {
        self.bbox.center_x()
    }

    pub fn center_y(&self) -> f32 {
        self.bbox.center_y()
    }

    pub fn width(&self) -> f32 {
        self.bbox.width()
    }

    pub fn height(&self) -> f32 {
        self.bbox.height()
    }
}

/// Greedy per-class non-maximum suppression.
///
/// Keeps the highest-confidence box of every overlapping group whose IoU
/// exceeds `iou_threshold`. Output is ordered by descending confidence.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_center_and_size_from_corners() {
        let det = Detection::from_xyxy(10.0, 20.0, 30.0, 60.0, 0.9, 0).unwrap();
        assert_eq!(det.center_x(), 20.0);
        assert_eq!(det.center_y(), 40.0);
        assert_eq!(det.width(), 20.0);
        assert_eq!(det.height(), 40.0);
    }

    #[test]
    fn rejects_inverted_corners_and_bad_confidence() {
        assert!(BoundingBox::new(30.0, 0.0, 10.0, 5.0).is_err());
        assert!(BoundingBox::new(0.0, 9.0, 1.0, 5.0).is_err());
        assert!(BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).is_err());

        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        assert!(Detection::new(bbox, 1.2, 0).is_err());
        assert!(Detection::new(bbox, -0.1, 0).is_err());
        assert!(Detection::new(bbox, f32::NAN, 0).is_err());
        assert!(Detection::new(bbox, 1.0, 0).is_ok());
    }

    #[test]
    fn degenerate_boxes_are_allowed() {
        let bbox = BoundingBox::new(5.0, 5.0, 5.0, 5.0).unwrap();
        assert_eq!(bbox.area(), 0.0);
        assert_eq!(bbox.iou(&bbox), 0.0);
    }

    #[test]
    fn clamp_keeps_order() {
        let bbox = BoundingBox::new(-10.0, -5.0, 700.0, 30.0).unwrap();
        let clipped = bbox.clamp_to(640, 480);
        assert_eq!(
            (clipped.x1(), clipped.y1(), clipped.x2(), clipped.y2()),
            (0.0, 0.0, 640.0, 30.0)
        );
    }

    #[test]
    fn nms_suppresses_same_class_overlap_only() {
        let a = Detection::from_xyxy(0.0, 0.0, 10.0, 10.0, 0.9, 0).unwrap();
        let b = Detection::from_xyxy(1.0, 1.0, 11.0, 11.0, 0.8, 0).unwrap();
        let c = Detection::from_xyxy(1.0, 1.0, 11.0, 11.0, 0.7, 2).unwrap();
        let d = Detection::from_xyxy(50.0, 50.0, 60.0, 60.0, 0.6, 0).unwrap();

        let kept = non_max_suppression(vec![d.clone(), b, c.clone(), a.clone()], 0.5);
        assert_eq!(kept, vec![a, c, d]);
    }
}
