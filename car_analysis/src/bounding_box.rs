/// One object instance reported by the detector, in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Detection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn intersection(&self, other: &Detection) -> f32 {
        let width = self.x2.min(other.x2) - self.x1.max(other.x1);
        let height = self.y2.min(other.y2) - self.y1.max(other.y1);
        width.max(0.0) * height.max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Scales from model-input space to image space and clips to the image.
    pub fn rescaled(&self, scale_x: f32, scale_y: f32, width: u32, height: u32) -> Self {
        let (width, height) = (width as f32, height as f32);
        Self {
            x1: (self.x1 * scale_x).clamp(0.0, width),
            y1: (self.y1 * scale_y).clamp(0.0, height),
            x2: (self.x2 * scale_x).clamp(0.0, width),
            y2: (self.y2 * scale_y).clamp(0.0, height),
            ..*self
        }
    }
}
