use serde::{Deserialize, Serialize};

/// A face found by the face model. Only lives for one processing call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Face {
    /// Bounding box as `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f32; 4],

    /// Detection confidence in `[0, 1]`.
    pub score: f32,

    /// Identity embedding used by the swap model.
    #[serde(default)]
    pub embedding: Vec<f32>,
}
