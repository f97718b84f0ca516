use serde::{Deserialize, Serialize};

/// One detection: a class label with a confidence score and a box in
/// image-space pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub label_id: i32,
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub score: f32,
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
}

/// Ordered detections for one image, zero or more. The order is decided by
/// the back end but is deterministic for identical inputs.
pub type Prediction = Vec<BoundingBox>;
