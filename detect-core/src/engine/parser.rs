//! Output-tensor parsers for the supported model families.
//!
//! These are pure functions over host-side `f32` buffers so every back end
//! shares one implementation: the SDK back end hands over its output blobs,
//! the GPU back end hands over its readback buffers.

use crate::bbox::{BoundingBox, Prediction};
use crate::error::{Error, Result};
use crate::labels;

/// Floats per detection row in SSD-layout outputs:
/// `(image_id, label_id, score, xmin, ymin, xmax, ymax)`.
pub const DETECTION_ROW: usize = 7;

/// Parameters of the plain-row parsers (SSD and FasterRCNN).
#[derive(Clone, Copy, Debug)]
pub struct SsdParams {
    pub score_threshold: f32,
}

/// Parameters of the YOLOv3 region parser.
#[derive(Clone, Debug)]
pub struct YoloParams {
    /// Anchor table, `(w, h)` pairs flattened, shared across scales.
    pub anchors: Vec<f32>,
    /// Box coordinates per anchor.
    pub coords: usize,
    /// Classes per anchor.
    pub classes: usize,
    /// Anchors per grid cell.
    pub num: usize,
    pub score_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            anchors: vec![
                10.0, 13.0, 16.0, 30.0, 33.0, 23.0, 30.0, 61.0, 62.0, 45.0, 59.0, 119.0,
                116.0, 90.0, 156.0, 198.0, 373.0, 326.0,
            ],
            coords: 4,
            classes: 80,
            num: 3,
            score_threshold: 0.5,
            iou_threshold: 0.4,
        }
    }
}

/// A decoded candidate box before label resolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
    pub class_id: usize,
    pub confidence: f32,
}

impl RawDetection {
    /// Build a box from a YOLO center/size tuple in resized-image
    /// coordinates, scaling back to the original image.
    fn from_center(
        x: f32,
        y: f32,
        h: f32,
        w: f32,
        class_id: usize,
        confidence: f32,
        h_scale: f32,
        w_scale: f32,
    ) -> Self {
        let xmin = ((x - w / 2.0) * w_scale) as i32;
        let ymin = ((y - h / 2.0) * h_scale) as i32;
        Self {
            xmin,
            ymin,
            xmax: (xmin as f32 + w * w_scale) as i32,
            ymax: (ymin as f32 + h * h_scale) as i32,
            class_id,
            confidence,
        }
    }
}

/// Walk an SSD-layout output and keep rows above the score threshold.
///
/// The walk stops at the sentinel terminator (`image_id < 0`) or at the
/// first non-positive label id. Normalized coordinates are multiplied by the
/// original image dimensions.
pub fn parse_plain_output(
    detections: &[f32],
    width: u32,
    height: u32,
    threshold: f32,
    labels: &[String],
) -> Prediction {
    let mut out = Prediction::new();
    for row in detections.chunks_exact(DETECTION_ROW) {
        if row[0] < 0.0 {
            break;
        }
        let label_id = row[1] as i32;
        if label_id <= 0 {
            break;
        }
        let score = row[2];
        if score < threshold {
            continue;
        }
        out.push(BoundingBox {
            label_id,
            label: labels::resolve(labels, label_id),
            score,
            xmin: (row[3] * width as f32) as i32,
            ymin: (row[4] * height as f32) as i32,
            xmax: (row[5] * width as f32) as i32,
            ymax: (row[6] * height as f32) as i32,
        });
    }
    out
}

/// Flat index of one entry in a region blob laid out as
/// `[anchor][entry][cell]` over a `side × side` grid.
fn entry_index(side: usize, coords: usize, classes: usize, location: usize, entry: usize) -> usize {
    let cells = side * side;
    let n = location / cells;
    let cell = location % cells;
    n * cells * (coords + classes + 1) + entry * cells + cell
}

/// Anchor-pair offset for a canonical YOLOv3 scale.
fn anchor_offset(side: usize) -> Result<usize> {
    match side {
        13 => Ok(12),
        26 => Ok(6),
        52 => Ok(0),
        _ => Err(Error::Inference(format!("unsupported region output side {side}"))),
    }
}

/// Decode one region output (one grid scale) into candidate boxes.
///
/// Candidates are produced in original-image coordinates; `resized` is the
/// network input size the image was scaled to for inference.
pub fn parse_region_output(
    blob: &[f32],
    side: usize,
    params: &YoloParams,
    resized: (u32, u32),
    original: (u32, u32),
    candidates: &mut Vec<RawDetection>,
) -> Result<()> {
    let offset = anchor_offset(side)?;
    let cells = side * side;
    let expected = params.num * cells * (params.coords + params.classes + 1);
    if blob.len() < expected {
        return Err(Error::Inference(format!(
            "region output too small: {} floats, expected {expected}",
            blob.len()
        )));
    }
    if params.anchors.len() < offset + 2 * params.num {
        return Err(Error::Inference("anchor table too small for region output".into()));
    }

    let (resized_w, resized_h) = (resized.0 as f32, resized.1 as f32);
    let h_scale = original.1 as f32 / resized_h;
    let w_scale = original.0 as f32 / resized_w;

    for i in 0..cells {
        let row = i / side;
        let col = i % side;
        for n in 0..params.num {
            let obj_index = entry_index(side, params.coords, params.classes, n * cells + i, params.coords);
            let box_index = entry_index(side, params.coords, params.classes, n * cells + i, 0);
            let scale = blob[obj_index];
            if scale < params.score_threshold {
                continue;
            }
            let x = (col as f32 + blob[box_index]) / side as f32 * resized_w;
            let y = (row as f32 + blob[box_index + cells]) / side as f32 * resized_h;
            let w = blob[box_index + 2 * cells].exp() * params.anchors[offset + 2 * n];
            let h = blob[box_index + 3 * cells].exp() * params.anchors[offset + 2 * n + 1];
            for class in 0..params.classes {
                let class_index = entry_index(
                    side,
                    params.coords,
                    params.classes,
                    n * cells + i,
                    params.coords + 1 + class,
                );
                let prob = scale * blob[class_index];
                if prob < params.score_threshold {
                    continue;
                }
                candidates.push(RawDetection::from_center(
                    x, y, h, w, class, prob, h_scale, w_scale,
                ));
            }
        }
    }
    Ok(())
}

/// Intersection-over-union of two boxes.
pub fn intersection_over_union(a: &RawDetection, b: &RawDetection) -> f32 {
    let overlap_w = (a.xmax.min(b.xmax) - a.xmin.max(b.xmin)) as f32;
    let overlap_h = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin)) as f32;
    let overlap = if overlap_w < 0.0 || overlap_h < 0.0 {
        0.0
    } else {
        overlap_w * overlap_h
    };
    let area_a = ((a.ymax - a.ymin) * (a.xmax - a.xmin)) as f32;
    let area_b = ((b.ymax - b.ymin) * (b.xmax - b.xmin)) as f32;
    let union = area_a + area_b - overlap;
    if union <= 0.0 {
        0.0
    } else {
        overlap / union
    }
}

/// Greedy non-maximum suppression: sort by confidence descending, then zero
/// out every lower-ranked box overlapping a survivor at or above the IoU
/// threshold.
pub fn non_max_suppression(candidates: &mut [RawDetection], iou_threshold: f32) {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for i in 0..candidates.len() {
        if candidates[i].confidence == 0.0 {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if intersection_over_union(&candidates[i], &candidates[j]) >= iou_threshold {
                candidates[j].confidence = 0.0;
            }
        }
    }
}

/// Suppress overlaps and resolve surviving candidates into labeled boxes.
pub fn finalize_yolo(
    mut candidates: Vec<RawDetection>,
    params: &YoloParams,
    labels: &[String],
) -> Prediction {
    non_max_suppression(&mut candidates, params.iou_threshold);
    candidates
        .into_iter()
        .filter(|c| c.confidence >= params.score_threshold)
        .map(|c| {
            let label_id = c.class_id as i32 + 1;
            BoundingBox {
                label_id,
                label: labels::resolve(labels, label_id),
                score: c.confidence,
                xmin: c.xmin,
                ymin: c.ymin,
                xmax: c.xmax,
                ymax: c.ymax,
            }
        })
        .collect()
}
