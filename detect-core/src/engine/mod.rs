//! The inference-engine abstraction and its hardware back ends.
//!
//! An engine binds one device to one detection-model family. The worker that
//! owns it is the only caller of [`InferenceEngine::run_detection`], so the
//! trait takes `&mut self` and implementations keep their device state
//! (compiled network, cached request objects) without internal locking.

pub mod factory;
pub mod gpu;
pub mod openvino;
pub mod parser;

use std::fmt;

use crate::bbox::Prediction;
use crate::error::{Error, Result};

use parser::{SsdParams, YoloParams};

/// Uniform contract over the hardware back ends.
pub trait InferenceEngine: Send + fmt::Debug {
    /// Decode the image payload, run the network, and return the detections
    /// that survive the model family's score threshold (and, for YOLOv3,
    /// non-maximum suppression).
    fn run_detection(&mut self, data: &[u8]) -> Result<Prediction>;

    /// Class labels the network was trained with, in class order.
    fn labels(&self) -> &[String];
}

/// Device classes the dispatcher can route to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Fpga,
    Gpu,
}

impl DeviceKind {
    /// Map a configuration device name onto its class. Lookup is
    /// case-insensitive; names outside the known set are not implemented.
    pub fn from_device_name(name: &str) -> Result<Self> {
        match name.to_lowercase().trim() {
            "intel cpu" => Ok(Self::Cpu),
            "intel fpga" => Ok(Self::Fpga),
            "nvidia gpu" => Ok(Self::Gpu),
            _ => Err(Error::NotImplemented(format!("unknown device \"{name}\""))),
        }
    }

    /// Map a request-path device segment (`cpu` / `fpga` / `gpu`).
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment {
            "cpu" => Some(Self::Cpu),
            "fpga" => Some(Self::Fpga),
            "gpu" => Some(Self::Gpu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Fpga => "fpga",
            Self::Gpu => "gpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection-model family, carrying the family's parsing parameters.
#[derive(Clone, Debug)]
pub enum ModelKind {
    /// Single-shot detector: one output tensor of 7-float rows.
    Ssd(SsdParams),
    /// Grid-based detector: one region output per scale, plus greedy NMS.
    YoloV3(YoloParams),
    /// Two-stage detector: image tensor plus an image-info input, SSD-style
    /// output rows at a stricter threshold.
    FasterRcnn(SsdParams),
}

impl ModelKind {
    /// Resolve a configuration model name. Lookup is case-insensitive;
    /// unknown families are not implemented.
    pub fn from_model_name(name: &str) -> Result<Self> {
        match name.to_lowercase().trim() {
            "ssd" => Ok(Self::Ssd(SsdParams { score_threshold: 0.45 })),
            "yolov3" => Ok(Self::YoloV3(YoloParams::default())),
            "rcnn" => Ok(Self::FasterRcnn(SsdParams { score_threshold: 0.5 })),
            _ => Err(Error::NotImplemented(format!("unknown model \"{name}\""))),
        }
    }

    /// Whether the family feeds a secondary `[width, height]` image-info
    /// input next to the image tensor.
    pub fn wants_image_info(&self) -> bool {
        matches!(self, Self::FasterRcnn(_))
    }
}

/// Decode an encoded image payload.
pub(crate) fn decode_image(data: &[u8]) -> Result<image::DynamicImage> {
    image::load_from_memory(data).map_err(|e| Error::Decode(e.to_string()))
}

/// Lay a resized RGB image out as a planar NCHW u8 tensor.
pub(crate) fn fill_nchw(image: &image::RgbImage, out: &mut [u8]) {
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);
    let plane = width * height;
    for (x, y, pixel) in image.enumerate_pixels() {
        let cell = y as usize * width + x as usize;
        for channel in 0..3 {
            out[channel * plane + cell] = pixel[channel];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nchw_layout_is_planar() {
        let mut img = image::RgbImage::new(2, 2);
        img.put_pixel(0, 0, image::Rgb([1, 2, 3]));
        img.put_pixel(1, 0, image::Rgb([4, 5, 6]));
        img.put_pixel(0, 1, image::Rgb([7, 8, 9]));
        img.put_pixel(1, 1, image::Rgb([10, 11, 12]));

        let mut out = [0u8; 12];
        fill_nchw(&img, &mut out);
        assert_eq!(out, [1, 4, 7, 10, 2, 5, 8, 11, 3, 6, 9, 12]);
    }

    #[test]
    fn device_names_are_case_insensitive() {
        assert_eq!(DeviceKind::from_device_name("Intel CPU").unwrap(), DeviceKind::Cpu);
        assert_eq!(DeviceKind::from_device_name("INTEL FPGA").unwrap(), DeviceKind::Fpga);
        assert_eq!(DeviceKind::from_device_name("nvidia gpu").unwrap(), DeviceKind::Gpu);
    }

    #[test]
    fn unknown_device_is_not_implemented() {
        let err = DeviceKind::from_device_name("amd gpu").unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }

    #[test]
    fn model_names_resolve_to_families() {
        assert!(matches!(ModelKind::from_model_name("SSD").unwrap(), ModelKind::Ssd(_)));
        assert!(matches!(ModelKind::from_model_name("YoloV3").unwrap(), ModelKind::YoloV3(_)));
        assert!(matches!(ModelKind::from_model_name("rcnn").unwrap(), ModelKind::FasterRcnn(_)));
        assert!(ModelKind::from_model_name("mask-rcnn").is_err());
    }
}
