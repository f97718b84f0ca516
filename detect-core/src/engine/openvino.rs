//! Back end over the OpenVINO toolkit, covering the CPU and FPGA device
//! classes.
//!
//! The toolkit owns the device transfer: the payload is decoded on the host,
//! written into an input tensor, and an inference-request object moves it to
//! the device. On the CPU any number of request objects may exist per
//! compiled network, so one is created per call; the FPGA plugin permits
//! exactly one, which is created at construction and reused for the engine's
//! lifetime.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::time::Instant;

use image::imageops::FilterType;
use openvino::{CompiledModel, Core, DeviceType, ElementType, InferRequest, Shape, Tensor};

use crate::bbox::Prediction;
use crate::config::EngineSpec;
use crate::error::{Error, Result};
use crate::labels;

use super::parser::{self, DETECTION_ROW};
use super::{decode_image, fill_nchw, DeviceKind, InferenceEngine, ModelKind};

pub struct OpenVinoEngine {
    compiled: CompiledModel,
    /// Cached request for the single-request FPGA plugin; `None` on the CPU.
    request: Option<InferRequest>,
    single_request: bool,
    kind: ModelKind,
    labels: Vec<String>,
    input_name: String,
    /// Secondary `[width, height]` input of two-stage models.
    info_input_name: Option<String>,
    output_names: Vec<String>,
    input_width: usize,
    input_height: usize,
}

impl fmt::Debug for OpenVinoEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenVinoEngine")
            .field("single_request", &self.single_request)
            .field("kind", &self.kind)
            .field("labels", &self.labels)
            .field("input_name", &self.input_name)
            .field("info_input_name", &self.info_input_name)
            .field("output_names", &self.output_names)
            .field("input_width", &self.input_width)
            .field("input_height", &self.input_height)
            .finish_non_exhaustive()
    }
}

fn config_err(context: &str, err: impl fmt::Display) -> Error {
    Error::Config(format!("{context}: {err}"))
}

fn infer_err(context: &str, err: impl fmt::Display) -> Error {
    Error::Inference(format!("{context}: {err}"))
}

/// The toolkit reads the topology from the `.xml` graph and the weights from
/// the `.bin` file next to it.
fn weights_path(graph: &str) -> String {
    match graph.strip_suffix(".xml") {
        Some(stem) => format!("{stem}.bin"),
        None => format!("{graph}.bin"),
    }
}

impl OpenVinoEngine {
    pub fn new(spec: &EngineSpec, kind: ModelKind, device: DeviceKind) -> Result<Self> {
        let device_type = match device {
            DeviceKind::Cpu => DeviceType::CPU,
            DeviceKind::Fpga => DeviceType::Other(Cow::Borrowed("HETERO:FPGA,CPU")),
            DeviceKind::Gpu => {
                return Err(Error::NotImplemented(
                    "the OpenVINO back end does not drive GPU devices".into(),
                ))
            }
        };

        let labels = labels::load(Path::new(&spec.model.label))?;

        let mut core =
            Core::new().map_err(|e| config_err("cannot initialize the inference core", e))?;
        let model = core
            .read_model_from_file(&spec.model.graph, &weights_path(&spec.model.graph))
            .map_err(|e| config_err("cannot read model graph", e))?;

        let n_inputs = model
            .get_inputs_len()
            .map_err(|e| config_err("cannot inspect model inputs", e))?;
        let n_outputs = model
            .get_outputs_len()
            .map_err(|e| config_err("cannot inspect model outputs", e))?;

        let expected_inputs = if kind.wants_image_info() { 2 } else { 1 };
        if n_inputs != expected_inputs {
            return Err(Error::Config(format!(
                "model expects {expected_inputs} input(s), graph has {n_inputs}"
            )));
        }

        let mut input_name = None;
        let mut info_input_name = None;
        let mut input_hw = None;
        for i in 0..n_inputs {
            let node = model
                .get_input_by_index(i)
                .map_err(|e| config_err("cannot inspect model input", e))?;
            let name = node
                .get_name()
                .map_err(|e| config_err("cannot read input name", e))?;
            let dims = node
                .get_shape()
                .map_err(|e| config_err("cannot read input shape", e))?
                .get_dimensions()
                .to_vec();
            match dims.len() {
                // Image tensor, NCHW.
                4 => {
                    input_hw = Some((dims[2] as usize, dims[3] as usize));
                    input_name = Some(name);
                }
                // Image-info placeholder of two-stage models.
                2 => info_input_name = Some(name),
                n => {
                    return Err(Error::Config(format!(
                        "unsupported {n}-dimensional model input \"{name}\""
                    )))
                }
            }
        }
        let input_name =
            input_name.ok_or_else(|| Error::Config("model has no NCHW image input".into()))?;
        let (input_height, input_width) =
            input_hw.ok_or_else(|| Error::Config("model input shape is unknown".into()))?;
        if kind.wants_image_info() && info_input_name.is_none() {
            return Err(Error::Config(
                "two-stage model is missing its image-info input".into(),
            ));
        }

        let mut output_names = Vec::with_capacity(n_outputs);
        for i in 0..n_outputs {
            let node = model
                .get_output_by_index(i)
                .map_err(|e| config_err("cannot inspect model output", e))?;
            let name = node
                .get_name()
                .map_err(|e| config_err("cannot read output name", e))?;
            let dims = node
                .get_shape()
                .map_err(|e| config_err("cannot read output shape", e))?
                .get_dimensions()
                .to_vec();
            sanity_check_output(&kind, &name, &dims)?;
            output_names.push(name);
        }
        match &kind {
            ModelKind::Ssd(_) if n_outputs != 1 => {
                return Err(Error::Config(format!(
                    "SSD graph must have one output, got {n_outputs}"
                )))
            }
            _ if n_outputs == 0 => {
                return Err(Error::Config("model graph has no outputs".into()))
            }
            _ => {}
        }

        let compiled = core
            .compile_model(&model, device_type)
            .map_err(|e| config_err("cannot compile model for the device", e))?;

        let single_request = device == DeviceKind::Fpga;
        let mut engine = Self {
            compiled,
            request: None,
            single_request,
            kind,
            labels,
            input_name,
            info_input_name,
            output_names,
            input_width,
            input_height,
        };
        if single_request {
            let request = engine
                .compiled
                .create_infer_request()
                .map_err(|e| config_err("cannot create the device inference request", e))?;
            engine.request = Some(request);
        }
        Ok(engine)
    }

    fn image_tensor(&self, img: &image::DynamicImage) -> Result<Tensor> {
        let shape = Shape::new(&[1, 3, self.input_height as i64, self.input_width as i64])
            .map_err(|e| infer_err("cannot build input shape", e))?;
        let mut tensor = Tensor::new(ElementType::U8, &shape)
            .map_err(|e| infer_err("cannot allocate input tensor", e))?;
        let resized = img
            .resize_exact(
                self.input_width as u32,
                self.input_height as u32,
                FilterType::Triangle,
            )
            .to_rgb8();
        fill_nchw(
            &resized,
            tensor
                .get_raw_data_mut()
                .map_err(|e| infer_err("cannot access input tensor data", e))?,
        );
        Ok(tensor)
    }
}

/// Per-family shape check, failing construction on a graph that cannot be
/// parsed by the family's output walker.
fn sanity_check_output(kind: &ModelKind, name: &str, dims: &[i64]) -> Result<()> {
    match kind {
        ModelKind::Ssd(_) | ModelKind::FasterRcnn(_) => {
            if dims.len() != 4 || dims.last().copied() != Some(DETECTION_ROW as i64) {
                return Err(Error::Config(format!(
                    "detection output \"{name}\" must be [1, 1, N, {DETECTION_ROW}], got {dims:?}"
                )));
            }
        }
        ModelKind::YoloV3(_) => {
            if dims.len() != 4 || dims[2] != dims[3] {
                return Err(Error::Config(format!(
                    "region output \"{name}\" must be square, got {dims:?}"
                )));
            }
            if !matches!(dims[2], 13 | 26 | 52) {
                return Err(Error::Config(format!(
                    "region output \"{name}\" has unsupported side {}",
                    dims[2]
                )));
            }
        }
    }
    Ok(())
}

impl InferenceEngine for OpenVinoEngine {
    fn run_detection(&mut self, data: &[u8]) -> Result<Prediction> {
        let decode_start = Instant::now();
        let img = decode_image(data)?;
        let (orig_w, orig_h) = (img.width(), img.height());
        tracing::debug!(
            elapsed_ms = decode_start.elapsed().as_millis() as u64,
            width = orig_w,
            height = orig_h,
            "decoded input image"
        );

        let infer_start = Instant::now();
        let tensor = self.image_tensor(&img)?;
        let mut request = match self.request.take() {
            Some(request) => request,
            None => self
                .compiled
                .create_infer_request()
                .map_err(|e| infer_err("cannot create inference request", e))?,
        };

        request
            .set_tensor(&self.input_name, &tensor)
            .map_err(|e| infer_err("cannot bind input tensor", e))?;
        if let Some(info_name) = &self.info_input_name {
            let shape =
                Shape::new(&[1, 2]).map_err(|e| infer_err("cannot build image-info shape", e))?;
            let mut info = Tensor::new(ElementType::F32, &shape)
                .map_err(|e| infer_err("cannot allocate image-info tensor", e))?;
            let values = info
                .get_data_mut::<f32>()
                .map_err(|e| infer_err("cannot access image-info tensor", e))?;
            values[0] = self.input_width as f32;
            values[1] = self.input_height as f32;
            request
                .set_tensor(info_name, &info)
                .map_err(|e| infer_err("cannot bind image-info tensor", e))?;
        }

        request
            .infer()
            .map_err(|e| infer_err("inference request failed", e))?;
        tracing::debug!(
            elapsed_ms = infer_start.elapsed().as_millis() as u64,
            "inference request completed"
        );

        let prediction = match &self.kind {
            ModelKind::Ssd(params) | ModelKind::FasterRcnn(params) => {
                let output = request
                    .get_tensor(&self.output_names[0])
                    .map_err(|e| infer_err("cannot read detection output", e))?;
                let rows = output
                    .get_data::<f32>()
                    .map_err(|e| infer_err("cannot access detection output", e))?;
                parser::parse_plain_output(rows, orig_w, orig_h, params.score_threshold, &self.labels)
            }
            ModelKind::YoloV3(params) => {
                let mut candidates = Vec::new();
                for name in &self.output_names {
                    let output = request
                        .get_tensor(name)
                        .map_err(|e| infer_err("cannot read region output", e))?;
                    let dims = output
                        .get_shape()
                        .map_err(|e| infer_err("cannot read region output shape", e))?
                        .get_dimensions()
                        .to_vec();
                    let side = dims[2] as usize;
                    let blob = output
                        .get_data::<f32>()
                        .map_err(|e| infer_err("cannot access region output", e))?;
                    parser::parse_region_output(
                        blob,
                        side,
                        params,
                        (self.input_width as u32, self.input_height as u32),
                        (orig_w, orig_h),
                        &mut candidates,
                    )?;
                }
                parser::finalize_yolo(candidates, params, &self.labels)
            }
        };

        if self.single_request {
            self.request = Some(request);
        }
        Ok(prediction)
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_live_next_to_the_graph() {
        assert_eq!(weights_path("models/ssd.xml"), "models/ssd.bin");
        assert_eq!(weights_path("frozen"), "frozen.bin");
    }

    #[test]
    fn ssd_outputs_must_be_seven_wide() {
        let kind = ModelKind::from_model_name("ssd").unwrap();
        assert!(sanity_check_output(&kind, "out", &[1, 1, 100, 7]).is_ok());
        assert!(sanity_check_output(&kind, "out", &[1, 1, 100, 5]).is_err());
        assert!(sanity_check_output(&kind, "out", &[100, 7]).is_err());
    }

    #[test]
    fn yolo_outputs_must_be_square_canonical_scales() {
        let kind = ModelKind::from_model_name("yolov3").unwrap();
        assert!(sanity_check_output(&kind, "out", &[1, 255, 13, 13]).is_ok());
        assert!(sanity_check_output(&kind, "out", &[1, 255, 26, 26]).is_ok());
        assert!(sanity_check_output(&kind, "out", &[1, 255, 26, 13]).is_err());
        assert!(sanity_check_output(&kind, "out", &[1, 255, 19, 19]).is_err());
    }
}
