//! GPU runtime back end.
//!
//! Unlike the SDK back end, every device transfer here is explicit: the
//! decoded image is laid out in a host buffer, copied into a device storage
//! buffer, the detection graph is dispatched with device bindings, and the
//! output is copied back into a mappable buffer the parser reads. All
//! allocations are scoped to one `run_detection` call and released on every
//! exit path; the device, queue and compiled pipeline live for the engine's
//! lifetime.
//!
//! The model graph is consumed opaquely as a WGSL compute module with a
//! `main` entry point and the following group-0 bindings:
//!
//! - binding 0 — input image, packed NCHW u8 (`array<u32>` storage, read)
//! - two-stage models only: binding 1 — `vec2<f32>` image-info uniform
//! - remaining bindings — one `array<f32>` storage output per detection
//!   output (single-shot and two-stage graphs have one; grid-based graphs
//!   have one per scale, ordered 13, 26, 52)

use std::fmt;
use std::path::Path;
use std::time::Instant;

use image::imageops::FilterType;

use crate::bbox::Prediction;
use crate::config::EngineSpec;
use crate::error::{Error, Result};
use crate::labels;

use super::parser::{self, DETECTION_ROW};
use super::{decode_image, fill_nchw, InferenceEngine, ModelKind};

/// Detection rows reserved in the output buffer of plain-output graphs.
const MAX_PROPOSALS: usize = 200;
/// Grid sides of the region outputs, in binding order.
const REGION_SIDES: [usize; 3] = [13, 26, 52];
const WORKGROUP_SIZE: u32 = 64;

#[derive(Debug)]
pub struct GpuEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    kind: ModelKind,
    labels: Vec<String>,
    input_width: u32,
    input_height: u32,
}

fn infer_err(context: &str, err: impl fmt::Display) -> Error {
    Error::Inference(format!("{context}: {err}"))
}

/// Output buffer sizes in floats, one entry per detection output.
fn output_lengths(kind: &ModelKind) -> Vec<usize> {
    match kind {
        ModelKind::Ssd(_) | ModelKind::FasterRcnn(_) => vec![MAX_PROPOSALS * DETECTION_ROW],
        ModelKind::YoloV3(params) => REGION_SIDES
            .iter()
            .map(|side| params.num * side * side * (params.coords + params.classes + 1))
            .collect(),
    }
}

/// Group-0 bindings the family's graph must expose: the input image, the
/// image-info uniform for two-stage models, and one buffer per output.
fn expected_bindings(kind: &ModelKind) -> usize {
    1 + usize::from(kind.wants_image_info()) + output_lengths(kind).len()
}

/// Network input size in padded bytes (storage buffers are u32-granular).
fn input_byte_len(width: u32, height: u32) -> u64 {
    ((3 * width * height) as u64).div_ceil(4) * 4
}

fn create_buffer(
    device: &wgpu::Device,
    label: &str,
    size: u64,
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage,
        mapped_at_creation: false,
    })
}

/// The binding set shared by the construction-time probe and the run path.
fn bind_entries<'a>(
    input: &'a wgpu::Buffer,
    info: Option<&'a wgpu::Buffer>,
    outputs: &'a [wgpu::Buffer],
) -> Vec<wgpu::BindGroupEntry<'a>> {
    let mut entries = vec![wgpu::BindGroupEntry {
        binding: 0,
        resource: input.as_entire_binding(),
    }];
    if let Some(info) = info {
        entries.push(wgpu::BindGroupEntry {
            binding: 1,
            resource: info.as_entire_binding(),
        });
    }
    let first_output = entries.len() as u32;
    for (i, output) in outputs.iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: first_output + i as u32,
            resource: output.as_entire_binding(),
        });
    }
    entries
}

impl GpuEngine {
    pub fn new(spec: &EngineSpec, kind: ModelKind) -> Result<Self> {
        let labels = labels::load(Path::new(&spec.model.label))?;
        let source = std::fs::read_to_string(&spec.model.graph).map_err(|e| {
            Error::Config(format!("cannot read model graph {}: {e}", spec.model.graph))
        })?;

        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            ..Default::default()
        }))
        .ok_or_else(|| Error::Config("no compatible GPU adapter available".into()))?;
        let (device, queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None))
                .map_err(|e| Error::Config(format!("cannot acquire GPU device: {e}")))?;

        // Graph sanity check, stage one: module parsing and pipeline
        // creation must both validate.
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("detection-graph"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("detection-graph"),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(Error::Config(format!(
                "model graph failed device validation: {err}"
            )));
        }

        let (input_width, input_height) = match &kind {
            ModelKind::YoloV3(_) => (416, 416),
            _ => (300, 300),
        };

        // Stage two: probe a bind group with the family's binding set. A
        // well-formed shader can still disagree with the family layout (a
        // grid-based graph exposing one output instead of three, a
        // two-stage graph without the image-info binding); binding dummy
        // buffers surfaces that mismatch now instead of on the first
        // request.
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let probe_input = create_buffer(
            &device,
            "probe-input",
            input_byte_len(input_width, input_height),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let probe_info = kind.wants_image_info().then(|| {
            create_buffer(
                &device,
                "probe-image-info",
                8,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            )
        });
        let probe_outputs: Vec<wgpu::Buffer> = output_lengths(&kind)
            .iter()
            .map(|len| {
                create_buffer(
                    &device,
                    "probe-output",
                    (len * 4) as u64,
                    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                )
            })
            .collect();
        let probe_layout = pipeline.get_bind_group_layout(0);
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("probe-bindings"),
            layout: &probe_layout,
            entries: &bind_entries(&probe_input, probe_info.as_ref(), &probe_outputs),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(Error::Config(format!(
                "model graph bindings do not match the family's {}-binding layout: {err}",
                expected_bindings(&kind)
            )));
        }

        Ok(Self {
            device,
            queue,
            pipeline,
            kind,
            labels,
            input_width,
            input_height,
        })
    }

    /// Copy a device output into host memory via a mapped readback buffer.
    fn read_back(&self, buffer: &wgpu::Buffer) -> Result<Vec<f32>> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::Inference("device readback channel closed".into()))?
            .map_err(|e| infer_err("cannot map readback buffer", e))?;
        let mapped = slice.get_mapped_range();
        let floats = bytemuck::cast_slice::<u8, f32>(&mapped).to_vec();
        drop(mapped);
        buffer.unmap();
        Ok(floats)
    }
}

impl InferenceEngine for GpuEngine {
    fn run_detection(&mut self, data: &[u8]) -> Result<Prediction> {
        let started = Instant::now();
        let img = decode_image(data)?;
        let (orig_w, orig_h) = (img.width(), img.height());

        // Host staging: NCHW u8, padded to the 4-byte granularity of
        // storage buffers.
        let resized = img
            .resize_exact(self.input_width, self.input_height, FilterType::Triangle)
            .to_rgb8();
        let mut host = vec![0u8; (3 * self.input_width * self.input_height) as usize];
        fill_nchw(&resized, &mut host);
        host.resize(input_byte_len(self.input_width, self.input_height) as usize, 0);

        // Host-to-device copy.
        let input = create_buffer(
            &self.device,
            "graph-input",
            host.len() as u64,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        self.queue.write_buffer(&input, 0, &host);

        let info = if self.kind.wants_image_info() {
            let buffer = create_buffer(
                &self.device,
                "image-info",
                8,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            );
            let values = [self.input_width as f32, self.input_height as f32];
            self.queue.write_buffer(&buffer, 0, bytemuck::cast_slice(&values));
            Some(buffer)
        } else {
            None
        };

        let lengths = output_lengths(&self.kind);
        let outputs: Vec<wgpu::Buffer> = lengths
            .iter()
            .map(|len| {
                create_buffer(
                    &self.device,
                    "graph-output",
                    (len * 4) as u64,
                    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                )
            })
            .collect();
        let readbacks: Vec<wgpu::Buffer> = lengths
            .iter()
            .map(|len| {
                create_buffer(
                    &self.device,
                    "graph-readback",
                    (len * 4) as u64,
                    wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                )
            })
            .collect();

        // Execution with device bindings. wgpu reports binding and dispatch
        // mismatches through the device error sink, not as return values;
        // the scope turns them into an inference failure the worker can
        // degrade to an empty prediction.
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("detection-bindings"),
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &bind_entries(&input, info.as_ref(), &outputs),
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("detection"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("detection"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let cells = lengths.iter().copied().max().unwrap_or(0) as u32;
            pass.dispatch_workgroups(cells.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        // Device-to-host copies.
        for (output, readback) in outputs.iter().zip(&readbacks) {
            encoder.copy_buffer_to_buffer(output, 0, readback, 0, output.size());
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(infer_err("device execution failed validation", err));
        }

        let prediction = match &self.kind {
            ModelKind::Ssd(params) | ModelKind::FasterRcnn(params) => {
                let rows = self.read_back(&readbacks[0])?;
                parser::parse_plain_output(
                    &rows,
                    orig_w,
                    orig_h,
                    params.score_threshold,
                    &self.labels,
                )
            }
            ModelKind::YoloV3(params) => {
                let mut candidates = Vec::new();
                for (side, readback) in REGION_SIDES.iter().zip(&readbacks) {
                    let blob = self.read_back(readback)?;
                    parser::parse_region_output(
                        &blob,
                        *side,
                        params,
                        (self.input_width, self.input_height),
                        (orig_w, orig_h),
                        &mut candidates,
                    )?;
                }
                parser::finalize_yolo(candidates, params, &self.labels)
            }
        };
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            detections = prediction.len(),
            "device round trip completed"
        );
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
    fn binding_layout_matches_the_model_family() {
        let ssd = ModelKind::from_model_name("ssd").unwrap();
        assert_eq!(output_lengths(&ssd), vec![MAX_PROPOSALS * DETECTION_ROW]);
        assert_eq!(expected_bindings(&ssd), 2);

        let rcnn = ModelKind::from_model_name("rcnn").unwrap();
        assert_eq!(output_lengths(&rcnn), vec![MAX_PROPOSALS * DETECTION_ROW]);
        assert_eq!(expected_bindings(&rcnn), 3);

        let yolo = ModelKind::from_model_name("yolov3").unwrap();
        let lengths = output_lengths(&yolo);
        // One region output per scale, 3 anchors × 85 planes × side².
        assert_eq!(lengths, vec![3 * 85 * 13 * 13, 3 * 85 * 26 * 26, 3 * 85 * 52 * 52]);
        assert_eq!(expected_bindings(&yolo), 4);
    }

    #[test]
    fn input_staging_is_word_aligned() {
        assert_eq!(input_byte_len(300, 300), 270_000);
        // 3 × 13 × 13 = 507 bytes rounds up to the next word.
        assert_eq!(input_byte_len(13, 13), 508);
    }
}
