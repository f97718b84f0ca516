//! gRPC front-end integration tests.
//!
//! The service handler is exercised directly, the way a tonic transport
//! would call it, against a real dispatcher and stub-engine workers.

use std::sync::Arc;

use tonic::{Code, Request};

use detect_core::engine::{DeviceKind, InferenceEngine};
use detect_core::{BoundingBox, Error, Prediction};
use detect_server::dispatch::Dispatcher;
use detect_server::grpc::proto::detection_server::Detection;
use detect_server::grpc::proto::EncodedImage;
use detect_server::grpc::DetectionService;
use detect_server::worker::WorkerPool;

#[derive(Debug)]
struct FixedEngine {
    prediction: Prediction,
    labels: Vec<String>,
}

impl InferenceEngine for FixedEngine {
    fn run_detection(&mut self, _data: &[u8]) -> detect_core::Result<Prediction> {
        Ok(self.prediction.clone())
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }
}

#[derive(Debug)]
struct FailingEngine;

impl InferenceEngine for FailingEngine {
    fn run_detection(&mut self, _data: &[u8]) -> detect_core::Result<Prediction> {
        Err(Error::Decode("not an image".into()))
    }

    fn labels(&self) -> &[String] {
        &[]
    }
}

fn service_with(engine: Box<dyn InferenceEngine>) -> DetectionService {
    let mut dispatcher = Dispatcher::new(DeviceKind::Cpu);
    let queue = dispatcher.ensure_queue(DeviceKind::Cpu);
    let mut pool = WorkerPool::new();
    pool.spawn("test-worker".into(), engine, queue).unwrap();
    DetectionService::new(Arc::new(dispatcher))
}

fn encoded(data: &[u8]) -> EncodedImage {
    EncodedImage {
        data: data.to_vec(),
        size: data.len() as i32,
    }
}

#[tokio::test]
async fn detections_carry_boxes_unless_all_zero() {
    let service = service_with(Box::new(FixedEngine {
        prediction: vec![
            BoundingBox {
                label_id: 2,
                label: "bicycle".into(),
                score: 0.77,
                xmin: 5,
                ymin: 6,
                xmax: 50,
                ymax: 60,
            },
            BoundingBox {
                label_id: 1,
                label: "person".into(),
                score: 0.5,
                xmin: 0,
                ymin: 0,
                xmax: 0,
                ymax: 0,
            },
        ],
        labels: vec!["person".into(), "bicycle".into()],
    }));

    let output = service
        .run_detection(Request::new(encoded(b"fake-image")))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(output.bboxes.len(), 2);

    let with_box = &output.bboxes[0];
    assert_eq!(with_box.label_id, 2);
    assert_eq!(with_box.label, "bicycle");
    let rect = with_box.r#box.as_ref().unwrap();
    assert_eq!((rect.xmin, rect.ymin, rect.xmax, rect.ymax), (5, 6, 50, 60));

    // An all-zero rectangle is omitted from the wire form.
    assert!(output.bboxes[1].r#box.is_none());
}

#[tokio::test]
async fn engine_failures_surface_as_empty_ok() {
    let service = service_with(Box::new(FailingEngine));

    let output = service
        .run_detection(Request::new(encoded(b"junk")))
        .await
        .unwrap()
        .into_inner();
    assert!(output.bboxes.is_empty());
}

#[tokio::test]
async fn dispatch_failures_are_internal() {
    // A dispatcher with no queues: every dispatch fails.
    let service = DetectionService::new(Arc::new(Dispatcher::new(DeviceKind::Cpu)));

    let status = service
        .run_detection(Request::new(encoded(b"fake")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
}
