//! gRPC front end.
//!
//! One unary RPC with the same semantics as `POST /inference`: the handler
//! queues a message on the default device and waits on its bell. Engine
//! failures surface as an empty detection list with `OK`, matching the HTTP
//! behavior; only dispatch failures map to `INTERNAL`.

use std::sync::{Arc, PoisonError};

use bytes::Bytes;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use detect_core::sync::{Message, DONE};

use crate::dispatch::Dispatcher;

pub mod proto {
    tonic::include_proto!("detection.v1");

    /// Descriptor set for the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("detection_descriptor");
}

use proto::detection_server::{Detection, DetectionServer};
use proto::{Bbox, DetectionOutput, EncodedImage, Rectangle};

pub struct DetectionService {
    dispatcher: Arc<Dispatcher>,
}

impl DetectionService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[tonic::async_trait]
impl Detection for DetectionService {
    async fn run_detection(
        &self,
        request: Request<EncodedImage>,
    ) -> Result<Response<DetectionOutput>, Status> {
        let encoded = request.into_inner();
        let (message, result, bell) = Message::new(Bytes::from(encoded.data));

        self.dispatcher
            .dispatch(None, message)
            .map_err(|e| Status::internal(e.to_string()))?;

        tracing::debug!("waiting for the inference worker");
        let waiter = Arc::clone(&bell);
        tokio::task::spawn_blocking(move || waiter.wait(DONE))
            .await
            .map_err(|e| Status::internal(format!("inference wait failed: {e}")))?;
        tracing::debug!("inference result received");

        let prediction =
            std::mem::take(&mut *result.lock().unwrap_or_else(PoisonError::into_inner));
        let bboxes = prediction
            .iter()
            .map(|b| Bbox {
                label_id: b.label_id,
                label: b.label.clone(),
                prob: b.score,
                // The rectangle is omitted when every coordinate is zero.
                r#box: if b.xmin == 0 && b.ymin == 0 && b.xmax == 0 && b.ymax == 0 {
                    None
                } else {
                    Some(Rectangle {
                        xmin: b.xmin,
                        ymin: b.ymin,
                        xmax: b.xmax,
                        ymax: b.ymax,
                    })
                },
            })
            .collect();

        Ok(Response::new(DetectionOutput { bboxes }))
    }
}

/// Serve gRPC on an already-bound listener, with the health and reflection
/// services registered next to the detection service.
pub async fn serve(listener: std::net::TcpListener, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let incoming = TcpListenerStream::new(tokio::net::TcpListener::from_std(listener)?);

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<DetectionServer<DetectionService>>()
        .await;
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    tracing::info!(%addr, "grpc front end listening");
    Server::builder()
        .add_service(health_service)
        .add_service(reflection_service)
        .add_service(DetectionServer::new(DetectionService::new(dispatcher)))
        .serve_with_incoming(incoming)
        .await?;
    Ok(())
}
