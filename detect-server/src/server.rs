//! Server composition: configuration → engines → queues → workers → front
//! end.
//!
//! The FPGA worker, when configured, must run on the process main thread;
//! its engine is therefore prepended to the engine list and the first
//! engine's worker loop is entered last, on the caller's thread. The front
//! end runs on a tokio runtime owned by a background thread.

use std::sync::Arc;

use anyhow::Context;

use detect_core::config::{Protocol, ServerConfig};
use detect_core::engine::factory::EngineFactory;
use detect_core::engine::{DeviceKind, InferenceEngine};

use crate::dispatch::Dispatcher;
use crate::worker::{Worker, WorkerPool};

/// Bitstream-selection variable read by the FPGA SDK. Written exactly once,
/// before any accelerator context exists.
const BITSTREAM_ENV: &str = "DLA_AOCX";

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bring the whole stack up. Never returns on success: the calling
    /// thread becomes an inference worker.
    pub fn run(self) -> anyhow::Result<()> {
        let config = self.config;
        config.validate()?;

        // Bitstream selection must precede engine construction.
        for spec in config.engines.iter().filter(|s| s.is_configured()) {
            if spec.is_fpga() {
                if let Some(bitstream) = &spec.bitstream {
                    std::env::set_var(BITSTREAM_ENV, bitstream);
                }
            }
        }

        tracing::info!("creating inference engines");
        let factory = EngineFactory::with_defaults();
        let mut engines: Vec<(DeviceKind, Box<dyn InferenceEngine>)> = Vec::new();
        let mut default_device = None;
        for spec in config.engines.iter().filter(|s| s.is_configured()) {
            let device = DeviceKind::from_device_name(&spec.device)?;
            if default_device.is_none() {
                default_device = Some(device);
            }
            for _ in 0..spec.replicas {
                let engine = factory.create(spec)?;
                // The FPGA engine goes first so its worker loop lands on the
                // main thread below.
                if device == DeviceKind::Fpga {
                    engines.insert(0, (device, engine));
                } else {
                    engines.push((device, engine));
                }
            }
        }
        let default_device =
            default_device.context("no inference engines configured")?;

        let mut dispatcher = Dispatcher::new(default_device);
        for (device, _) in &engines {
            dispatcher.ensure_queue(*device);
        }
        let dispatcher = Arc::new(dispatcher);

        // Bind synchronously so an unusable address fails startup.
        let addr = config.socket_addr()?;
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("cannot bind front end to {addr}"))?;

        tracing::info!(engines = engines.len(), "spawning inference workers");
        let mut engines = engines.into_iter();
        let (main_device, main_engine) = engines
            .next()
            .context("no inference engines configured")?;

        let mut pool = WorkerPool::new();
        for (i, (device, engine)) in engines.enumerate() {
            let queue = dispatcher
                .queue(device)
                .context("worker device has no queue")?;
            pool.spawn(format!("ie-worker-{}", i + 1), engine, queue)?;
        }

        tracing::info!("spawning the front end");
        let protocol = config.protocol;
        let frontend_dispatcher = Arc::clone(&dispatcher);
        std::thread::Builder::new()
            .name("frontend".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(%err, "cannot build the front-end runtime");
                        std::process::exit(1);
                    }
                };
                let served = runtime.block_on(async move {
                    match protocol {
                        Protocol::Http => crate::http::serve(listener, frontend_dispatcher).await,
                        Protocol::Grpc => crate::grpc::serve(listener, frontend_dispatcher).await,
                    }
                });
                if let Err(err) = served {
                    tracing::error!(%err, "front end terminated");
                    std::process::exit(1);
                }
            })
            .context("cannot spawn the front-end thread")?;

        let main_queue = dispatcher
            .queue(main_device)
            .context("worker device has no queue")?;
        tracing::info!(device = %main_device, "running an inference worker on the main thread");
        Worker::new(main_engine, main_queue).run()
    }
}
