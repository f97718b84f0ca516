//! Inference workers: long-lived threads that each own one engine instance
//! and drain one device queue.

use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;

use detect_core::engine::InferenceEngine;
use detect_core::sync::{TaskQueue, DONE};
use detect_core::Prediction;

/// One worker: one engine, one queue.
pub struct Worker {
    engine: Box<dyn InferenceEngine>,
    queue: Arc<TaskQueue>,
}

impl Worker {
    pub fn new(engine: Box<dyn InferenceEngine>, queue: Arc<TaskQueue>) -> Self {
        Self { engine, queue }
    }

    /// Serve the queue until process exit.
    ///
    /// Engine failures never kill the worker: the error is logged, an empty
    /// prediction is written, and the bell is rung so the waiting handler is
    /// always released.
    pub fn run(mut self) -> ! {
        loop {
            let message = self.queue.pop();
            tracing::debug!(size = message.size, "picked up inference task");
            let prediction = match self.engine.run_detection(&message.data) {
                Ok(prediction) => prediction,
                Err(err) => {
                    tracing::warn!(%err, "inference failed, returning an empty prediction");
                    Prediction::new()
                }
            };
            tracing::debug!(detections = prediction.len(), "inference done");
            *message
                .result
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = prediction;
            message.bell.ring(DONE);
        }
    }
}

/// The set of worker threads spawned for one device class. Sized by the
/// device's replica count; built eagerly at startup and running until
/// process exit.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Spawn one worker on a named background thread.
    pub fn spawn(
        &mut self,
        name: String,
        engine: Box<dyn InferenceEngine>,
        queue: Arc<TaskQueue>,
    ) -> std::io::Result<()> {
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            Worker::new(engine, queue).run();
        })?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use detect_core::sync::Message;
    use detect_core::{BoundingBox, Error};

    #[derive(Debug)]
    struct ScriptedEngine {
        labels: Vec<String>,
        fail: bool,
    }

    impl InferenceEngine for ScriptedEngine {
        fn run_detection(&mut self, data: &[u8]) -> detect_core::Result<Prediction> {
            if self.fail {
                return Err(Error::Inference("scripted failure".into()));
            }
            Ok(vec![BoundingBox {
                label_id: 1,
                label: "person".into(),
                score: 0.9,
                xmin: 0,
                ymin: 0,
                xmax: data.len() as i32,
                ymax: data.len() as i32,
            }])
        }

        fn labels(&self) -> &[String] {
            &self.labels
        }
    }

    fn pool_with_engine(fail: bool) -> Arc<TaskQueue> {
        let queue = Arc::new(TaskQueue::new());
        let mut pool = WorkerPool::new();
        pool.spawn(
            "ie-worker-test".into(),
            Box::new(ScriptedEngine {
                labels: vec!["person".into()],
                fail,
            }),
            Arc::clone(&queue),
        )
        .unwrap();
        assert_eq!(pool.len(), 1);
        queue
    }

    #[test]
    fn worker_writes_result_before_ringing() {
        let queue = pool_with_engine(false);
        let (message, result, bell) = Message::new(Bytes::from_static(b"12345"));
        queue.push(message);
        bell.wait(DONE);
        let prediction = result.lock().unwrap();
        assert_eq!(prediction.len(), 1);
        assert_eq!(prediction[0].xmax, 5);
    }

    #[test]
    fn engine_failure_still_rings_with_an_empty_prediction() {
        let queue = pool_with_engine(true);
        let (message, result, bell) = Message::new(Bytes::from_static(b"12345"));
        queue.push(message);
        bell.wait(DONE);
        assert!(result.lock().unwrap().is_empty());

        // The worker survived the failure and serves the next message.
        let (message, result, bell) = Message::new(Bytes::from_static(b"6789"));
        queue.push(message);
        bell.wait(DONE);
        assert!(result.lock().unwrap().is_empty());
    }
}
