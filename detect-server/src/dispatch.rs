//! Request routing: one queue per configured device class.
//!
//! Both front ends resolve a request to a device class (from the target path
//! or the configured default) and hand the dispatcher a [`Message`]; workers
//! of that class contend on the queue. Messages on one queue are served in
//! FIFO order; no ordering is offered across queues.

use std::collections::HashMap;
use std::sync::Arc;

use detect_core::engine::DeviceKind;
use detect_core::sync::{Message, TaskQueue};
use detect_core::{Error, Result};

pub struct Dispatcher {
    queues: HashMap<DeviceKind, Arc<TaskQueue>>,
    default_device: DeviceKind,
}

impl Dispatcher {
    pub fn new(default_device: DeviceKind) -> Self {
        Self {
            queues: HashMap::new(),
            default_device,
        }
    }

    /// Queue for a device class, created on first use. Membership is fixed
    /// once the server finishes composing itself.
    pub fn ensure_queue(&mut self, device: DeviceKind) -> Arc<TaskQueue> {
        Arc::clone(
            self.queues
                .entry(device)
                .or_insert_with(|| Arc::new(TaskQueue::new())),
        )
    }

    pub fn queue(&self, device: DeviceKind) -> Option<Arc<TaskQueue>> {
        self.queues.get(&device).cloned()
    }

    pub fn default_device(&self) -> DeviceKind {
        self.default_device
    }

    /// Enqueue a message for `device` (or the default device when the
    /// request did not name one). Devices without a configured engine are
    /// not implemented.
    pub fn dispatch(&self, device: Option<DeviceKind>, message: Message) -> Result<()> {
        let device = device.unwrap_or(self.default_device);
        let queue = self.queues.get(&device).ok_or_else(|| {
            Error::NotImplemented(format!("no inference engine configured for device \"{device}\""))
        })?;
        tracing::debug!(%device, depth = queue.len(), "enqueueing inference task");
        queue.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn dispatch_to_a_missing_device_is_not_implemented() {
        let mut dispatcher = Dispatcher::new(DeviceKind::Cpu);
        dispatcher.ensure_queue(DeviceKind::Cpu);

        let (message, _, _) = Message::new(Bytes::from_static(b"img"));
        let err = dispatcher
            .dispatch(Some(DeviceKind::Gpu), message)
            .unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }

    #[test]
    fn dispatch_falls_back_to_the_default_device() {
        let mut dispatcher = Dispatcher::new(DeviceKind::Cpu);
        let queue = dispatcher.ensure_queue(DeviceKind::Cpu);

        let (message, _, _) = Message::new(Bytes::from_static(b"img"));
        dispatcher.dispatch(None, message).unwrap();
        assert_eq!(queue.len(), 1);
    }
}
