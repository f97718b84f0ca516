//! Registry mapping device names to engine constructors.
//!
//! Registration happens once, while the server is composing itself; the
//! registry is never mutated while serving.

use std::collections::HashMap;

use crate::config::EngineSpec;
use crate::error::{Error, Result};

use super::gpu::GpuEngine;
use super::openvino::OpenVinoEngine;
use super::{DeviceKind, InferenceEngine, ModelKind};

/// Constructor for one device's engines.
pub type Creator = fn(&EngineSpec, ModelKind) -> Result<Box<dyn InferenceEngine>>;

pub struct EngineFactory {
    creators: HashMap<String, Creator>,
}

impl EngineFactory {
    pub fn new() -> Self {
        Self {
            creators: HashMap::new(),
        }
    }

    /// A factory with the built-in device set registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("intel cpu", |spec, kind| {
            OpenVinoEngine::new(spec, kind, DeviceKind::Cpu)
                .map(|e| Box::new(e) as Box<dyn InferenceEngine>)
        });
        factory.register("intel fpga", |spec, kind| {
            OpenVinoEngine::new(spec, kind, DeviceKind::Fpga)
                .map(|e| Box::new(e) as Box<dyn InferenceEngine>)
        });
        factory.register("nvidia gpu", |spec, kind| {
            GpuEngine::new(spec, kind).map(|e| Box::new(e) as Box<dyn InferenceEngine>)
        });
        factory
    }

    pub fn register(&mut self, device: &str, creator: Creator) {
        self.creators.insert(device.to_lowercase(), creator);
    }

    /// Build one engine instance for a configured spec. Device names are
    /// lowercased on lookup; unknown devices and model families are not
    /// implemented.
    pub fn create(&self, spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>> {
        let device = spec.device.to_lowercase();
        let creator = self
            .creators
            .get(device.trim())
            .ok_or_else(|| Error::NotImplemented(format!("unknown device \"{}\"", spec.device)))?;
        let kind = ModelKind::from_model_name(&spec.model.name)?;
        creator(spec, kind)
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}
