//! Core building blocks of the detection serving gateway: the data model,
//! the producer/consumer synchronization primitives, the configuration
//! schema, and the inference-engine abstraction with its hardware back ends.
//!
//! Everything here is protocol-agnostic. The HTTP and gRPC front ends, the
//! dispatcher, and the worker loops live in `detect-server` and consume this
//! crate through the [`engine::InferenceEngine`] trait and the [`sync`]
//! primitives.

pub mod bbox;
pub mod config;
pub mod engine;
pub mod error;
pub mod labels;
pub mod sync;

pub use bbox::{BoundingBox, Prediction};
pub use error::{Error, Result};
