//! The serving half of the detection gateway: request routing, the worker
//! loops that drive the inference engines, and the HTTP and gRPC front ends
//! that share them.

pub mod dispatch;
pub mod grpc;
pub mod http;
pub mod server;
pub mod worker;
