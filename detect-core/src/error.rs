use thiserror::Error;

/// Error kinds of the serving stack.
///
/// Disposition is decided at the call site: `Config` and `NotImplemented`
/// are fatal during startup, `Decode`/`Inference` degrade to an empty
/// prediction inside the worker loop, `Protocol` maps to a 4xx response and
/// `NotImplemented` on a request path maps to 501/`INTERNAL`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("failed to decode input image: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
