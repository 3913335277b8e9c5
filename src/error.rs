//! Crate-wide error type.
//!
//! Library code returns `Result<T, RpcError>`; the binary entry point and
//! config/CLI glue use `anyhow::Result`, converting via `?` at the boundary
//! the way the teacher's `main.rs` already does for its own setup code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("frame exceeds maximum size: {size} > {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("connection closed before a full frame was read")]
    ConnectionClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("channel not writable")]
    ChannelNotWritable,

    #[error("no route registered for target {0:?}")]
    RouteNotFound(String),

    #[error("route registry is not yet initialized")]
    RegistryNotInitialized,

    #[error("route {0:?} is already registered")]
    DuplicateRoute(String),

    #[error("missing required extractor argument: {0}")]
    MissingArgument(&'static str),

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("handler returned an error: {0}")]
    HandlerFailed(String),

    #[error("no healthy endpoint available for service {0:?}")]
    NoHealthyEndpoint(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("read timed out after {0:?}")]
    ReadTimeout(std::time::Duration),

    #[error("invalid load balancer configuration: {0}")]
    InvalidConfig(String),

    #[error("worker pool queue is full")]
    WorkerPoolSaturated,
}

pub type RpcResult<T> = Result<T, RpcError>;
