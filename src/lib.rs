//! # meshrpc
//!
//! A dual-stack RPC framework: a length-prefixed binary transport carrying
//! a `head`/`data` structured message ([`message`], [`codec`]), an
//! annotation-style router/dispatcher that maps inbound targets onto
//! handler methods discovered at link time ([`router`], [`invoke`]), the
//! per-connection request state machine that glues the two together
//! ([`connection`], [`server`]), a client-side weighted round-robin load
//! balancer with broken-endpoint quarantine ([`balancer`]), and a matching
//! outbound RPC client ([`client`]).

pub mod balancer;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod invoke;
pub mod logging;
pub mod message;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod worker_pool;

pub use codec::{Frame, FrameCodec};
pub use error::{RpcError, RpcResult};
pub use invoke::{Controller, FromContext, Handler, HandlerOutcome, RequestContext};
pub use message::{Message, Section, Value};
pub use router::{DuplicateRoutePolicy, RouteDescriptor, RouteRegistry};

/// The current version of the crate, exposed for `proc`/`procId`-style
/// diagnostic reporting.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
