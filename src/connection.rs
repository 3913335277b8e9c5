//! # Connection Handler (per-request state machine)
//!
//! Drives one accepted connection through Received → Routed → Invoked →
//! Responded → Closed (spec §4.4). The transaction id is stamped into
//! `head["extTrxId"]` before routing and is also the tracing span's id for
//! the duration of the invocation. Grounded on
//! `ipc/tcp_socket.rs::handle_connection`'s per-connection spawned-task
//! shape, generalized from a benchmark echo loop to the full routed
//! request/response cycle, with the response linger implemented as a
//! `tokio::time::sleep` on the connection's own task rather than a
//! blocking thread sleep.

use crate::codec::{Frame, FrameCodec};
use crate::error::RpcError;
use crate::invoke::{self, apply_success_defaults, build_error_envelope, HandlerOutcome};
use crate::message::head_keys;
use crate::router::RouteRegistry;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error, info_span, warn, Instrument};

/// Default post-response linger before the connection closes, per spec
/// §4.4.
pub const DEFAULT_LINGER: Duration = Duration::from_millis(100);

static CHANNEL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Short per-channel identifier stamped into `head["id"]` on responses and
/// folded into the transaction id, per spec §4.4.
fn next_channel_id() -> String {
    format!("ch-{:x}", CHANNEL_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Build the full transaction id: wall-clock milliseconds concatenated
/// with the short channel id, per spec §4.4.
fn transaction_id(channel_id: &str) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{millis}-{channel_id}")
}

/// Handle one accepted connection for its entire lifetime: wait for a
/// single routable frame, invoke the matching route, write the shaped
/// response, linger, then close. Frames shorter than the probe threshold
/// are silently skipped without ending the connection, so a client's bare
/// liveness probe never gets mistaken for the real request.
pub async fn handle_connection(stream: TcpStream, registry: Arc<RouteRegistry>, linger: Duration) {
    let channel_id = next_channel_id();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let message = loop {
        match framed.next().await {
            Some(Ok(Frame::Probe)) => {
                debug!(channel_id, "liveness probe received, waiting for a routable frame");
                continue;
            }
            Some(Ok(Frame::Message(message))) => break message,
            Some(Err(err)) => {
                // FrameTooLarge / DeserializeFailed / I/O: the channel is
                // forfeit, no response is attempted (spec §7).
                warn!(channel_id, error = %err, "closing connection after frame error");
                return;
            }
            None => {
                debug!(channel_id, "connection closed before a routable frame arrived");
                return;
            }
        }
    };

    let mut request_head_trx = message.head.get_string(head_keys::EXT_TRX_ID);
    if request_head_trx.is_empty() {
        request_head_trx = transaction_id(&channel_id);
    }

    let span = info_span!("connection", channel_id = %channel_id, trx_id = %request_head_trx);
    async {
        let invocation = invoke::invoke(&registry, message).await;

        let response = match invocation.outcome {
            Ok(HandlerOutcome::Response(response)) => {
                let mut response = apply_success_defaults(response, &invocation.ctx);
                response.head.insert(head_keys::ID, channel_id.clone());
                Some(response)
            }
            Ok(HandlerOutcome::NoResponse) => None,
            Err(RpcError::RouteNotFound(target)) => {
                let mut response = build_error_envelope(
                    &invocation.ctx,
                    "ROUTE_NOT_FOUND",
                    &format!("Target not found: {target}"),
                );
                response.head.insert(head_keys::ID, channel_id.clone());
                Some(response)
            }
            Err(err) => {
                let error_type = match &err {
                    RpcError::HandlerPanic(_) => "HandlerPanic",
                    RpcError::HandlerFailed(_) => "HandlerException",
                    _ => "InternalError",
                };
                let mut response =
                    build_error_envelope(&invocation.ctx, error_type, &err.to_string());
                response.head.insert(head_keys::ID, channel_id.clone());
                Some(response)
            }
        };

        if let Some(response) = response {
            if let Err(err) = framed.send(Frame::Message(response)).await {
                error!(channel_id, error = %err, "failed to write response, closing without linger");
                return;
            }
        }

        tokio::time::sleep(linger).await;
    }
    .instrument(span)
    .await;
}
