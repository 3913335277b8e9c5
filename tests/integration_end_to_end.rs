//! End-to-end exercise of the full receive → decode → route → invoke →
//! encode → close cycle (spec §8 scenarios 1 and 2), driven entirely
//! through the crate's public API rather than its `#[cfg(test)]` test
//! helpers: a real route is registered via `inventory::submit!` and
//! dispatched over an actual accepted TCP connection.

use futures::{SinkExt, StreamExt};
use meshrpc::codec::{Frame, FrameCodec};
use meshrpc::invoke::{FnHandler, Head};
use meshrpc::message::{head_keys, Message};
use meshrpc::router::{DuplicateRoutePolicy, RouteDescriptor, RouteRegistry};
use meshrpc::shutdown::ShutdownController;
use meshrpc::{server, RpcResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

async fn head_echo(Head(head): Head) -> RpcResult<Message> {
    let mut response = Message::new();
    response.head.merge(head);
    Ok(response)
}

fn head_echo_controller() -> Box<dyn meshrpc::invoke::Controller> {
    Box::new(FnHandler::new(head_echo))
}

inventory::submit! {
    RouteDescriptor {
        controller_prefix: "",
        target_suffix: "/inet/head",
        loggable: true,
        auth_required: false,
        module_path: module_path!(),
        factory: head_echo_controller,
    }
}

async fn spawn_server() -> (std::net::SocketAddr, ShutdownController) {
    let registry = Arc::new(
        RouteRegistry::build(&[], DuplicateRoutePolicy::WarnAndOverwrite).expect("registry builds"),
    );
    let shutdown = ShutdownController::new();
    let options = server::ServerOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
        linger: Duration::from_millis(10),
        backlog: 128,
    };
    let addr = server::run(options, registry, shutdown.handle())
        .await
        .expect("server binds");
    (addr, shutdown)
}

#[tokio::test]
async fn known_target_round_trips_head_with_success_envelope() {
    let (addr, _shutdown) = spawn_server().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let mut request = Message::for_target("/inet/head");
    request.head.insert("extTrxId", "trx-123");
    request.data.insert("x", 1i64);
    framed.send(Frame::Message(request)).await.unwrap();

    let response = framed.next().await.unwrap().unwrap();
    let message = match response {
        Frame::Message(message) => message,
        Frame::Probe => panic!("expected a message frame"),
    };

    assert!(message.head.get_bool(head_keys::RESULT));
    assert_eq!(message.head.get_string(head_keys::MESSAGE), "successful");
    assert_eq!(message.head.get_string(head_keys::TARGET), "/inet/head");
    assert!(!message.head.get_string(head_keys::ID).is_empty());
}

#[tokio::test]
async fn unknown_target_yields_route_not_found_envelope() {
    let (addr, _shutdown) = spawn_server().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    framed
        .send(Frame::Message(Message::for_target("/nope")))
        .await
        .unwrap();

    let response = framed.next().await.unwrap().unwrap();
    let message = match response {
        Frame::Message(message) => message,
        Frame::Probe => panic!("expected a message frame"),
    };

    assert!(!message.head.get_bool(head_keys::RESULT));
    assert!(message.head.get_string(head_keys::MESSAGE).contains("Target not found"));
    assert_eq!(message.data.get_string("errorType"), "ROUTE_NOT_FOUND");
}
