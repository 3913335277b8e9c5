//! # Route Invocation
//!
//! The argument-supplier machinery from a reflective "inspect the method
//! signature and supply matching arguments" world has no 1:1 analogue at
//! compile time, so this module takes the axum-style extractor pattern
//! instead: a [`FromContext`] impl per argument type, and a blanket
//! [`Handler`] impl over tuples of them, so a route can be written as a
//! plain async function rather than by hand-implementing [`Controller`].
//!
//! The transaction-scoped "diagnostic context" the spec calls for is a
//! [`RequestContext`] bound with `tokio::task_local!` for the lifetime of
//! one invocation — it clears itself on scope exit, including on panic,
//! which is exactly the "must clear even on failure" invariant.

use crate::error::{RpcError, RpcResult};
use crate::message::{head_keys, Message, Section};
use crate::router::RouteRegistry;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{error, info_span, warn, Instrument};

/// Per-invocation context, available to any handler argument that asks for
/// it via [`Ctx`]. Bound for the duration of one `invoke` call and cleared
/// automatically when that call's task-local scope exits.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ext_trx_id: String,
    pub source: String,
    pub target: String,
    pub started_at: Instant,
}

tokio::task_local! {
    static CURRENT_CONTEXT: RequestContext;
}

impl RequestContext {
    /// The context bound for the invocation currently executing on this
    /// task, if any.
    pub fn current() -> Option<RequestContext> {
        CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }
}

/// An argument that can be pulled out of an incoming message and the
/// current invocation context.
pub trait FromContext: Sized + Send {
    fn from_context(message: &Message, ctx: &RequestContext) -> RpcResult<Self>;
}

/// Extracts the bound [`RequestContext`].
pub struct Ctx(pub RequestContext);

impl FromContext for Ctx {
    fn from_context(_message: &Message, ctx: &RequestContext) -> RpcResult<Self> {
        Ok(Ctx(ctx.clone()))
    }
}

/// Extracts a clone of the message's `data` section.
pub struct Data(pub Section);

impl FromContext for Data {
    fn from_context(message: &Message, _ctx: &RequestContext) -> RpcResult<Self> {
        Ok(Data(message.data.clone()))
    }
}

/// Extracts a clone of the message's `head` section.
pub struct Head(pub Section);

impl FromContext for Head {
    fn from_context(message: &Message, _ctx: &RequestContext) -> RpcResult<Self> {
        Ok(Head(message.head.clone()))
    }
}

impl FromContext for Message {
    fn from_context(message: &Message, _ctx: &RequestContext) -> RpcResult<Self> {
        Ok(message.clone())
    }
}

/// What a handler produced, before the standard envelope fields are
/// stamped on by the connection handler. Mirrors the spec's return-value
/// shaping: a full `Message` is used as-is, a bare unit return means the
/// handler already sent its own response and the caller must not
/// auto-send one.
pub enum HandlerOutcome {
    Response(Message),
    NoResponse,
}

/// Converts a handler's plain Rust return type into the shape the
/// connection handler will fold into a response envelope. A `Message` is
/// merged as-is, a `String` becomes `data["response"]`, a [`Section`]
/// merges into `data`, `()` signals the handler already sent its own
/// response via some other channel, and [`Json`] JSON-encodes an arbitrary
/// serializable value into `data["response"]`.
pub trait IntoResponse {
    fn into_response(self) -> HandlerOutcome;
}

impl IntoResponse for Message {
    fn into_response(self) -> HandlerOutcome {
        HandlerOutcome::Response(self)
    }
}

impl IntoResponse for () {
    fn into_response(self) -> HandlerOutcome {
        HandlerOutcome::NoResponse
    }
}

impl IntoResponse for String {
    fn into_response(self) -> HandlerOutcome {
        let mut message = Message::new();
        message.data.insert("response", self);
        HandlerOutcome::Response(message)
    }
}

impl IntoResponse for Section {
    fn into_response(self) -> HandlerOutcome {
        let mut message = Message::new();
        message.data.merge(self);
        HandlerOutcome::Response(message)
    }
}

/// Wraps an arbitrary serializable value so it is JSON-encoded into
/// `data["response"]`, matching the spec's "any other value" clause.
pub struct Json<T>(pub T);

impl<T: serde::Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> HandlerOutcome {
        let mut message = Message::new();
        match serde_json::to_string(&self.0) {
            Ok(encoded) => {
                message.data.insert("response", encoded);
            }
            Err(err) => {
                warn!(error = %err, "Json response failed to encode, sending empty response");
            }
        }
        HandlerOutcome::Response(message)
    }
}

/// An invocable route target. Object-safe so the registry can store a
/// homogeneous `Box<dyn Controller>` regardless of how many extractor
/// arguments the underlying handler takes.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn invoke(&self, message: Message, ctx: RequestContext) -> RpcResult<HandlerOutcome>;
}

/// A handler expressed as a plain async function over some tuple of
/// [`FromContext`] extractors.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, message: Message, ctx: RequestContext) -> RpcResult<HandlerOutcome>;
}

#[async_trait]
impl<H: Handler> Controller for H {
    async fn invoke(&self, message: Message, ctx: RequestContext) -> RpcResult<HandlerOutcome> {
        self.call(message, ctx).await
    }
}

/// Adapts a plain async function into a [`Handler`] by extracting its
/// arguments from the incoming message via [`FromContext`].
pub struct FnHandler<F, Args> {
    f: F,
    _marker: PhantomData<fn(Args)>,
}

impl<F, Args> FnHandler<F, Args> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        #[async_trait]
        impl<F, Fut, R, $($arg,)*> Handler for FnHandler<F, ($($arg,)*)>
        where
            F: Fn($($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = RpcResult<R>> + Send + 'static,
            R: IntoResponse,
            $($arg: FromContext + Send + 'static,)*
        {
            async fn call(&self, message: Message, ctx: RequestContext) -> RpcResult<HandlerOutcome> {
                $(
                    #[allow(non_snake_case)]
                    let $arg = $arg::from_context(&message, &ctx)?;
                )*
                let value = (self.f)($($arg),*).await?;
                Ok(value.into_response())
            }
        }
    };
}

impl_handler!();
impl_handler!(A1);
impl_handler!(A1, A2);
impl_handler!(A1, A2, A3);

/// The default success message, per the spec's response-envelope defaults.
pub const DEFAULT_SUCCESS_MESSAGE: &str = "successful";

/// Stamp the standard envelope defaults onto a successful response:
/// `result=true`, `message="successful"`, `extTrxId` round-tripped — but
/// only for fields the handler didn't already set itself.
pub fn apply_success_defaults(mut response: Message, ctx: &RequestContext) -> Message {
    if !response.head.contains_key(head_keys::EXT_TRX_ID) {
        response.head.insert(head_keys::EXT_TRX_ID, ctx.ext_trx_id.clone());
    }
    if !response.head.contains_key(head_keys::RESULT) {
        response.head.insert(head_keys::RESULT, true);
    }
    if !response.head.contains_key(head_keys::MESSAGE) {
        response.head.insert(head_keys::MESSAGE, DEFAULT_SUCCESS_MESSAGE);
    }
    response
}

/// Build an error envelope: `result=false`, `message` carries the detail,
/// `data.errorType` carries the error's short kind name.
pub fn build_error_envelope(ctx: &RequestContext, error_type: &str, detail: &str) -> Message {
    let mut response = Message::new();
    response.head.insert(head_keys::EXT_TRX_ID, ctx.ext_trx_id.clone());
    response.head.insert(head_keys::RESULT, false);
    response.head.insert(head_keys::MESSAGE, detail.to_string());
    response.data.insert("errorType", error_type.to_string());
    response.data.insert("response", detail.to_string());
    response
}

/// What the invocation produced, paired with the context it ran under so
/// the caller (the connection handler) can stamp channel/envelope fields
/// that the invoker itself has no visibility into.
pub struct Invocation {
    pub ctx: RequestContext,
    pub outcome: RpcResult<HandlerOutcome>,
}

/// Resolve `message`'s target in `registry` and invoke it.
///
/// A handler panic is caught at this boundary and translated into a
/// `HandlerPanic` error rather than propagating across the connection
/// task — a route author's bug must never take down the connection it
/// arrived on, let alone the process. Route-not-found is surfaced as an
/// `Err` too; shaping both into response envelopes is the connection
/// handler's job (spec §4.4), since only it knows the channel id.
pub async fn invoke(registry: &RouteRegistry, message: Message) -> Invocation {
    let target = message.head.get_string(head_keys::TARGET);
    let ext_trx_id = message.head.get_string(head_keys::EXT_TRX_ID);
    let source = message.head.get_string(head_keys::SOURCE);

    let ctx = RequestContext {
        ext_trx_id: ext_trx_id.clone(),
        source,
        target: target.clone(),
        started_at: Instant::now(),
    };

    let route = match registry.lookup(&target) {
        Some(route) => route,
        None => {
            return Invocation {
                ctx,
                outcome: Err(RpcError::RouteNotFound(target)),
            };
        }
    };

    let span = info_span!("invoke", target = %route.target, ext_trx_id = %ext_trx_id);
    let ctx_for_scope = ctx.clone();

    let result: Result<RpcResult<HandlerOutcome>, _> = AssertUnwindSafe(
        CURRENT_CONTEXT.scope(ctx_for_scope, async {
            route.controller().invoke(message, ctx.clone()).instrument(span.clone()).await
        }),
    )
    .catch_unwind()
    .instrument(span)
    .await;

    let outcome = match result {
        Ok(outcome) => {
            if let Err(err) = &outcome {
                warn!(error = %err, target = %target, "handler returned an error");
            }
            outcome
        }
        Err(panic) => {
            let panic_msg = panic_message(&panic);
            error!(target = %target, panic = %panic_msg, "handler panicked");
            Err(RpcError::HandlerPanic(panic_msg))
        }
    };

    Invocation { ctx, outcome }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Small `catch_unwind`-over-a-future adapter, since `std::panic::catch_unwind`
/// itself only wraps synchronous closures.
trait CatchUnwindFuture: Future + Sized {
    fn catch_unwind(self) -> futures_catch_unwind::CatchUnwind<Self>;
}

mod futures_catch_unwind {
    use std::future::Future;
    use std::panic::{self, AssertUnwindSafe};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Boxes the inner future so `CatchUnwind<F>` is `Unpin` regardless of
    /// whether `F` is, since the task-local scope future it wraps (an
    /// `async` block capturing a non-`Unpin` future) generally isn't.
    pub struct CatchUnwind<F> {
        inner: Pin<Box<F>>,
    }

    impl<F: Future> Future for CatchUnwind<F> {
        type Output = std::thread::Result<F::Output>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let inner = &mut self.get_mut().inner;
            match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
                Ok(Poll::Ready(v)) => Poll::Ready(Ok(v)),
                Ok(Poll::Pending) => Poll::Pending,
                Err(payload) => Poll::Ready(Err(payload)),
            }
        }
    }

    pub fn catch_unwind<F: Future>(f: F) -> CatchUnwind<F> {
        CatchUnwind { inner: Box::pin(f) }
    }
}

/// Relies on `std::panic::AssertUnwindSafe<F>`'s own `Future` impl
/// (stable since 1.53) to poll the wrapped future through; this module
/// only adds the `catch_unwind` adapter on top of it.
impl<T: Future> CatchUnwindFuture for AssertUnwindSafe<T> {
    fn catch_unwind(self) -> futures_catch_unwind::CatchUnwind<Self> {
        futures_catch_unwind::catch_unwind(self)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub struct EchoController;

    #[async_trait]
    impl Controller for EchoController {
        async fn invoke(&self, message: Message, _ctx: RequestContext) -> RpcResult<HandlerOutcome> {
            Ok(HandlerOutcome::Response(message))
        }
    }
}
