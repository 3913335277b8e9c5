//! # Frame Codec
//!
//! Length-prefixed framing over any `AsyncRead + AsyncWrite`, expressed as
//! a `tokio_util::codec::{Decoder, Encoder}` pair so a connection is driven
//! as a `Framed<TcpStream, FrameCodec>` stream/sink rather than a hand-rolled
//! read loop. `Decoder::decode` is called repeatedly as bytes accumulate in
//! the shared buffer, returning `Ok(None)` until a full frame is available —
//! this is what gives us "parse repeatedly as bytes arrive, including
//! byte-at-a-time delivery" for free.
//!
//! Wire shape: a 4-byte big-endian length prefix followed by that many
//! bytes of body. A body shorter than `MIN_VALID_PACKET` carries no decodable
//! `Message` and is treated as a liveness probe — callers see `Frame::Probe`
//! and should not attempt to route it.
//!
//! Payload bodies over `CHUNK_THRESHOLD` are copied into the output buffer in
//! fixed-size chunks rather than one `extend_from_slice`, and every encode
//! call consults a [`BackpressureGate`] over the buffer's currently unflushed
//! size before appending another frame, surfacing `RpcError::ChannelNotWritable`
//! once the high watermark is crossed.

use crate::error::RpcError;
use crate::message::Message;
use bytes::{Buf, BytesMut};
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::codec::{Decoder, Encoder};

/// Bodies shorter than this carry no `Message` and are treated as a
/// liveness probe rather than a routable frame.
pub const MIN_VALID_PACKET: u32 = 8;

/// Hard outer bound no frame may exceed, regardless of which decoder
/// default below is in effect.
pub const MAX_PACKET_SIZE: u32 = 100 * 1024 * 1024;

/// Server decoder default: the max frame size `FrameCodec::new()` uses.
pub const SERVER_MAX_FRAME_SIZE: u32 = 50 * 1024 * 1024;

/// Outbound client decoder default: the max frame size `FrameCodec::for_client()` uses.
pub const CLIENT_MAX_FRAME_SIZE: u32 = MAX_PACKET_SIZE;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Payloads at or under this size are written to the output buffer in one
/// `extend_from_slice`; larger payloads are streamed in fixed chunks.
const CHUNK_THRESHOLD: usize = 128 * 1024;
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// One decoded unit off the wire: either a routable message or a bare
/// liveness probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Probe,
    Message(Message),
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::Message(message)
    }
}

/// Write-buffer watermark gate over the encoder's currently unflushed
/// bytes. `Framed` accumulates encoded-but-not-yet-written bytes in the
/// same `BytesMut` passed to `Encoder::encode`, so that buffer's length is
/// already the live gauge of backlog — no separate counter to keep in
/// sync. Crossing the high watermark blocks; the gate only unblocks once
/// the backlog has drained back down to the low watermark, so a buffer
/// hovering near the boundary doesn't flap writable/not-writable every
/// other frame.
#[derive(Debug, Default)]
pub struct BackpressureGate {
    blocked: AtomicBool,
}

impl BackpressureGate {
    /// Below this, the gate reports writable again after being blocked.
    pub const LOW_WATERMARK: usize = 512 * 1024;
    /// At or above this, the gate reports not writable.
    pub const HIGH_WATERMARK: usize = 2 * 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current buffered size and report whether the channel is
    /// writable afterward.
    pub fn observe(&self, buffered: usize) -> bool {
        if buffered >= Self::HIGH_WATERMARK {
            self.blocked.store(true, Ordering::Relaxed);
        } else if buffered <= Self::LOW_WATERMARK {
            self.blocked.store(false, Ordering::Relaxed);
        }
        !self.blocked.load(Ordering::Relaxed)
    }

    pub fn is_writable(&self) -> bool {
        !self.blocked.load(Ordering::Relaxed)
    }
}

/// Tokio codec implementing the length-prefixed wire protocol. Not behind
/// an `Arc` — codec/connection state is per-connection, not shared.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: u32,
    backpressure: BackpressureGate,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Server decoder default (50 MiB), per §6.
    pub fn new() -> Self {
        Self::with_max_frame_size(SERVER_MAX_FRAME_SIZE)
    }

    /// Outbound client decoder default (100 MiB), per §6.
    pub fn for_client() -> Self {
        Self::with_max_frame_size(CLIENT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_PACKET_SIZE),
            backpressure: BackpressureGate::new(),
        }
    }

    /// Whether the write-buffer backlog is currently under the high
    /// watermark. Producers can check this via `framed.codec().is_writable()`
    /// before enqueueing more work.
    pub fn is_writable(&self) -> bool {
        self.backpressure.is_writable()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RpcError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..LENGTH_PREFIX_SIZE].try_into().unwrap());
        if len > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(len as usize);

        if len < MIN_VALID_PACKET {
            return Ok(Some(Frame::Probe));
        }

        let message = Message::from_bytes(&body)?;
        Ok(Some(Frame::Message(message)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), RpcError> {
        if !self.backpressure.observe(dst.len()) {
            return Err(RpcError::ChannelNotWritable);
        }

        match item {
            Frame::Probe => {
                dst.reserve(LENGTH_PREFIX_SIZE);
                dst.extend_from_slice(&0u32.to_be_bytes());
            }
            Frame::Message(message) => {
                let body = message.to_bytes()?;
                let len: u32 = body
                    .len()
                    .try_into()
                    .map_err(|_| RpcError::FrameTooLarge {
                        size: u32::MAX,
                        max: self.max_frame_size,
                    })?;
                if len > self.max_frame_size {
                    return Err(RpcError::FrameTooLarge {
                        size: len,
                        max: self.max_frame_size,
                    });
                }
                dst.reserve(LENGTH_PREFIX_SIZE + body.len());
                dst.extend_from_slice(&len.to_be_bytes());
                if body.len() > CHUNK_THRESHOLD {
                    for chunk in body.chunks(WRITE_CHUNK_SIZE) {
                        dst.extend_from_slice(chunk);
                    }
                } else {
                    dst.extend_from_slice(&body);
                }
            }
        }

        self.backpressure.observe(dst.len());
        Ok(())
    }
}

/// Per-connection counters, shared behind an `Arc` so the accept loop and
/// the connection's own task can both observe progress.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    frames_read: AtomicU64,
    frames_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    probes_received: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, frame: &Frame, bytes: u64) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        if matches!(frame, Frame::Probe) {
            self.probes_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_write(&self, bytes: u64) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn probes_received(&self) -> u64 {
        self.probes_received.load(Ordering::Relaxed)
    }
}
