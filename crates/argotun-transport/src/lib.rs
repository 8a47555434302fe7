//! Transport abstraction for tunnel connections.
//!
//! A [`Transport`] is a reliable connection providing ordered,
//! bidirectional, numbered byte streams: in production a QUIC connection,
//! in tests the in-memory [`mock::MockTransport`]. The multiplexer consumes
//! the raw event feed and owns all per-stream buffering; the transport only
//! moves bytes and reports what happened.

pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Stream identifier within a connection (QUIC wire numbering).
pub type StreamId = u64;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("setup error: {0}")]
    Setup(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Raw per-connection events surfaced by a transport, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The handshake completed.
    Connected,

    /// The connection ended: peer close, application close, stateless
    /// reset or local close.
    Disconnected,

    /// Bytes arrived on a stream (incremental).
    StreamData { stream_id: StreamId, data: Bytes },

    /// The peer finished its side of a stream.
    StreamFin { stream_id: StreamId },

    /// The peer abruptly reset a stream; no further data will arrive.
    StreamReset { stream_id: StreamId },

    /// The peer asked us to stop sending on a stream.
    StopSending { stream_id: StreamId },

    /// The stream can accept more outbound bytes.
    SendReady { stream_id: StreamId },
}

/// A reliable multiplexing transport.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next connection event. After `Disconnected` has been
    /// delivered the transport only returns `ConnectionClosed`.
    async fn next_event(&mut self) -> TransportResult<TransportEvent>;

    /// Open the next locally-initiated bidirectional stream.
    async fn open_stream(&mut self) -> TransportResult<StreamId>;

    /// Write up to `send_window` bytes on a stream; returns the number of
    /// bytes accepted. `fin` marks this write as the final one for the
    /// stream.
    async fn write(&mut self, stream_id: StreamId, data: &[u8], fin: bool)
        -> TransportResult<usize>;

    /// How many bytes a single `write` on this stream may currently accept.
    fn send_window(&self, stream_id: StreamId) -> usize;

    /// Abruptly terminate a stream with an application error code.
    async fn reset_stream(&mut self, stream_id: StreamId, code: u64) -> TransportResult<()>;

    /// Initiate a graceful connection close with an application error code.
    async fn close(&mut self, code: u64);
}
