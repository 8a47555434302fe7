//! Stream multiplexing and event dispatch for tunnel connections.
//!
//! The [`Multiplexer`] owns every per-stream buffer, normalizes raw
//! transport events into ordered [`TunnelEvent`]s, and pumps queued
//! outbound bytes into the transport bounded by its send window. All
//! application logic runs in an [`EventHandler`] invoked from the single
//! event loop; nothing here is shared across tasks.

pub mod multiplexer;

pub use multiplexer::{Multiplexer, StreamRecord};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use argotun_transport::{StreamId, Transport, TransportError};

/// Connection-level errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} already finished")]
    StreamFinished(StreamId),

    #[error("out of memory: stream {stream_id} buffer would exceed {limit} bytes")]
    OutOfMemory { stream_id: StreamId, limit: usize },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Events delivered to the application, normalized from the transport.
///
/// Per stream, delivery order is `StreamOpenedRemote` (for remote-initiated
/// streams) → zero or more `StreamData` → at most one `StreamFin`.
/// `Connected` precedes all stream events; `Disconnected` is final.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Connected,
    Disconnected,
    StreamOpenedRemote {
        stream_id: StreamId,
    },
    StreamData {
        stream_id: StreamId,
        data: Bytes,
    },
    /// End of stream; `data` is the full buffered receive slice.
    StreamFin {
        stream_id: StreamId,
        data: Bytes,
    },
}

/// Application logic driven by the multiplexer's event loop.
#[async_trait]
pub trait EventHandler<T: Transport>: Send {
    async fn on_event(
        &mut self,
        conn: &mut Multiplexer<T>,
        event: TunnelEvent,
    ) -> Result<(), ConnectionError>;
}
