//! In-memory transport for tests.
//!
//! The test half ([`MockHandle`]) scripts inbound events and inspects what
//! the client side wrote. Dropping the handle (or pushing
//! [`TransportEvent::Disconnected`]) ends the connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{StreamId, Transport, TransportError, TransportEvent, TransportResult};

/// An operation the client side performed against the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Open { stream_id: StreamId },
    Write { stream_id: StreamId, data: Vec<u8>, fin: bool },
    Reset { stream_id: StreamId, code: u64 },
    Close { code: u64 },
}

#[derive(Default)]
struct Shared {
    ops: VecDeque<MockOp>,
}

/// Test-side handle: feed events in, read operations out.
#[derive(Clone)]
pub struct MockHandle {
    events: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Mutex<Shared>>,
}

impl MockHandle {
    /// Queue an inbound event for the client to observe.
    pub fn push_event(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Drain every recorded operation.
    pub fn take_ops(&self) -> Vec<MockOp> {
        self.shared.lock().unwrap().ops.drain(..).collect()
    }

    /// Snapshot of recorded operations without draining.
    pub fn ops(&self) -> Vec<MockOp> {
        self.shared.lock().unwrap().ops.iter().cloned().collect()
    }

    /// All bytes written so far on one stream, in order.
    pub fn written(&self, stream_id: StreamId) -> Vec<u8> {
        let shared = self.shared.lock().unwrap();
        shared
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Write { stream_id: id, data, .. } if *id == stream_id => Some(&data[..]),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    /// Whether a FIN-flagged write happened on the stream.
    pub fn fin_sent(&self, stream_id: StreamId) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.ops.iter().any(|op| {
            matches!(op, MockOp::Write { stream_id: id, fin: true, .. } if *id == stream_id)
        })
    }

    /// Whether the client reset the stream.
    pub fn reset(&self, stream_id: StreamId) -> bool {
        let shared = self.shared.lock().unwrap();
        shared
            .ops
            .iter()
            .any(|op| matches!(op, MockOp::Reset { stream_id: id, .. } if *id == stream_id))
    }

    /// Whether the client initiated a connection close.
    pub fn closed(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.ops.iter().any(|op| matches!(op, MockOp::Close { .. }))
    }
}

/// Client-side transport half.
pub struct MockTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shared: Arc<Mutex<Shared>>,
    window: usize,
    next_local_bidi: u64,
    disconnected: bool,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let transport = Self {
            events: rx,
            shared: shared.clone(),
            window: usize::MAX,
            next_local_bidi: 0,
            disconnected: false,
        };
        let handle = MockHandle { events: tx, shared };
        (transport, handle)
    }

    /// Cap what a single `write` accepts, to exercise window-bounded sends.
    pub fn with_send_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    fn record(&self, op: MockOp) {
        self.shared.lock().unwrap().ops.push_back(op);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn next_event(&mut self) -> TransportResult<TransportEvent> {
        if self.disconnected {
            return Err(TransportError::ConnectionClosed);
        }
        match self.events.recv().await {
            Some(TransportEvent::Disconnected) | None => {
                self.disconnected = true;
                Ok(TransportEvent::Disconnected)
            }
            Some(event) => Ok(event),
        }
    }

    async fn open_stream(&mut self) -> TransportResult<StreamId> {
        // Client-initiated bidirectional streams: 0, 4, 8, ...
        let stream_id = self.next_local_bidi * 4;
        self.next_local_bidi += 1;
        self.record(MockOp::Open { stream_id });
        Ok(stream_id)
    }

    async fn write(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> TransportResult<usize> {
        let accepted = data.len().min(self.window);
        self.record(MockOp::Write {
            stream_id,
            data: data[..accepted].to_vec(),
            // Partial writes only carry FIN once the queue is drained, and
            // the multiplexer never flags one early.
            fin: fin && accepted == data.len(),
        });
        Ok(accepted)
    }

    fn send_window(&self, _stream_id: StreamId) -> usize {
        self.window
    }

    async fn reset_stream(&mut self, stream_id: StreamId, code: u64) -> TransportResult<()> {
        self.record(MockOp::Reset { stream_id, code });
        Ok(())
    }

    async fn close(&mut self, code: u64) {
        self.record(MockOp::Close { code });
    }
}
