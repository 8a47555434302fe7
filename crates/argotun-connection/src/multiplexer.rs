//! Per-stream buffering and the connection event loop.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use argotun_transport::{StreamId, Transport, TransportError, TransportEvent};

use crate::{ConnectionError, EventHandler, TunnelEvent};

/// Cap on a single stream's buffered receive or send bytes.
const MAX_STREAM_BUFFER: usize = 4 * 1024 * 1024;

/// Initial receive buffer capacity.
const RECV_BUF_INIT: usize = 4096;

/// State for one bidirectional stream.
#[derive(Debug)]
pub struct StreamRecord {
    stream_id: StreamId,
    is_control: bool,
    send_buf: BytesMut,
    send_cursor: usize,
    send_fin: bool,
    fin_sent: bool,
    recv_buf: BytesMut,
    recv_consumed: usize,
    recv_fin: bool,
    handled: bool,
}

impl StreamRecord {
    fn new(stream_id: StreamId, is_control: bool) -> Self {
        Self {
            stream_id,
            is_control,
            send_buf: BytesMut::new(),
            send_cursor: 0,
            send_fin: false,
            fin_sent: false,
            recv_buf: BytesMut::with_capacity(RECV_BUF_INIT),
            recv_consumed: 0,
            recv_fin: false,
            handled: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_control(&self) -> bool {
        self.is_control
    }

    /// Everything received so far.
    pub fn received(&self) -> &[u8] {
        &self.recv_buf
    }

    /// Received bytes not yet consumed by the application.
    pub fn unconsumed(&self) -> &[u8] {
        &self.recv_buf[self.recv_consumed..]
    }

    /// Advance the application's consumption cursor.
    pub fn consume(&mut self, n: usize) {
        self.recv_consumed = (self.recv_consumed + n).min(self.recv_buf.len());
    }

    pub fn recv_fin(&self) -> bool {
        self.recv_fin
    }

    /// Application flag: the framed request on this stream was already
    /// processed.
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn mark_handled(&mut self) {
        self.handled = true;
    }

    fn pending_send(&self) -> usize {
        self.send_buf.len() - self.send_cursor
    }
}

/// Owns the transport and the stream table; drives the event loop.
pub struct Multiplexer<T: Transport> {
    transport: T,
    streams: HashMap<StreamId, StreamRecord>,
    connected: bool,
}

impl<T: Transport> Multiplexer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            streams: HashMap::new(),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&StreamRecord> {
        self.streams.get(&stream_id)
    }

    pub fn stream_mut(&mut self, stream_id: StreamId) -> Option<&mut StreamRecord> {
        self.streams.get_mut(&stream_id)
    }

    /// The control stream's id, if one has been opened.
    pub fn control_stream(&self) -> Option<StreamId> {
        self.streams
            .values()
            .find(|record| record.is_control)
            .map(|record| record.stream_id)
    }

    /// Open a locally-initiated bidirectional stream and create its record.
    pub async fn open_stream(&mut self, is_control: bool) -> Result<StreamId, ConnectionError> {
        let stream_id = self.transport.open_stream().await?;
        self.streams
            .insert(stream_id, StreamRecord::new(stream_id, is_control));
        debug!(stream_id, is_control, "opened stream");
        Ok(stream_id)
    }

    /// Queue bytes on a stream's send buffer and push as much as the
    /// transport window allows. With `fin` set, the last transmitted write
    /// carries the end-of-stream marker and nothing more may be queued.
    pub async fn send(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<(), ConnectionError> {
        let record = self
            .streams
            .get_mut(&stream_id)
            .ok_or(ConnectionError::UnknownStream(stream_id))?;
        if record.send_fin || record.fin_sent {
            return Err(ConnectionError::StreamFinished(stream_id));
        }
        if record.pending_send() + data.len() > MAX_STREAM_BUFFER {
            return Err(ConnectionError::OutOfMemory {
                stream_id,
                limit: MAX_STREAM_BUFFER,
            });
        }
        record.send_buf.extend_from_slice(data);
        if fin {
            record.send_fin = true;
        }
        trace!(stream_id, queued = data.len(), fin, "queued send bytes");
        self.flush_stream(stream_id).await
    }

    /// Initiate a graceful connection close (application code 0). The loop
    /// observes the resulting disconnect.
    pub async fn close(&mut self) {
        debug!("closing connection");
        self.transport.close(0).await;
    }

    /// Reset a stream (application code 0) and destroy its record.
    pub async fn reset_stream(&mut self, stream_id: StreamId) -> Result<(), ConnectionError> {
        self.streams.remove(&stream_id);
        self.transport.reset_stream(stream_id, 0).await?;
        debug!(stream_id, "stream reset");
        Ok(())
    }

    /// Drive the connection until it disconnects, dispatching events to
    /// `handler`.
    pub async fn run<H>(&mut self, handler: &mut H) -> Result<(), ConnectionError>
    where
        H: EventHandler<T>,
    {
        loop {
            let raw = match self.transport.next_event().await {
                Ok(event) => event,
                Err(TransportError::ConnectionClosed) => TransportEvent::Disconnected,
                Err(e) => return Err(e.into()),
            };
            for event in self.ingest(raw).await? {
                let last = matches!(event, TunnelEvent::Disconnected);
                handler.on_event(self, event).await?;
                if last {
                    return Ok(());
                }
            }
        }
    }

    /// Normalize one raw transport event into zero or more application
    /// events, creating stream records as needed.
    async fn ingest(&mut self, raw: TransportEvent) -> Result<Vec<TunnelEvent>, ConnectionError> {
        let mut events = Vec::new();
        match raw {
            TransportEvent::Connected => {
                self.connected = true;
                events.push(TunnelEvent::Connected);
            }
            TransportEvent::Disconnected => {
                self.connected = false;
                events.push(TunnelEvent::Disconnected);
            }
            TransportEvent::StreamData { stream_id, data } => {
                if self.note_remote_stream(stream_id) {
                    events.push(TunnelEvent::StreamOpenedRemote { stream_id });
                }
                let record = self.streams.get_mut(&stream_id).expect("record exists");
                if record.recv_buf.len() + data.len() > MAX_STREAM_BUFFER {
                    warn!(
                        stream_id,
                        buffered = record.recv_buf.len(),
                        "receive buffer overflow, resetting stream"
                    );
                    self.reset_stream(stream_id).await?;
                    return Ok(events);
                }
                record.recv_buf.extend_from_slice(&data);
                trace!(
                    stream_id,
                    received = data.len(),
                    total = record.recv_buf.len(),
                    "stream data"
                );
                events.push(TunnelEvent::StreamData { stream_id, data });
            }
            TransportEvent::StreamFin { stream_id } => {
                if self.note_remote_stream(stream_id) {
                    events.push(TunnelEvent::StreamOpenedRemote { stream_id });
                }
                let record = self.streams.get_mut(&stream_id).expect("record exists");
                record.recv_fin = true;
                let data = Bytes::copy_from_slice(&record.recv_buf);
                debug!(stream_id, total = data.len(), "stream fin");
                events.push(TunnelEvent::StreamFin { stream_id, data });
            }
            TransportEvent::StreamReset { stream_id } => {
                // No further events for this stream.
                debug!(stream_id, "stream reset by peer");
                self.streams.remove(&stream_id);
            }
            TransportEvent::StopSending { stream_id } => {
                debug!(stream_id, "peer stopped reading, resetting");
                if self.streams.contains_key(&stream_id) {
                    self.reset_stream(stream_id).await?;
                }
            }
            TransportEvent::SendReady { stream_id } => {
                if self.streams.contains_key(&stream_id) {
                    self.flush_stream(stream_id).await?;
                }
            }
        }
        Ok(events)
    }

    /// Record creation for remote-initiated streams; returns true when the
    /// stream was previously unknown.
    fn note_remote_stream(&mut self, stream_id: StreamId) -> bool {
        if self.streams.contains_key(&stream_id) {
            return false;
        }
        debug!(stream_id, "remote opened stream");
        self.streams
            .insert(stream_id, StreamRecord::new(stream_id, false));
        true
    }

    /// Push queued bytes into the transport, `min(available, window)` at a
    /// time. The final write of a FIN-flagged queue carries the marker; the
    /// buffer is released once fully consumed.
    async fn flush_stream(&mut self, stream_id: StreamId) -> Result<(), ConnectionError> {
        loop {
            let record = match self.streams.get_mut(&stream_id) {
                Some(record) => record,
                None => return Ok(()),
            };
            let available = record.pending_send();
            if available == 0 && !record.send_fin {
                if record.send_cursor > 0 {
                    record.send_buf.clear();
                    record.send_cursor = 0;
                }
                return Ok(());
            }

            let window = self.transport.send_window(stream_id);
            let to_send = available.min(window);
            if to_send == 0 && !(record.send_fin && available == 0) {
                // Window exhausted; a SendReady event resumes the flush.
                return Ok(());
            }

            let is_last = record.send_fin && to_send == available;
            let chunk =
                record.send_buf[record.send_cursor..record.send_cursor + to_send].to_vec();
            let accepted = self.transport.write(stream_id, &chunk, is_last).await?;

            let record = self.streams.get_mut(&stream_id).expect("record exists");
            record.send_cursor += accepted;
            trace!(
                stream_id,
                sent = accepted,
                fin = is_last && accepted == to_send,
                "flushed"
            );

            if accepted < to_send {
                return Ok(());
            }
            if is_last {
                record.send_fin = false;
                record.fin_sent = true;
                record.send_buf.clear();
                record.send_cursor = 0;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argotun_transport::mock::{MockOp, MockTransport};
    use async_trait::async_trait;

    /// Handler that records events and optionally echoes on data streams.
    #[derive(Default)]
    struct Recorder {
        events: Vec<TunnelEvent>,
    }

    #[async_trait]
    impl<T: Transport> EventHandler<T> for Recorder {
        async fn on_event(
            &mut self,
            _conn: &mut Multiplexer<T>,
            event: TunnelEvent,
        ) -> Result<(), ConnectionError> {
            self.events.push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn remote_stream_lifecycle_event_order() {
        let (transport, handle) = MockTransport::new();
        let mut mux = Multiplexer::new(transport);
        let mut recorder = Recorder::default();

        handle.push_event(TransportEvent::Connected);
        handle.push_event(TransportEvent::StreamData {
            stream_id: 5,
            data: Bytes::from_static(b"he"),
        });
        handle.push_event(TransportEvent::StreamData {
            stream_id: 5,
            data: Bytes::from_static(b"llo"),
        });
        handle.push_event(TransportEvent::StreamFin { stream_id: 5 });
        handle.push_event(TransportEvent::Disconnected);

        mux.run(&mut recorder).await.unwrap();

        assert!(matches!(recorder.events[0], TunnelEvent::Connected));
        assert!(matches!(
            recorder.events[1],
            TunnelEvent::StreamOpenedRemote { stream_id: 5 }
        ));
        assert!(matches!(
            recorder.events[2],
            TunnelEvent::StreamData { stream_id: 5, .. }
        ));
        match &recorder.events[4] {
            TunnelEvent::StreamFin { stream_id: 5, data } => assert_eq!(&data[..], b"hello"),
            other => panic!("expected StreamFin, got {other:?}"),
        }
        assert!(matches!(recorder.events[5], TunnelEvent::Disconnected));
    }

    #[tokio::test]
    async fn send_is_window_chunked_and_fin_flagged_last() {
        let (transport, handle) = MockTransport::new();
        let mut mux = Multiplexer::new(transport.with_send_window(4));

        let id = mux.open_stream(false).await.unwrap();
        mux.send(id, b"0123456789", true).await.unwrap();

        let writes: Vec<_> = handle
            .take_ops()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::Write { data, fin, .. } => Some((data, fin)),
                _ => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![
                (b"0123".to_vec(), false),
                (b"4567".to_vec(), false),
                (b"89".to_vec(), true),
            ]
        );
    }

    #[tokio::test]
    async fn empty_fin_still_emits_final_write() {
        let (transport, handle) = MockTransport::new();
        let mut mux = Multiplexer::new(transport);

        let id = mux.open_stream(false).await.unwrap();
        mux.send(id, b"", true).await.unwrap();

        assert!(handle.fin_sent(id));
    }

    #[tokio::test]
    async fn send_after_fin_is_rejected() {
        let (transport, _handle) = MockTransport::new();
        let mut mux = Multiplexer::new(transport);

        let id = mux.open_stream(false).await.unwrap();
        mux.send(id, b"done", true).await.unwrap();
        assert!(matches!(
            mux.send(id, b"more", false).await,
            Err(ConnectionError::StreamFinished(_))
        ));
    }

    #[tokio::test]
    async fn peer_reset_destroys_record_silently() {
        let (transport, handle) = MockTransport::new();
        let mut mux = Multiplexer::new(transport);
        let mut recorder = Recorder::default();

        handle.push_event(TransportEvent::Connected);
        handle.push_event(TransportEvent::StreamData {
            stream_id: 9,
            data: Bytes::from_static(b"x"),
        });
        handle.push_event(TransportEvent::StreamReset { stream_id: 9 });
        handle.push_event(TransportEvent::StreamData {
            stream_id: 9,
            data: Bytes::from_static(b"y"),
        });
        handle.push_event(TransportEvent::Disconnected);

        mux.run(&mut recorder).await.unwrap();

        // The second data burst recreates the record as a fresh remote
        // stream; the reset itself emitted nothing.
        let reopened = recorder
            .events
            .iter()
            .filter(|e| matches!(e, TunnelEvent::StreamOpenedRemote { stream_id: 9 }))
            .count();
        assert_eq!(reopened, 2);
    }

    #[tokio::test]
    async fn stop_sending_triggers_local_reset() {
        let (transport, handle) = MockTransport::new();
        let mut mux = Multiplexer::new(transport);
        let mut recorder = Recorder::default();

        handle.push_event(TransportEvent::Connected);
        handle.push_event(TransportEvent::StreamData {
            stream_id: 13,
            data: Bytes::from_static(b"x"),
        });
        handle.push_event(TransportEvent::StopSending { stream_id: 13 });
        handle.push_event(TransportEvent::Disconnected);

        mux.run(&mut recorder).await.unwrap();
        assert!(handle.reset(13));
    }

    #[tokio::test]
    async fn consume_tracks_application_progress() {
        let (transport, handle) = MockTransport::new();
        let mut mux = Multiplexer::new(transport);
        let mut recorder = Recorder::default();

        handle.push_event(TransportEvent::Connected);
        handle.push_event(TransportEvent::StreamData {
            stream_id: 1,
            data: Bytes::from_static(b"abcdef"),
        });
        handle.push_event(TransportEvent::Disconnected);
        mux.run(&mut recorder).await.unwrap();

        let record = mux.stream_mut(1).unwrap();
        record.consume(4);
        assert_eq!(record.unconsumed(), b"ef");
        record.consume(100);
        assert_eq!(record.unconsumed(), b"");
    }
}
