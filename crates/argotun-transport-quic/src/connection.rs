//! quinn-backed [`Transport`] implementation.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use quinn::{Connection, Endpoint, SendStream, VarInt};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use argotun_proto::EDGE_SNI;
use argotun_transport::{StreamId, Transport, TransportError, TransportEvent, TransportResult};

use crate::config::QuicConfig;

/// Read granularity for per-stream pump tasks.
const READ_CHUNK: usize = 8192;

/// What a single `write` may accept; quinn applies real flow control
/// underneath `write_all`.
const WRITE_CHUNK: usize = 64 * 1024;

/// Feed from the pump tasks into `next_event`.
enum Inbound {
    Event(TransportEvent),
    /// A remote-initiated stream was accepted; retain its send half.
    RemoteStream { stream_id: StreamId, send: SendStream },
}

/// QUIC connection to the edge.
pub struct QuicTransport {
    _endpoint: Endpoint,
    connection: Connection,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    send_halves: HashMap<StreamId, SendStream>,
    disconnected: bool,
}

impl QuicTransport {
    /// Resolve the edge address, perform the QUIC handshake and start the
    /// stream pumps. The `Connected` event is queued for the caller's loop.
    pub async fn connect(config: &QuicConfig) -> TransportResult<Self> {
        let addr = resolve(&config.edge_host, config.edge_port).await?;
        debug!(host = %config.edge_host, %addr, "connecting to edge");

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;
        endpoint.set_default_client_config(config.build_client_config()?);

        let connection = endpoint
            .connect(addr, EDGE_SNI)
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        debug!("QUIC handshake completed");

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let _ = inbox_tx.send(Inbound::Event(TransportEvent::Connected));
        tokio::spawn(accept_loop(connection.clone(), inbox_tx.clone()));

        Ok(Self {
            _endpoint: endpoint,
            connection,
            inbox,
            inbox_tx,
            send_halves: HashMap::new(),
            disconnected: false,
        })
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn next_event(&mut self) -> TransportResult<TransportEvent> {
        if self.disconnected {
            return Err(TransportError::ConnectionClosed);
        }
        loop {
            match self.inbox.recv().await {
                Some(Inbound::Event(event)) => {
                    if matches!(event, TransportEvent::Disconnected) {
                        self.disconnected = true;
                    }
                    return Ok(event);
                }
                Some(Inbound::RemoteStream { stream_id, send }) => {
                    self.send_halves.insert(stream_id, send);
                }
                None => {
                    self.disconnected = true;
                    return Ok(TransportEvent::Disconnected);
                }
            }
        }
    }

    async fn open_stream(&mut self) -> TransportResult<StreamId> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        // Client-initiated bidirectional streams are numbered 4n on the
        // wire.
        let stream_id = send.id().index() * 4;
        trace!(stream_id, "opened bidirectional stream");
        self.send_halves.insert(stream_id, send);
        tokio::spawn(read_loop(stream_id, recv, self.inbox_tx.clone()));
        Ok(stream_id)
    }

    async fn write(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> TransportResult<usize> {
        let send = self
            .send_halves
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream(stream_id))?;

        if !data.is_empty() {
            match send.write_all(data).await {
                Ok(()) => {}
                Err(quinn::WriteError::Stopped(code)) => {
                    // Peer stopped reading; surface it so the multiplexer
                    // resets the stream.
                    warn!(stream_id, %code, "peer stopped reading");
                    self.send_halves.remove(&stream_id);
                    let _ = self
                        .inbox_tx
                        .send(Inbound::Event(TransportEvent::StopSending { stream_id }));
                    return Ok(data.len());
                }
                Err(e) => return Err(TransportError::Protocol(e.to_string())),
            }
        }

        if fin {
            if let Some(mut send) = self.send_halves.remove(&stream_id) {
                if let Err(e) = send.finish() {
                    debug!(stream_id, error = %e, "finish on closed stream");
                }
                trace!(stream_id, "stream send side finished");
            }
        }
        Ok(data.len())
    }

    fn send_window(&self, _stream_id: StreamId) -> usize {
        WRITE_CHUNK
    }

    async fn reset_stream(&mut self, stream_id: StreamId, code: u64) -> TransportResult<()> {
        if let Some(mut send) = self.send_halves.remove(&stream_id) {
            let _ = send.reset(VarInt::from_u32(code as u32));
        }
        Ok(())
    }

    async fn close(&mut self, code: u64) {
        self.connection
            .close(VarInt::from_u32(code as u32), b"shutdown");
        debug!(code, "connection close initiated");
    }
}

async fn resolve(host: &str, port: u16) -> TransportResult<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TransportError::Setup(format!("no addresses for {host}")))
}

/// Accept remote-initiated bidirectional streams until the connection
/// ends, then report the disconnect.
async fn accept_loop(connection: Connection, tx: mpsc::UnboundedSender<Inbound>) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                // Server-initiated bidirectional streams are numbered
                // 4n + 1 on the wire.
                let stream_id = send.id().index() * 4 + 1;
                debug!(stream_id, "accepted remote stream");
                if tx
                    .send(Inbound::RemoteStream { stream_id, send })
                    .is_err()
                {
                    return;
                }
                tokio::spawn(read_loop(stream_id, recv, tx.clone()));
            }
            Err(quinn::ConnectionError::ApplicationClosed(reason)) => {
                debug!(%reason, "connection closed by application");
                let _ = tx.send(Inbound::Event(TransportEvent::Disconnected));
                return;
            }
            Err(quinn::ConnectionError::LocallyClosed) => {
                debug!("connection closed locally");
                let _ = tx.send(Inbound::Event(TransportEvent::Disconnected));
                return;
            }
            Err(e) => {
                error!(error = %e, "connection lost");
                let _ = tx.send(Inbound::Event(TransportEvent::Disconnected));
                return;
            }
        }
    }
}

/// Pump one stream's receive side into the event feed.
async fn read_loop(
    stream_id: StreamId,
    mut recv: quinn::RecvStream,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        match recv.read_chunk(READ_CHUNK, true).await {
            Ok(Some(chunk)) => {
                if tx
                    .send(Inbound::Event(TransportEvent::StreamData {
                        stream_id,
                        data: chunk.bytes,
                    }))
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(Inbound::Event(TransportEvent::StreamFin { stream_id }));
                return;
            }
            Err(quinn::ReadError::Reset(code)) => {
                debug!(stream_id, %code, "stream reset by peer");
                let _ = tx.send(Inbound::Event(TransportEvent::StreamReset { stream_id }));
                return;
            }
            Err(e) => {
                // Connection-level failure; the accept loop reports the
                // disconnect.
                trace!(stream_id, error = %e, "read loop ended");
                return;
            }
        }
    }
}
