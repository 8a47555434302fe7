//! Tunnel state machine.
//!
//! Drives one connection attempt: open the control stream and register on
//! `Connected`, watch the control stream for the registration Return, and
//! serve each remote data stream by unframing the request, forwarding it to
//! the origin and framing the reply back.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use argotun_connection::{ConnectionError, EventHandler, Multiplexer, TunnelEvent};
use argotun_proto::codec::wire_message_size;
use argotun_proto::{framing, rpc, ConnectionOptions, RegistrationResult};
use argotun_transport::{StreamId, Transport};
use uuid::Uuid;

use crate::config::{ClientConfig, Credentials, TunnelMode};
use crate::origin::{OriginProxy, OriginResponse};

/// Per-connection-attempt state. Owns the registration progress and the
/// origin proxy; the multiplexer owns the streams.
pub struct Tunnel {
    mode: TunnelMode,
    credentials: Option<Credentials>,
    options: ConnectionOptions,
    origin: OriginProxy,
    conn_index: u8,
    control_stream: Option<StreamId>,
    registration: Option<RegistrationResult>,
}

/// What to do with a data stream after inspecting its buffer.
enum DataStreamStep {
    Wait,
    Reset,
    Serve { frame: Vec<u8>, body: Vec<u8> },
}

impl Tunnel {
    pub fn new(config: &ClientConfig) -> Self {
        let options = ConnectionOptions {
            client_id: Uuid::new_v4().into_bytes(),
            version: format!("argotun/{}", env!("CARGO_PKG_VERSION")),
            arch: format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH),
            replace_existing: false,
            compression_quality: 0,
            num_previous_attempts: 0,
        };
        Self {
            mode: config.mode,
            credentials: config.credentials.clone(),
            options,
            origin: OriginProxy::new(config.origin.clone()),
            conn_index: 0,
            control_stream: None,
            registration: None,
        }
    }

    /// Outcome of the registration exchange, once one has been decoded.
    pub fn registration(&self) -> Option<&RegistrationResult> {
        self.registration.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.as_ref().is_some_and(|r| r.success)
    }

    async fn on_connected<T: Transport>(
        &mut self,
        conn: &mut Multiplexer<T>,
    ) -> Result<(), ConnectionError> {
        if self.mode == TunnelMode::HandshakeOnly {
            info!("handshake completed, closing (smoke-test mode)");
            conn.close().await;
            return Ok(());
        }

        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ConnectionError::Protocol("missing tunnel credentials".to_string()))?;

        let stream_id = conn.open_stream(true).await?;
        self.control_stream = Some(stream_id);

        let request = rpc::encode_register(
            &credentials.auth(),
            &credentials.tunnel_id,
            self.conn_index,
            &self.options,
        )
        .map_err(|e| ConnectionError::Protocol(e.to_string()))?;

        info!(
            stream_id,
            bytes = request.len(),
            "sending registration on control stream"
        );
        // The control stream stays open for the connection's lifetime.
        conn.send(stream_id, &request, false).await
    }

    /// Consume complete messages off the control stream. Heartbeats and the
    /// Bootstrap's own Return don't decode as registration results and are
    /// skipped.
    async fn process_control<T: Transport>(
        &mut self,
        conn: &mut Multiplexer<T>,
    ) -> Result<(), ConnectionError> {
        let Some(control_id) = self.control_stream else {
            return Ok(());
        };
        loop {
            let message = {
                let Some(record) = conn.stream_mut(control_id) else {
                    return Ok(());
                };
                let unconsumed = record.unconsumed();
                let size = wire_message_size(unconsumed);
                if size == 0 {
                    return Ok(());
                }
                let message = unconsumed[..size].to_vec();
                record.consume(size);
                message
            };

            match rpc::decode_response(&message) {
                Ok(result) if result.success => {
                    info!(
                        uuid = %result.uuid,
                        location = %result.location,
                        remotely_managed = result.tunnel_is_remote,
                        "tunnel registered"
                    );
                    self.registration = Some(result);
                }
                Ok(result) => {
                    error!(
                        error = %result.error,
                        should_retry = result.should_retry,
                        retry_after_ns = result.retry_after_ns,
                        "registration failed"
                    );
                    self.registration = Some(result);
                    conn.close().await;
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "skipping control-stream message");
                }
            }
        }
    }

    /// Serve a data stream once its framed request is complete. The edge
    /// keeps the stream open bidirectionally, so this fires on data as well
    /// as on FIN and must not wait for the latter.
    async fn handle_data_stream<T: Transport>(
        &mut self,
        conn: &mut Multiplexer<T>,
        stream_id: StreamId,
    ) -> Result<(), ConnectionError> {
        let step = {
            let Some(record) = conn.stream_mut(stream_id) else {
                return Ok(());
            };
            if record.is_control() || record.is_handled() {
                return Ok(());
            }
            let received = record.received();
            if received.len() >= framing::PREAMBLE_LEN && !framing::has_valid_preamble(received) {
                DataStreamStep::Reset
            } else {
                match framing::request_size(received) {
                    0 => DataStreamStep::Wait,
                    total => {
                        record.mark_handled();
                        let received = record.received();
                        DataStreamStep::Serve {
                            frame: received[..total].to_vec(),
                            body: received[total..].to_vec(),
                        }
                    }
                }
            }
        };

        let (frame, body) = match step {
            DataStreamStep::Wait => return Ok(()),
            DataStreamStep::Reset => {
                warn!(stream_id, "bad framing on data stream, resetting");
                return conn.reset_stream(stream_id).await;
            }
            DataStreamStep::Serve { frame, body } => (frame, body),
        };

        let request = match framing::parse_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(stream_id, error = %e, "unparseable request, resetting stream");
                return conn.reset_stream(stream_id).await;
            }
        };
        info!(
            stream_id,
            method = request.method().unwrap_or("?"),
            host = request.host().unwrap_or("?"),
            dest = %request.dest,
            body_len = body.len(),
            "handling request"
        );

        let response = self.origin.forward(&request, &body).await;
        self.send_response(conn, stream_id, &response).await
    }

    async fn send_response<T: Transport>(
        &mut self,
        conn: &mut Multiplexer<T>,
        stream_id: StreamId,
        response: &OriginResponse,
    ) -> Result<(), ConnectionError> {
        let metadata = framing::build_http_metadata(response.status, &response.headers);
        let frame = framing::build_response(&metadata)
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;

        conn.send(stream_id, &frame, false).await?;
        // Body (possibly empty) carries the end-of-stream marker.
        conn.send(stream_id, &response.body, true).await?;

        info!(
            stream_id,
            status = response.status,
            body_len = response.body.len(),
            "response sent"
        );
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> EventHandler<T> for Tunnel {
    async fn on_event(
        &mut self,
        conn: &mut Multiplexer<T>,
        event: TunnelEvent,
    ) -> Result<(), ConnectionError> {
        match event {
            TunnelEvent::Connected => self.on_connected(conn).await,
            TunnelEvent::Disconnected => {
                info!("disconnected from edge");
                Ok(())
            }
            TunnelEvent::StreamOpenedRemote { stream_id } => {
                debug!(stream_id, "edge opened stream");
                Ok(())
            }
            TunnelEvent::StreamData { stream_id, .. } | TunnelEvent::StreamFin { stream_id, .. } => {
                if Some(stream_id) == self.control_stream {
                    self.process_control(conn).await
                } else {
                    self.handle_data_stream(conn, stream_id).await
                }
            }
        }
    }
}
