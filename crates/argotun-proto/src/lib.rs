//! Edge Tunnel Protocol Definitions
//!
//! This crate implements the three wire-level layers of the tunnel protocol:
//!
//! - [`codec`]: a single-segment subset of the Cap'n Proto encoding used by
//!   every message on the wire,
//! - [`rpc`]: the control-stream registration exchange (Bootstrap + Call
//!   out, Return in),
//! - [`framing`]: the preamble-framed request/response messages carried on
//!   data streams.

pub mod codec;
pub mod framing;
pub mod rpc;

pub use codec::{wire_message_size, CodecError, MessageBuilder, MessageReader};
pub use framing::FramingError;
pub use rpc::RpcError;

/// TLS SNI presented to the edge.
pub const EDGE_SNI: &str = "quic.cftunnel.com";

/// QUIC ALPN for the tunnel protocol.
pub const EDGE_ALPN: &str = "argotunnel";

/// Default edge hostname.
pub const EDGE_DEFAULT_HOST: &str = "region1.v2.argotunnel.com";

/// Default edge port.
pub const EDGE_DEFAULT_PORT: u16 = 7844;

/// Six-byte signature prefixing every data-stream message.
pub const DATA_STREAM_SIGNATURE: [u8; 6] = [0x0A, 0x36, 0xCD, 0x12, 0xA1, 0x3E];

/// Six-byte signature for RPC streams (reserved; the control stream carries
/// bare codec messages).
pub const RPC_STREAM_SIGNATURE: [u8; 6] = [0x52, 0xBB, 0x82, 0x5C, 0xDB, 0x65];

/// Two-byte framing version following the signature.
pub const STREAM_VERSION: [u8; 2] = *b"01";

/// Interface id of the edge's registration service.
pub const TUNNEL_SERVER_INTERFACE_ID: u64 = 0xf716_95ec_7fe8_5497;

/// Method id of `registerConnection` on that interface.
pub const REGISTER_CONNECTION_METHOD_ID: u16 = 0;

/// Upper bound on metadata entries per request or response.
pub const MAX_METADATA: usize = 32;

/// What an inbound stream is asking us to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Http,
    Websocket,
    Tcp,
}

impl ConnectionType {
    pub fn from_wire(value: u16) -> Self {
        match value {
            1 => ConnectionType::Websocket,
            2 => ConnectionType::Tcp,
            _ => ConnectionType::Http,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            ConnectionType::Http => 0,
            ConnectionType::Websocket => 1,
            ConnectionType::Tcp => 2,
        }
    }
}

/// A single `(key, val)` metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub key: String,
    pub val: String,
}

impl Metadata {
    pub fn new(key: impl Into<String>, val: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            val: val.into(),
        }
    }
}

/// Inbound request decoded from a data-stream frame.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub dest: String,
    pub conn_type: u16,
    pub metadata: Vec<Metadata>,
}

impl ConnectRequest {
    fn find(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.val.as_str())
    }

    /// `HttpMethod` metadata entry, if present (case-sensitive key).
    pub fn method(&self) -> Option<&str> {
        self.find("HttpMethod")
    }

    /// `HttpHost` metadata entry, if present (case-sensitive key).
    pub fn host(&self) -> Option<&str> {
        self.find("HttpHost")
    }

    pub fn connection_type(&self) -> ConnectionType {
        ConnectionType::from_wire(self.conn_type)
    }
}

/// Outbound response for a data-stream frame. An empty `error` means
/// success.
#[derive(Debug, Clone, Default)]
pub struct ConnectResponse {
    pub error: String,
    pub metadata: Vec<Metadata>,
}

/// Credentials presented during registration.
#[derive(Debug, Clone)]
pub struct TunnelAuth {
    pub account_tag: String,
    pub tunnel_secret: Vec<u8>,
}

/// Client-side options attached to the registration call.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub client_id: [u8; 16],
    pub version: String,
    pub arch: String,
    pub replace_existing: bool,
    pub compression_quality: u8,
    pub num_previous_attempts: u8,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            client_id: [0; 16],
            version: String::new(),
            arch: String::new(),
            replace_existing: false,
            compression_quality: 0,
            num_previous_attempts: 0,
        }
    }
}

/// Outcome of a registration attempt, decoded from the edge's Return.
#[derive(Debug, Clone, Default)]
pub struct RegistrationResult {
    pub success: bool,
    pub uuid: String,
    pub location: String,
    pub tunnel_is_remote: bool,
    pub error: String,
    pub retry_after_ns: i64,
    pub should_retry: bool,
}
