//! Client configuration.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use uuid::Uuid;

use crate::origin::OriginConfig;
use argotun_proto::{TunnelAuth, EDGE_DEFAULT_HOST, EDGE_DEFAULT_PORT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid tunnel id: {0}")]
    InvalidTunnelId(String),

    #[error("invalid tunnel secret: {0}")]
    InvalidTunnelSecret(String),

    #[error("invalid origin url: {0}")]
    InvalidOriginUrl(String),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
}

/// What the client does after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Register and proxy requests.
    Full,
    /// Verify the QUIC handshake, then close. Used as a smoke test.
    HandshakeOnly,
}

impl TunnelMode {
    /// `"full"` selects the full tunnel; anything else is the smoke test.
    pub fn from_mode_string(mode: &str) -> Self {
        if mode == "full" {
            TunnelMode::Full
        } else {
            TunnelMode::HandshakeOnly
        }
    }
}

/// Registration credentials, parsed from their textual forms.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub tunnel_id: [u8; 16],
    pub account_tag: String,
    pub tunnel_secret: Vec<u8>,
}

impl Credentials {
    /// `tunnel_id` accepts the hyphenated or bare 32-hex-digit form;
    /// `tunnel_secret_b64` is standard base64.
    pub fn parse(
        tunnel_id: &str,
        account_tag: &str,
        tunnel_secret_b64: &str,
    ) -> Result<Self, ConfigError> {
        let tunnel_id = Uuid::parse_str(tunnel_id)
            .map_err(|e| ConfigError::InvalidTunnelId(e.to_string()))?
            .into_bytes();
        let tunnel_secret = BASE64
            .decode(tunnel_secret_b64.trim())
            .map_err(|e| ConfigError::InvalidTunnelSecret(e.to_string()))?;
        Ok(Self {
            tunnel_id,
            account_tag: account_tag.to_string(),
            tunnel_secret,
        })
    }

    pub fn auth(&self) -> TunnelAuth {
        TunnelAuth {
            account_tag: self.account_tag.clone(),
            tunnel_secret: self.tunnel_secret.clone(),
        }
    }
}

/// Fully-resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub edge_host: String,
    pub edge_port: u16,
    pub mode: TunnelMode,
    pub credentials: Option<Credentials>,
    pub origin: OriginConfig,
}

impl ClientConfig {
    pub fn new(mode: TunnelMode) -> Self {
        Self {
            edge_host: EDGE_DEFAULT_HOST.to_string(),
            edge_port: EDGE_DEFAULT_PORT,
            mode,
            credentials: None,
            origin: OriginConfig::default(),
        }
    }

    /// Credentials are mandatory in full mode.
    pub fn credentials(&self) -> Result<&Credentials, ConfigError> {
        self.credentials
            .as_ref()
            .ok_or(ConfigError::MissingCredential("tunnel credentials"))
    }
}
