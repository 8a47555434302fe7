//! QUIC client configuration for the edge connection.

use std::sync::Arc;
use std::time::Duration;

use argotun_proto::{EDGE_ALPN, EDGE_DEFAULT_HOST, EDGE_DEFAULT_PORT};
use argotun_transport::TransportError;

/// Connection parameters for the edge.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Edge hostname (resolved at connect time).
    pub edge_host: String,

    /// Edge port.
    pub edge_port: u16,

    /// Keep-alive interval.
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout before the connection is considered dead.
    pub max_idle_timeout: Duration,
}

impl QuicConfig {
    pub fn new(edge_host: impl Into<String>, edge_port: u16) -> Self {
        Self {
            edge_host: edge_host.into(),
            edge_port,
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
        }
    }

    /// Build the quinn client config: webpki roots, edge ALPN, keep-alive.
    pub(crate) fn build_client_config(&self) -> Result<quinn::ClientConfig, TransportError> {
        let mut roots = quinn::rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut client_crypto = quinn::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![EDGE_ALPN.as_bytes().to_vec()];

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(
            self.max_idle_timeout
                .try_into()
                .map_err(|_| TransportError::Setup("idle timeout out of range".to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self::new(EDGE_DEFAULT_HOST, EDGE_DEFAULT_PORT)
    }
}
