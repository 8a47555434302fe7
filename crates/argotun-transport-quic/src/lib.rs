//! QUIC transport to the edge, built on quinn.
//!
//! Adapts quinn's async stream API to the [`Transport`] event feed the
//! multiplexer consumes: spawned tasks pump accepted streams and per-stream
//! reads into a single ordered channel, while writes go through retained
//! send halves. TLS is rustls with the webpki root set; the ALPN and SNI
//! are the fixed edge values.

pub mod config;
pub mod connection;

pub use config::QuicConfig;
pub use connection::QuicTransport;
