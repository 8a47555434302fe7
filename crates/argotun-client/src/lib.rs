//! Tunnel client library.
//!
//! Ties the protocol engine together: the [`tunnel::Tunnel`] state machine
//! registers over the control stream and serves proxied requests by
//! forwarding them to a local origin through [`origin::OriginProxy`].

pub mod config;
pub mod origin;
pub mod tunnel;

pub use config::{ClientConfig, ConfigError, Credentials, TunnelMode};
pub use origin::{OriginConfig, OriginProxy, OriginResponse};
pub use tunnel::Tunnel;
