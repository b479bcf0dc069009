//! WaveCall Core Library
//!
//! Call signaling and peer-session lifecycle for the WaveCall messenger.
//! Provides: the signaling relay over a pluggable store, the peer session
//! that owns the live media transport, and the call state machine the UI
//! talks to.

pub mod call;
pub mod error;
pub mod media;
pub mod models;
pub mod network;
pub mod peer;
pub mod relay;
pub mod storage;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use call::*;
pub use error::*;
pub use media::*;
pub use models::*;
pub use network::*;
pub use peer::*;
pub use relay::*;
pub use storage::*;

/// One STUN or TURN server entry handed to the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            ..Default::default()
        }
    }
}

/// Reconnect backoff for the inbound signal subscription: exponential,
/// jittered, capped, reset after a successful reconnect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Everything the call manager needs, passed in at construction. There is
/// no process-wide current-user state anywhere in this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub local_user_id: String,
    pub ice_servers: Vec<IceServer>,
    /// Bound on the whole setup path (Calling/Ringing through Connected).
    /// Expiry is handled like a remote hangup with reason `timeout`.
    pub setup_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl CallConfig {
    pub fn new(local_user_id: &str) -> Self {
        Self {
            local_user_id: local_user_id.to_string(),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            setup_timeout_secs: 60,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

/// Location of the remote signaling backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl RelayEndpoint {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            use_tls,
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.host, self.port)
    }
}
