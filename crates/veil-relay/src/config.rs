//! Relay server configuration
//!
//! Every knob is a flag with a `RELAY_*` environment fallback, so container
//! deployments configure the relay through the environment alone.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;

/// Relay server configuration.
#[derive(Debug, Clone, Args)]
pub struct RelayConfig {
    /// Bind address; a bare ":port" binds all interfaces
    #[arg(long, env = "RELAY_ADDR", default_value = ":8443")]
    pub addr: String,

    /// TLS certificate path (PEM). TLS is served only when both cert and key
    /// are set; otherwise the listener is plaintext.
    #[arg(long, env = "RELAY_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long, env = "RELAY_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Global cap on concurrent rooms
    #[arg(long, env = "RELAY_MAX_ROOMS", default_value_t = 1000)]
    pub max_rooms: usize,

    /// Per-room member cap
    #[arg(long, env = "RELAY_MAX_CLIENTS_PER_ROOM", default_value_t = 20)]
    pub max_clients_per_room: usize,

    /// Advisory message-size ceiling in bytes. The socket read limit is
    /// pinned at 50 MiB regardless; clients enforce their own smaller cap.
    #[arg(long, env = "RELAY_MAX_MESSAGE_SIZE", default_value_t = 52_428_800)]
    pub max_message_size: u64,

    /// Seconds a room may sit idle before the sweep closes it
    #[arg(long, env = "RELAY_ROOM_IDLE_TIMEOUT", default_value_t = 3600)]
    pub room_idle_timeout: u64,

    /// Admission rate limit per source, requests per second
    #[arg(long, env = "RELAY_RATE_LIMIT_PER_IP", default_value_t = 100.0)]
    pub rate_limit_per_ip: f64,
}

impl RelayConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };
        addr.parse()
            .with_context(|| format!("invalid bind address '{}'", self.addr))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.room_idle_timeout)
    }

    /// Cert and key paths when TLS is fully configured.
    pub fn tls_pair(&self) -> Option<(&str, &str)> {
        match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            _ => None,
        }
    }
}

#[cfg(test)]
impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: ":8443".to_string(),
            tls_cert: None,
            tls_key: None,
            max_rooms: 1000,
            max_clients_per_room: 20,
            max_message_size: 52_428_800,
            room_idle_timeout: 3600,
            rate_limit_per_ip: 100.0,
        }
    }
}
