// ABOUTME: Server configuration
// ABOUTME: Defines configurable parameters for the syncsong server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Lead time in milliseconds added to every scheduled playback command
    pub command_delay_ms: u64,
    /// How many milliseconds before a track ends the next one is started
    pub track_end_lead_ms: u64,
    /// Clock handshake rounds per connection (odd)
    pub handshake_rounds: usize,
    /// Upper bound on the whole clock handshake in milliseconds
    pub handshake_timeout_ms: u64,
    /// How long one outbound frame may wait on a stalled socket
    pub write_timeout_ms: u64,
    /// Directory for persisted sessions; in-memory only when unset
    pub data_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Set the bind address
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the command delay in milliseconds
    pub fn command_delay_ms(mut self, ms: u64) -> Self {
        self.command_delay_ms = ms;
        self
    }

    /// Set the track-end lead in milliseconds
    pub fn track_end_lead_ms(mut self, ms: u64) -> Self {
        self.track_end_lead_ms = ms;
        self
    }

    /// Set the handshake timeout in milliseconds
    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    /// Set the per-frame write timeout in milliseconds
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.write_timeout_ms = ms;
        self
    }

    /// Persist sessions in a SQLite database under `dir`
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Write timeout as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            command_delay_ms: 500,
            track_end_lead_ms: 2_000,
            handshake_rounds: crate::server::handshake::HANDSHAKE_ROUNDS,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            data_dir: None,
        }
    }
}
