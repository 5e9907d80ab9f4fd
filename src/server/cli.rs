// ABOUTME: Shared CLI argument parsing and server builder utilities
// ABOUTME: Turns command-line flags into tracing setup and a ServerConfig

use crate::server::ServerConfig;
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Common server arguments
///
/// Use with `#[command(flatten)]` in your binary's Args struct:
/// ```ignore
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     server: ServerArgs,
/// }
/// ```
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to bind the server to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Directory for the SQLite session database (sessions are kept in memory only if omitted)
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Lead time in milliseconds added to scheduled playback commands
    #[arg(long, default_value = "500")]
    pub command_delay_ms: u64,

    /// Start the next track this many milliseconds before the current one ends
    #[arg(long, default_value = "2000")]
    pub track_end_lead_ms: u64,

    /// Give up on a client's clock handshake after this many milliseconds
    #[arg(long, default_value = "10000")]
    pub handshake_timeout_ms: u64,

    /// Drop a client whose socket accepts no frame for this many milliseconds
    #[arg(long, default_value = "10000")]
    pub write_timeout_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "syncsong=debug,tower_http=debug"
        } else {
            "syncsong=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self) {
        tracing::info!("SyncSong Server v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Bind: {}", self.bind);
        tracing::info!("Lobbies: http://{}/lobbies", self.bind);
        match &self.data_dir {
            Some(dir) => tracing::info!("Sessions persisted under {}", dir.display()),
            None => tracing::info!("Sessions kept in memory only"),
        }
    }

    /// Build server configuration from args
    pub fn build_config(&self) -> ServerConfig {
        let config = ServerConfig::default()
            .bind_addr(self.bind)
            .command_delay_ms(self.command_delay_ms)
            .track_end_lead_ms(self.track_end_lead_ms)
            .handshake_timeout_ms(self.handshake_timeout_ms)
            .write_timeout_ms(self.write_timeout_ms);

        match &self.data_dir {
            Some(dir) => config.data_dir(dir),
            None => config,
        }
    }
}
