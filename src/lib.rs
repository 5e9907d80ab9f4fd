// ABOUTME: Main library entry point for syncsong
// ABOUTME: Exports the session synchronization engine and its server wrapper

//! # syncsong
//!
//! Session synchronization engine for listening to music together.
//!
//! A group of clients shares one queue and one "now playing" position. Every
//! command (add song, vote skip, promote admin) is applied by a single
//! serialized processor per session and fanned out to all members, with
//! execution timestamps corrected for each member's measured clock offset.
//!
//! ## Features
//!
//! - **ClockSync**: five-round latency/offset handshake with MAD outlier rejection
//! - **Session**: per-lobby command state machine with skip votes and admin handover
//! - **Scheduling**: millisecond timers that auto-advance the queue through the
//!   same command stream as client commands
//!
//! ## Example: Running a Server
//!
//! ```no_run
//! use syncsong::server::{ServerConfig, SyncSongServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default()
//!         .bind_addr("0.0.0.0:8080".parse().unwrap());
//!
//!     let server = SyncSongServer::with_config(config);
//!     server.run().await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

/// Wire protocol: messages, command tags and broadcasts
pub mod protocol;
/// Server implementation: sessions, clock sync, routing and persistence
pub mod server;

pub use protocol::messages::{Track, WireMessage};
pub use server::{ServerConfig, SyncSongServer};

/// Result type for syncsong operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for syncsong
pub mod error {
    use thiserror::Error;

    /// Error types for syncsong operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// Malformed or out-of-sequence handshake/command payload
        #[error("Protocol error: {0}")]
        Protocol(String),

        /// Read or write failure on a member's connection
        #[error("Channel error: {0}")]
        Channel(String),

        /// Command not applicable to the current session state
        #[error("State error: {0}")]
        State(#[from] StateError),

        /// Durable storage failure
        #[error("Persistence error: {0}")]
        Persistence(String),

        /// SQLite query or connection failure
        #[error("Database error: {0}")]
        Database(#[from] sqlx::Error),

        /// A bounded wait expired
        #[error("Timeout: {0}")]
        Timeout(String),

        /// Invariant violated inside the engine
        #[error("Internal error: {0}")]
        Internal(String),
    }

    /// Rejections of a command against the current session state
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StateError {
        /// Pop on an empty track queue
        #[error("track queue is empty")]
        EmptyQueue,

        /// Sender lacks the admin role
        #[error("only the admin can do that")]
        NotAdmin,

        /// Named user is not joined to the session
        #[error("{0} is not a lobby member")]
        NotMember(String),

        /// Another member already uses this name
        #[error("the name {0} is already taken")]
        NameTaken(String),

        /// Sender already voted to skip the current track
        #[error("you have already voted to skip this track")]
        AlreadyVoted,

        /// No track is currently playing
        #[error("nothing is playing")]
        NothingPlaying,

        /// Lobby mode has no behavior for this command
        #[error("{0} lobbies do not support this command")]
        ModeUnsupported(String),
    }

    impl From<axum::Error> for Error {
        fn from(err: axum::Error) -> Self {
            Error::Channel(err.to_string())
        }
    }
}
