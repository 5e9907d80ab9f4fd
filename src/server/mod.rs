// ABOUTME: Server module for syncsong
// ABOUTME: Sessions, clock handshake, scheduling, routing and persistence

mod cli;
mod client_handler;
mod clock;
mod config;
/// Clock handshake and latency/offset estimation
pub mod handshake;
mod member;
mod queue;
mod registry;
/// Session state machine and processor
pub mod session;
/// Session persistence
pub mod store;
mod server;
mod timer;

pub use cli::ServerArgs;
pub use client_handler::handle_client;
pub use clock::ServerClock;
pub use config::ServerConfig;
pub use handshake::{
    determine_latency_and_offset, median_absolute_deviation, negotiate_clock, ClockSync,
    HandshakeSample,
};
pub use member::SessionMember;
pub use queue::TrackQueue;
pub use registry::{SessionId, SessionRegistry};
pub use server::{router, AppState, SyncSongServer};
pub use session::{
    skip_vote_tally, LobbyMode, Session, SessionEvent, SessionHandle, SessionInfo,
    SessionSettings, SessionSummary, SkipTally,
};
pub use store::{MemoryStore, Persister, SessionRecord, SessionStore, SqliteStore};
pub use timer::SynchronizedTimer;
