// ABOUTME: Protocol module for syncsong
// ABOUTME: Wire envelope, command tag decoding and broadcast construction

/// Outbound broadcast values and state snapshots
pub mod broadcast;
/// Client and server command tags
pub mod command;
/// Wire message envelope and track type
pub mod messages;

pub use broadcast::{Broadcast, StateSnapshot};
pub use command::{ClientCommand, ClientTag, ServerTag};
pub use messages::{Track, WireMessage};
