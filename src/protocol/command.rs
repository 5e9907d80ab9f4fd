// ABOUTME: Command tag enumerations for both message directions
// ABOUTME: Decodes inbound wire messages into typed client commands once, at the boundary

use crate::error::Error;
use crate::protocol::messages::{Track, WireMessage};
use crate::Result;

/// Client-originated command tags (codes start at 1, 0 is absent)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTag {
    /// Handshake acknowledgement
    Handshake,
    /// Add a song to the session
    AddSong,
    /// Vote to skip the current track
    VoteSkip,
    /// Hand the admin role to another member
    Promote,
    /// Ask for the full session state
    RequestState,
    /// Code outside the known range
    Unknown(u8),
}

impl ClientTag {
    /// Wire code for this tag
    pub fn code(self) -> u8 {
        match self {
            ClientTag::Handshake => 1,
            ClientTag::AddSong => 2,
            ClientTag::VoteSkip => 3,
            ClientTag::Promote => 4,
            ClientTag::RequestState => 5,
            ClientTag::Unknown(code) => code,
        }
    }
}

impl From<u8> for ClientTag {
    fn from(code: u8) -> Self {
        match code {
            1 => ClientTag::Handshake,
            2 => ClientTag::AddSong,
            3 => ClientTag::VoteSkip,
            4 => ClientTag::Promote,
            5 => ClientTag::RequestState,
            other => ClientTag::Unknown(other),
        }
    }
}

/// Server-originated command tags (codes start at 1, 0 is absent)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTag {
    /// Clock handshake probe
    Handshake,
    /// Start the attached track at the execute-at instant
    Play,
    /// Stop playback
    Pause,
    /// Resume playback
    Resume,
    /// Skip the current track
    Skip,
    /// Seek to the attached track position at the execute-at instant
    SeekTo,
    /// Seek relative to the current position
    SeekRelative,
    /// Queue changed
    Queue,
    /// Code outside the known range
    Unknown(u8),
}

impl ServerTag {
    /// Wire code for this tag
    pub fn code(self) -> u8 {
        match self {
            ServerTag::Handshake => 1,
            ServerTag::Play => 2,
            ServerTag::Pause => 3,
            ServerTag::Resume => 4,
            ServerTag::Skip => 5,
            ServerTag::SeekTo => 6,
            ServerTag::SeekRelative => 7,
            ServerTag::Queue => 8,
            ServerTag::Unknown(code) => code,
        }
    }
}

impl From<u8> for ServerTag {
    fn from(code: u8) -> Self {
        match code {
            1 => ServerTag::Handshake,
            2 => ServerTag::Play,
            3 => ServerTag::Pause,
            4 => ServerTag::Resume,
            5 => ServerTag::Skip,
            6 => ServerTag::SeekTo,
            7 => ServerTag::SeekRelative,
            8 => ServerTag::Queue,
            other => ServerTag::Unknown(other),
        }
    }
}

/// A decoded client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Handshake acknowledgement carrying the client's local receipt time
    HandshakeAck(i64),
    /// Queue or play a track
    AddSong(Track),
    /// Vote to skip the current track
    VoteSkip,
    /// Promote the named member to admin
    Promote(String),
    /// Request a unicast of the full state
    RequestState,
    /// Free text relayed to every member (no command tag)
    Chat(String),
}

impl ClientCommand {
    /// Decode a wire message, rejecting unknown tags and missing payloads
    pub fn decode(msg: WireMessage) -> Result<Self> {
        match ClientTag::from(msg.command) {
            ClientTag::Handshake => msg
                .timestamp_millis
                .map(ClientCommand::HandshakeAck)
                .ok_or_else(|| Error::Protocol("handshake ack without timestamp".to_string())),
            ClientTag::AddSong => match msg.track {
                Some(track) if track.uri.is_empty() => {
                    Err(Error::Protocol("add song without a track uri".to_string()))
                }
                Some(track) if track.duration_millis <= 0 => Err(Error::Protocol(format!(
                    "track {} has invalid duration {}",
                    track.uri, track.duration_millis
                ))),
                Some(track) => Ok(ClientCommand::AddSong(track)),
                None => Err(Error::Protocol("add song without a track uri".to_string())),
            },
            ClientTag::VoteSkip => Ok(ClientCommand::VoteSkip),
            ClientTag::Promote => match msg.admin {
                Some(target) if !target.is_empty() => Ok(ClientCommand::Promote(target)),
                _ => Err(Error::Protocol("promote without a target".to_string())),
            },
            ClientTag::RequestState => Ok(ClientCommand::RequestState),
            ClientTag::Unknown(0) => match msg.user_text {
                Some(text) if !text.is_empty() => Ok(ClientCommand::Chat(text)),
                _ => Err(Error::Protocol("message has no command".to_string())),
            },
            ClientTag::Unknown(code) => Err(Error::Protocol(format!("unknown command {}", code))),
        }
    }

    /// Encode as a client would send it
    pub fn encode(&self) -> WireMessage {
        match self {
            ClientCommand::HandshakeAck(ts) => WireMessage {
                command: ClientTag::Handshake.code(),
                timestamp_millis: Some(*ts),
                ..Default::default()
            },
            ClientCommand::AddSong(track) => WireMessage {
                command: ClientTag::AddSong.code(),
                track: Some(track.clone()),
                ..Default::default()
            },
            ClientCommand::VoteSkip => WireMessage {
                command: ClientTag::VoteSkip.code(),
                ..Default::default()
            },
            ClientCommand::Promote(target) => WireMessage {
                command: ClientTag::Promote.code(),
                admin: Some(target.clone()),
                ..Default::default()
            },
            ClientCommand::RequestState => WireMessage {
                command: ClientTag::RequestState.code(),
                ..Default::default()
            },
            ClientCommand::Chat(text) => WireMessage::text(text.clone()),
        }
    }
}
