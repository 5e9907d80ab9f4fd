// ABOUTME: Immutable server->client broadcast values
// ABOUTME: Pure builders per branch plus state snapshot attachment and offset correction

use crate::protocol::command::ServerTag;
use crate::protocol::messages::{Track, WireMessage};
use serde::Serialize;

/// Full session state attached to broadcasts so clients self-heal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Current track with its live position, if any
    pub current_track: Option<Track>,
    /// Pending tracks in play order
    pub track_queue: Vec<Track>,
    /// Joined member names in join order
    pub member_names: Vec<String>,
    /// Current admin
    pub admin: Option<String>,
    /// Server-clock instant at which `current_track.position_millis` applies
    #[serde(skip)]
    pub execute_at: Option<i64>,
}

/// A complete outbound message, expressed in server time
///
/// Built once per branch by the constructors below and never mutated
/// afterwards; [`Broadcast::to_wire`] applies each recipient's clock offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Broadcast {
    username: Option<String>,
    track: Option<Track>,
    queue: Option<Vec<Track>>,
    members: Option<Vec<String>>,
    admin: Option<String>,
    command: Option<ServerTag>,
    text: Option<String>,
    execute_at: Option<i64>,
}

impl Broadcast {
    /// Informational server text
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Text relayed on behalf of a member
    pub fn chat(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: Some(from.into()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Start `track` at server instant `execute_at`
    pub fn play(track: Track, execute_at: i64) -> Self {
        Self {
            track: Some(track),
            command: Some(ServerTag::Play),
            execute_at: Some(execute_at),
            ..Default::default()
        }
    }

    /// Stop playback; nothing left to play
    pub fn pause() -> Self {
        Self {
            command: Some(ServerTag::Pause),
            ..Default::default()
        }
    }

    /// Queue changed
    pub fn queued() -> Self {
        Self {
            command: Some(ServerTag::Queue),
            ..Default::default()
        }
    }

    /// State-only message; pair with [`Broadcast::with_state`]
    pub fn state() -> Self {
        Self::default()
    }

    /// Seek to the live position carried by the snapshot
    ///
    /// Falls back to a plain state message when nothing is timed.
    pub fn resync(snapshot: &StateSnapshot) -> Self {
        let command = match (&snapshot.current_track, snapshot.execute_at) {
            (Some(_), Some(_)) => Some(ServerTag::SeekTo),
            _ => None,
        };
        Self {
            command,
            ..Default::default()
        }
        .with_state(snapshot)
    }

    /// Attach the full session state
    pub fn with_state(self, snapshot: &StateSnapshot) -> Self {
        Self {
            track: snapshot.current_track.clone(),
            queue: Some(snapshot.track_queue.clone()),
            members: Some(snapshot.member_names.clone()),
            admin: snapshot.admin.clone(),
            execute_at: snapshot.execute_at.or(self.execute_at),
            ..self
        }
    }

    /// Command tag carried, if any
    pub fn command(&self) -> Option<ServerTag> {
        self.command
    }

    /// Track carried, if any
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    /// Text carried, if any
    pub fn user_text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Execute-at instant in server time
    pub fn execute_at(&self) -> Option<i64> {
        self.execute_at
    }

    /// Render for one recipient, shifting the execute-at instant onto their clock
    pub fn to_wire(&self, offset_millis: i64) -> WireMessage {
        WireMessage {
            username: self.username.clone(),
            track: self.track.clone(),
            track_queue: self.queue.clone(),
            member_names: self.members.clone(),
            admin: self.admin.clone(),
            command: self.command.map(ServerTag::code).unwrap_or(0),
            user_text: self.text.clone(),
            timestamp_millis: self.execute_at.map(|ts| ts + offset_millis),
        }
    }
}
