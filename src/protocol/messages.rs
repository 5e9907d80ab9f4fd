// ABOUTME: Protocol message type definitions and serialization
// ABOUTME: One JSON envelope shared by client->server and server->client traffic

use crate::protocol::command::ServerTag;
use serde::{Deserialize, Serialize};

/// A song that can be queued or played
///
/// Immutable once queued. `position_millis` is only meaningful on the
/// currently playing instance and is filled in when a snapshot is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Provider URI identifying the track
    pub uri: String,
    /// Track title
    #[serde(default)]
    pub name: String,
    /// Artist name
    #[serde(default)]
    pub artist: String,
    /// Track length in milliseconds
    #[serde(default)]
    pub duration_millis: i64,
    /// Playback position in milliseconds
    #[serde(default, skip_serializing_if = "is_zero")]
    pub position_millis: i64,
    /// Member who queued the track
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_by: Option<String>,
}

impl Track {
    /// Create a track with the given URI and metadata
    pub fn new(
        uri: impl Into<String>,
        name: impl Into<String>,
        artist: impl Into<String>,
        duration_millis: i64,
    ) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            artist: artist.into(),
            duration_millis,
            position_millis: 0,
            chosen_by: None,
        }
    }
}

/// Wire envelope used in both directions
///
/// Every field except `command` is optional. `command` is a small integer
/// whose meaning depends on direction (see [`crate::protocol::ClientTag`] and
/// [`ServerTag`]); 0 means absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Originating user (absent for server-originated messages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Track referenced by this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<Track>,
    /// Queue snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_queue: Option<Vec<Track>>,
    /// Names of joined members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_names: Option<Vec<String>>,
    /// Current admin, or promotion target on inbound messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<String>,
    /// Command code
    #[serde(default, skip_serializing_if = "is_absent")]
    pub command: u8,
    /// User-facing text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
    /// Execute-at instant (recipient clock) or handshake timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_millis: Option<i64>,
}

impl WireMessage {
    /// Server handshake probe carrying the server send time
    ///
    /// A probe with timestamp 0 tells the peer the handshake phase is over.
    pub fn handshake_probe(server_time_millis: i64) -> Self {
        Self {
            command: ServerTag::Handshake.code(),
            timestamp_millis: Some(server_time_millis),
            ..Default::default()
        }
    }

    /// Plain server text message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            user_text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::error::Error::Internal(format!("failed to encode message: {}", e)))
    }

    /// Parse from JSON
    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| crate::error::Error::Protocol(format!("malformed message: {}", e)))
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_absent(code: &u8) -> bool {
    *code == 0
}
