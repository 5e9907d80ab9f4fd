// ABOUTME: One connected participant of a session
// ABOUTME: Holds the member's clock sync result and its serialized outbound channel

use crate::protocol::broadcast::Broadcast;
use crate::protocol::messages::WireMessage;
use crate::server::handshake::ClockSync;
use tokio::sync::mpsc;

/// A joined session member
///
/// `tx` feeds a per-member send task, so sends to one member are serialized
/// while sends to different members never wait on each other.
#[derive(Debug, Clone)]
pub struct SessionMember {
    /// Unique name within the session
    pub name: String,
    /// Handshake result used to correct outbound timestamps
    pub clock: ClockSync,
    /// Channel to send messages to this member
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl SessionMember {
    /// Create a new member
    pub fn new(
        name: impl Into<String>,
        clock: ClockSync,
        tx: mpsc::UnboundedSender<WireMessage>,
    ) -> Self {
        Self {
            name: name.into(),
            clock,
            tx,
        }
    }

    /// Send a broadcast with its execute-at instant moved onto this member's clock
    ///
    /// Fire-and-forget: returns false if the member's connection is gone.
    pub fn send(&self, msg: &Broadcast) -> bool {
        self.send_raw(msg.to_wire(self.clock.offset_millis))
    }

    /// Send an already rendered message without correction
    pub fn send_raw(&self, msg: WireMessage) -> bool {
        if self.tx.send(msg).is_err() {
            log::debug!("Member {} outbound channel closed, dropping message", self.name);
            return false;
        }
        true
    }
}
