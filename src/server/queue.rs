// ABOUTME: FIFO queue of pending tracks for a session
// ABOUTME: Insertion order is play order; nothing reorders it

use crate::error::StateError;
use crate::protocol::messages::Track;
use std::collections::VecDeque;

/// Ordered queue of tracks waiting to play
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackQueue {
    tracks: VecDeque<Track>,
}

impl TrackQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a track to the back
    pub fn push(&mut self, track: Track) {
        self.tracks.push_back(track);
        log::debug!("Queue length after push: {}", self.tracks.len());
    }

    /// Remove and return the front track
    pub fn pop(&mut self) -> Result<Track, StateError> {
        self.tracks.pop_front().ok_or(StateError::EmptyQueue)
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Number of queued tracks
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Copy of the queue in play order
    pub fn snapshot(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }
}

impl FromIterator<Track> for TrackQueue {
    fn from_iter<I: IntoIterator<Item = Track>>(iter: I) -> Self {
        Self {
            tracks: iter.into_iter().collect(),
        }
    }
}
