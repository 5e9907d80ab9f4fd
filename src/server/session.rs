// ABOUTME: Session (lobby) state machine and its single serialized command processor
// ABOUTME: Owns queue, current track, members, admin, skip votes and the track timer

use crate::error::{Error, StateError};
use crate::protocol::broadcast::{Broadcast, StateSnapshot};
use crate::protocol::command::ClientCommand;
use crate::protocol::messages::Track;
use crate::server::clock::ServerClock;
use crate::server::config::ServerConfig;
use crate::server::member::SessionMember;
use crate::server::queue::TrackQueue;
use crate::server::store::{Persister, SessionRecord};
use crate::server::timer::SynchronizedTimer;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Who may add songs to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyMode {
    /// Only the admin adds songs
    AdminControlled,
    /// Every member adds songs
    FreeForAll,
    /// Declared for clients but has no add-song behavior
    RoundRobin,
}

impl LobbyMode {
    /// Convert to protocol string
    pub fn as_str(&self) -> &'static str {
        match self {
            LobbyMode::AdminControlled => "admin_controlled",
            LobbyMode::FreeForAll => "free_for_all",
            LobbyMode::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for LobbyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LobbyMode {
    type Err = Error;

    /// Accepts the protocol strings and the legacy numeric codes 1..=3
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin_controlled" | "1" => Ok(LobbyMode::AdminControlled),
            "free_for_all" | "2" => Ok(LobbyMode::FreeForAll),
            "round_robin" | "3" => Ok(LobbyMode::RoundRobin),
            other => Err(Error::Protocol(format!("unknown lobby mode {:?}", other))),
        }
    }
}

/// Immutable session metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session id
    pub id: String,
    /// Display name
    pub name: String,
    /// Lobby mode
    pub mode: LobbyMode,
    /// Genre tag
    pub genre: String,
    /// Listed publicly
    pub public: bool,
    /// Name given by whoever created the session
    pub creator: Option<String>,
}

/// Scheduling constants for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Lead time added to every scheduled playback instant
    pub command_delay_millis: i64,
    /// How long before a track's end the next one is started
    pub track_end_lead_millis: i64,
}

impl SessionSettings {
    /// Take the scheduling values from the server configuration
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            command_delay_millis: config.command_delay_ms as i64,
            track_end_lead_millis: config.track_end_lead_ms as i64,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Routing-layer view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session metadata
    #[serde(flatten)]
    pub info: SessionInfo,
    /// Live state
    #[serde(flatten)]
    pub state: StateSnapshot,
    /// Number of joined members
    pub num_members: usize,
}

/// Outcome of counting skip votes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipTally {
    /// Strict majority reached
    pub passed: bool,
    /// Further votes needed to pass
    pub remaining: usize,
}

/// Strict majority of the current member count: `votes > members / 2`
pub fn skip_vote_tally(votes: usize, members: usize) -> SkipTally {
    let required = members / 2 + 1;
    SkipTally {
        passed: votes >= required,
        remaining: required.saturating_sub(votes),
    }
}

/// Everything the session processor consumes, in arrival order
pub enum SessionEvent {
    /// A member finished its handshake and wants in
    Join {
        /// The new member
        member: SessionMember,
        /// Admission result
        reply: oneshot::Sender<std::result::Result<(), StateError>>,
    },
    /// A member's connection closed
    Leave {
        /// Departing member
        name: String,
    },
    /// A decoded client command
    Command {
        /// Sending member
        from: String,
        /// What they asked for
        command: ClientCommand,
    },
    /// Posted by the track timer when the current track is about to end
    TrackEnded {
        /// Track generation the timer was armed for
        generation: u64,
    },
    /// Read-only state query for the routing layer
    Snapshot {
        /// Where to deliver the summary
        reply: oneshot::Sender<SessionSummary>,
    },
}

/// Cloneable front of a running session
///
/// Every interaction becomes a [`SessionEvent`] on the session's single
/// command channel.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    info: Arc<SessionInfo>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    /// Session metadata
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Admit a member after its handshake
    pub async fn join(&self, member: SessionMember) -> Result<()> {
        let (reply, admitted) = oneshot::channel();
        self.send(SessionEvent::Join { member, reply })?;
        admitted
            .await
            .map_err(|_| Error::Channel(format!("session {} stopped", self.info.id)))?
            .map_err(Error::from)
    }

    /// Remove a member whose connection closed
    pub fn leave(&self, name: &str) {
        let _ = self.send(SessionEvent::Leave {
            name: name.to_string(),
        });
    }

    /// Enqueue a client command
    pub fn submit(&self, from: &str, command: ClientCommand) -> Result<()> {
        self.send(SessionEvent::Command {
            from: from.to_string(),
            command,
        })
    }

    /// Current state, as seen by the processor
    pub async fn summary(&self) -> Result<SessionSummary> {
        let (reply, summary) = oneshot::channel();
        self.send(SessionEvent::Snapshot { reply })?;
        summary
            .await
            .map_err(|_| Error::Channel(format!("session {} stopped", self.info.id)))
    }

    fn send(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::Channel(format!("session {} stopped", self.info.id)))
    }
}

/// Session state, owned exclusively by its processor task
pub struct Session {
    info: Arc<SessionInfo>,
    settings: SessionSettings,
    clock: Arc<ServerClock>,
    persister: Persister,
    /// Weak so that a pending timer never keeps an abandoned session alive
    events: mpsc::WeakUnboundedSender<SessionEvent>,
    members: Vec<SessionMember>,
    admin: Option<String>,
    current_track: Option<Track>,
    queue: TrackQueue,
    skip_votes: HashSet<String>,
    timer: Option<SynchronizedTimer>,
    /// Bumped whenever the current track changes; stale timer events carry an old value
    generation: u64,
}

impl Session {
    /// Create a session and its command channel without starting the processor
    pub fn new(
        info: SessionInfo,
        settings: SessionSettings,
        clock: Arc<ServerClock>,
        persister: Persister,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = Arc::new(info);
        let session = Self {
            info: Arc::clone(&info),
            settings,
            clock,
            persister,
            events: tx.downgrade(),
            members: Vec::new(),
            admin: None,
            current_track: None,
            queue: TrackQueue::new(),
            skip_votes: HashSet::new(),
            timer: None,
            generation: 0,
        };
        let handle = SessionHandle { info, events: tx };
        (session, handle, rx)
    }

    /// Load persisted state. No timer is armed: a restored track is not playing.
    pub fn restore(&mut self, record: &SessionRecord) {
        self.current_track = record.current_track.clone();
        self.queue = record.queue.iter().cloned().collect();
        if let Some(admin) = &record.admin {
            log::debug!(
                "{}: not restoring admin {} until they rejoin",
                self.info.id,
                admin
            );
        }
    }

    /// Spawn the processor loop
    pub fn spawn(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::debug!("{}: processor started", self.info.id);
            while let Some(event) = events.recv().await {
                self.handle(event);
            }
            self.stop_timer();
            log::info!("{}: processor stopped", self.info.id);
        })
    }

    /// Persisted form of the current state
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.info.id.clone(),
            name: self.info.name.clone(),
            mode: self.info.mode,
            genre: self.info.genre.clone(),
            public: self.info.public,
            creator: self.info.creator.clone(),
            admin: self.admin.clone(),
            current_track: self.current_track.clone(),
            queue: self.queue.snapshot(),
        }
    }

    /// Apply one event
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Join { member, reply } => {
                let _ = reply.send(self.join(member));
            }
            SessionEvent::Leave { name } => self.leave(&name),
            SessionEvent::Command { from, command } => self.apply(&from, command),
            SessionEvent::TrackEnded { generation } => self.track_ended(generation),
            SessionEvent::Snapshot { reply } => {
                let _ = reply.send(self.summary());
            }
        }
    }

    /// Current state with the live track position
    pub fn snapshot(&self) -> StateSnapshot {
        let delay = self.settings.command_delay_millis;
        let (current_track, execute_at) = match (&self.current_track, &self.timer) {
            (Some(track), Some(timer)) => {
                let mut track = track.clone();
                track.position_millis = timer.elapsed_millis(delay);
                (Some(track), Some(self.clock.now_millis() + delay))
            }
            (track, _) => (track.clone(), None),
        };

        StateSnapshot {
            current_track,
            track_queue: self.queue.snapshot(),
            member_names: self.members.iter().map(|m| m.name.clone()).collect(),
            admin: self.admin.clone(),
            execute_at,
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            info: (*self.info).clone(),
            state: self.snapshot(),
            num_members: self.members.len(),
        }
    }

    fn join(&mut self, member: SessionMember) -> std::result::Result<(), StateError> {
        if self.member(&member.name).is_some() {
            return Err(StateError::NameTaken(member.name));
        }

        let name = member.name.clone();
        self.members.push(member);
        log::info!(
            "{}: {} joined, total members: {}",
            self.info.id,
            name,
            self.members.len()
        );

        self.broadcast(&Broadcast::text(format!("{} has joined the lobby.", name)));
        if self.admin.is_none() {
            self.set_admin(Some(name.clone()));
            self.broadcast(&Broadcast::text(format!("{} promoted to admin", name)));
        }
        self.broadcast_state();
        Ok(())
    }

    fn leave(&mut self, name: &str) {
        let Some(index) = self.members.iter().position(|m| m.name == name) else {
            log::debug!("{}: leave for unknown member {}", self.info.id, name);
            return;
        };
        self.members.remove(index);
        self.skip_votes.remove(name);
        log::info!(
            "{}: {} left, total members: {}",
            self.info.id,
            name,
            self.members.len()
        );

        self.broadcast(&Broadcast::text(format!("{} disconnected.", name)));

        if self.admin.as_deref() == Some(name) {
            match self.members.first().map(|m| m.name.clone()) {
                Some(next) => {
                    self.set_admin(Some(next.clone()));
                    self.broadcast(&Broadcast::text(format!("{} promoted to admin", next)));
                }
                None => {
                    log::info!("{}: lobby empty, clearing admin spot", self.info.id);
                    self.set_admin(None);
                }
            }
        }
        self.broadcast_state();
    }

    fn apply(&mut self, from: &str, command: ClientCommand) {
        if self.member(from).is_none() {
            log::debug!("{}: dropping command from non-member {}", self.info.id, from);
            return;
        }

        let result = match command {
            ClientCommand::AddSong(track) => self.add_song(from, track),
            ClientCommand::VoteSkip => self.vote_skip(from),
            ClientCommand::Promote(target) => self.promote(from, &target),
            ClientCommand::RequestState => {
                self.reply(from, &Broadcast::resync(&self.snapshot()));
                Ok(())
            }
            ClientCommand::Chat(text) => {
                self.broadcast_with_state(Broadcast::chat(from, text));
                Ok(())
            }
            ClientCommand::HandshakeAck(_) => Err(Error::Protocol(
                "handshake ack outside of a handshake".to_string(),
            )),
        };

        if let Err(e) = result {
            log::debug!("{}: command from {} rejected: {}", self.info.id, from, e);
            // Members see the bare rejection reason
            let text = match e {
                Error::State(reason) => reason.to_string(),
                other => other.to_string(),
            };
            self.reply(from, &Broadcast::text(text));
        }
    }

    fn add_song(&mut self, from: &str, mut track: Track) -> Result<()> {
        match self.info.mode {
            LobbyMode::FreeForAll => {}
            LobbyMode::AdminControlled => {
                if self.admin.as_deref() != Some(from) {
                    return Err(StateError::NotAdmin.into());
                }
            }
            LobbyMode::RoundRobin => {
                return Err(StateError::ModeUnsupported(self.info.mode.to_string()).into());
            }
        }

        track.chosen_by = Some(from.to_string());
        track.position_millis = 0;

        let msg = if self.current_track.is_none() {
            self.play_track(Some(track))
        } else {
            log::info!("{}: adding {} to queue", self.info.id, track.uri);
            self.queue.push(track);
            self.persist_queue();
            Broadcast::queued()
        };
        self.broadcast_with_state(msg);
        Ok(())
    }

    fn vote_skip(&mut self, from: &str) -> Result<()> {
        if self.current_track.is_none() {
            return Err(StateError::NothingPlaying.into());
        }
        if !self.skip_votes.insert(from.to_string()) {
            return Err(StateError::AlreadyVoted.into());
        }

        let tally = skip_vote_tally(self.skip_votes.len(), self.members.len());
        log::info!(
            "{}: skip vote from {} ({}/{} members)",
            self.info.id,
            from,
            self.skip_votes.len(),
            self.members.len()
        );

        if tally.passed {
            self.broadcast(&Broadcast::text(format!("{} voted to skip.", from)));
            self.broadcast(&Broadcast::text("Skip vote passed."));
            let msg = self.advance();
            self.broadcast_with_state(msg);
        } else {
            self.broadcast(&Broadcast::text(format!(
                "{} voted to skip ({} more needed).",
                from, tally.remaining
            )));
            self.broadcast_state();
        }
        Ok(())
    }

    fn promote(&mut self, from: &str, target: &str) -> Result<()> {
        if self.admin.as_deref() != Some(from) {
            return Err(StateError::NotAdmin.into());
        }
        if self.member(target).is_none() {
            return Err(StateError::NotMember(target.to_string()).into());
        }

        self.set_admin(Some(target.to_string()));
        self.broadcast_with_state(Broadcast::text(format!("{} promoted to admin", target)));
        Ok(())
    }

    fn track_ended(&mut self, generation: u64) {
        if generation != self.generation || self.timer.is_none() {
            log::debug!(
                "{}: ignoring stale track timer (generation {}, current {})",
                self.info.id,
                generation,
                self.generation
            );
            return;
        }

        // Already fired; nothing left to cancel
        self.timer = None;
        if let Some(track) = &self.current_track {
            log::info!("{}: timer ended for {}, starting next song", self.info.id, track.name);
        }
        let msg = self.advance();
        self.broadcast_with_state(msg);
    }

    /// Shared by timer expiry and a passed skip vote
    fn advance(&mut self) -> Broadcast {
        let next = match self.queue.pop() {
            Ok(track) => {
                self.persist_queue();
                Some(track)
            }
            Err(_) => None,
        };
        self.play_track(next)
    }

    fn play_track(&mut self, track: Option<Track>) -> Broadcast {
        self.stop_timer();
        self.generation += 1;
        self.skip_votes.clear();
        self.current_track = track.clone();
        self.persist_session();

        let Some(track) = track else {
            log::info!("{}: queue empty, pausing", self.info.id);
            self.broadcast(&Broadcast::text(
                "No tracks in queue, add a track to play it now.",
            ));
            return Broadcast::pause();
        };

        log::info!("{}: playing {} ({})", self.info.id, track.name, track.uri);
        self.broadcast(&Broadcast::text(format!(
            "Now playing: {} - {}",
            track.name, track.artist
        )));
        self.arm_timer(&track);
        Broadcast::play(track, self.clock.now_millis() + self.settings.command_delay_millis)
    }

    fn arm_timer(&mut self, track: &Track) {
        let generation = self.generation;
        let events = self.events.clone();
        let session_id = self.info.id.clone();
        let duration = track
            .duration_millis
            .saturating_sub(self.settings.track_end_lead_millis);

        let mut timer = SynchronizedTimer::new();
        timer.start(duration, move || match events.upgrade() {
            Some(tx) => {
                let _ = tx.send(SessionEvent::TrackEnded { generation });
            }
            None => log::debug!("{}: session closed before track end", session_id),
        });
        self.timer = Some(timer);
    }

    fn stop_timer(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
    }

    fn set_admin(&mut self, admin: Option<String>) {
        if let Some(name) = &admin {
            log::info!("{}: {} promoted to admin", self.info.id, name);
        }
        self.admin = admin;
        self.persist_session();
    }

    fn member(&self, name: &str) -> Option<&SessionMember> {
        self.members.iter().find(|m| m.name == name)
    }

    fn reply(&self, to: &str, msg: &Broadcast) {
        if let Some(member) = self.member(to) {
            member.send(msg);
        }
    }

    fn broadcast(&self, msg: &Broadcast) {
        for member in &self.members {
            if !member.send(msg) {
                log::warn!("{}: failed to send to {}", self.info.id, member.name);
            }
        }
    }

    fn broadcast_with_state(&self, msg: Broadcast) {
        self.broadcast(&msg.with_state(&self.snapshot()));
    }

    fn broadcast_state(&self) {
        self.broadcast_with_state(Broadcast::state());
    }

    fn persist_session(&self) {
        self.persister.persist_session(self.record());
    }

    fn persist_queue(&self) {
        self.persister
            .persist_queue(&self.info.id, self.queue.snapshot());
    }
}
