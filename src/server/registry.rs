// ABOUTME: Session registry owned by the server
// ABOUTME: Creates, looks up, lists and restores running sessions by id

use crate::server::clock::ServerClock;
use crate::server::session::{LobbyMode, Session, SessionHandle, SessionInfo, SessionSettings};
use crate::server::store::{Persister, SessionRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Unique session identifier
pub type SessionId = String;

/// Length of generated session ids
const ID_LENGTH: usize = 4;

/// Manages all sessions of this process
///
/// Created once at startup and shared by the HTTP handlers. Each entry is a
/// handle to a running session processor.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    /// Map of session_id to session
    sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
    settings: SessionSettings,
    clock: Arc<ServerClock>,
    persister: Persister,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(settings: SessionSettings, clock: Arc<ServerClock>, persister: Persister) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings,
            clock,
            persister,
        }
    }

    /// Create and start a new session, returning its id
    ///
    /// `admin` is recorded as the creator; the live admin role goes to the
    /// first member that joins.
    pub fn create_session(
        &self,
        name: impl Into<String>,
        mode: LobbyMode,
        genre: impl Into<String>,
        public: bool,
        admin: Option<String>,
    ) -> SessionId {
        let mut sessions = self.sessions.write();
        let mut id = generate_id(ID_LENGTH);
        while sessions.contains_key(&id) {
            id = generate_id(ID_LENGTH);
        }

        let info = SessionInfo {
            id: id.clone(),
            name: name.into(),
            mode,
            genre: genre.into(),
            public,
            creator: admin,
        };
        log::info!(
            "Creating session {} ({:?}, mode {}, genre {:?})",
            id,
            info.name,
            info.mode,
            info.genre
        );

        let (session, handle, events) =
            Session::new(info, self.settings, Arc::clone(&self.clock), self.persister.clone());
        self.persister.persist_session(session.record());
        session.spawn(events);

        sessions.insert(id.clone(), handle);
        id
    }

    /// Rebuild sessions from stored records; returns how many were started
    pub fn restore(&self, records: Vec<SessionRecord>) -> usize {
        let mut sessions = self.sessions.write();
        let mut restored = 0;

        for record in records {
            if sessions.contains_key(&record.id) {
                log::warn!("Session {} already running, skipping restore", record.id);
                continue;
            }

            let info = SessionInfo {
                id: record.id.clone(),
                name: record.name.clone(),
                mode: record.mode,
                genre: record.genre.clone(),
                public: record.public,
                creator: record.creator.clone(),
            };
            let (mut session, handle, events) =
                Session::new(info, self.settings, Arc::clone(&self.clock), self.persister.clone());
            session.restore(&record);
            session.spawn(events);

            log::info!(
                "Restored session {} ({} queued tracks)",
                record.id,
                record.queue.len()
            );
            sessions.insert(record.id, handle);
            restored += 1;
        }
        restored
    }

    /// Look up a running session
    pub fn lookup(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Drop a session; its processor stops once the last connection goes
    pub fn remove(&self, session_id: &str) -> Option<SessionHandle> {
        let handle = self.sessions.write().remove(session_id);
        if handle.is_some() {
            log::info!("Session {} removed, total sessions: {}", session_id, self.session_count());
        }
        handle
    }

    /// Get the number of sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Handles of every session
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }
}

/// Random id of uppercase ASCII letters
fn generate_id(length: usize) -> SessionId {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(length)
        .map(|b| (b'A' + b % 26) as char)
        .collect()
}
