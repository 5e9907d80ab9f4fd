// ABOUTME: Durable session storage and the write-behind persister
// ABOUTME: In-memory and SQLite stores behind one trait; writes never block sessions

use crate::error::Error;
use crate::protocol::messages::Track;
use crate::server::session::LobbyMode;
use crate::Result;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Database file created inside the data directory
pub const DATABASE_FILE: &str = "syncsong.db";

/// Persisted form of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
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
    /// Admin at the time of the write (empty is valid)
    pub admin: Option<String>,
    /// Track playing at the time of the write
    pub current_track: Option<Track>,
    /// Pending tracks in play order
    pub queue: Vec<Track>,
}

/// Storage backend for sessions
///
/// A session write never touches the stored queue of an existing session;
/// the record's queue is only used when the session is first written.
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Write session metadata, admin and current track
    fn persist_session(&self, record: &SessionRecord) -> impl Future<Output = Result<()>> + Send;

    /// Replace the stored queue of a session
    fn persist_queue(
        &self,
        session_id: &str,
        queue: &[Track],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Read every stored session
    fn load_all(&self) -> impl Future<Output = Result<Vec<SessionRecord>>> + Send;
}

/// Volatile store, used when no data directory is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch one stored record
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.records.lock().get(session_id).cloned()
    }
}

impl SessionStore for MemoryStore {
    async fn persist_session(&self, record: &SessionRecord) -> Result<()> {
        let mut records = self.records.lock();
        let queue = records
            .get(&record.id)
            .map(|existing| existing.queue.clone())
            .unwrap_or_else(|| record.queue.clone());
        records.insert(
            record.id.clone(),
            SessionRecord {
                queue,
                ..record.clone()
            },
        );
        Ok(())
    }

    async fn persist_queue(&self, session_id: &str, queue: &[Track]) -> Result<()> {
        match self.records.lock().get_mut(session_id) {
            Some(record) => {
                record.queue = queue.to_vec();
                Ok(())
            }
            None => Err(Error::Persistence(format!("unknown session {}", session_id))),
        }
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

/// SQLite-backed store: `lobby`, `track` and `queue` tables
///
/// Tracks are shared rows keyed by URI. Queue rows reference them and are
/// ordered by `rank`; the chooser is kept per queue entry.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

type LobbyRow = (
    String,
    String,
    String,
    String,
    bool,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
);

type QueueRow = (String, String, String, i64, Option<String>);

impl SqliteStore {
    /// Open (and create if needed) `syncsong.db` under `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Persistence(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(DATABASE_FILE);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        log::info!("Connected to database: {}", path.display());
        Self::with_pool(pool).await
    }

    /// Private in-memory database, gone when the store is dropped
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the tables if missing
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lobby (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                mode TEXT NOT NULL,
                genre TEXT NOT NULL DEFAULT '',
                public INTEGER NOT NULL DEFAULT 0,
                creator TEXT,
                admin TEXT,
                current_uri TEXT,
                current_chosen_by TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS track (
                uri TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                artist TEXT NOT NULL,
                duration_millis INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                lobby_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                track_uri TEXT NOT NULL,
                chosen_by TEXT,
                PRIMARY KEY (lobby_id, rank)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn upsert_track(conn: &mut SqliteConnection, track: &Track) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO track (uri, name, artist, duration_millis)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                name = excluded.name,
                artist = excluded.artist,
                duration_millis = excluded.duration_millis
            "#,
        )
        .bind(&track.uri)
        .bind(&track.name)
        .bind(&track.artist)
        .bind(track.duration_millis)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn replace_queue(
        conn: &mut SqliteConnection,
        session_id: &str,
        queue: &[Track],
    ) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE lobby_id = ?")
            .bind(session_id)
            .execute(&mut *conn)
            .await?;

        for (rank, track) in queue.iter().enumerate() {
            Self::upsert_track(conn, track).await?;
            sqlx::query(
                "INSERT INTO queue (lobby_id, rank, track_uri, chosen_by) VALUES (?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(rank as i64)
            .bind(&track.uri)
            .bind(&track.chosen_by)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn load_queue(&self, session_id: &str) -> Result<Vec<Track>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT track.uri, track.name, track.artist, track.duration_millis, queue.chosen_by
            FROM queue
            JOIN track ON track.uri = queue.track_uri
            WHERE queue.lobby_id = ?
            ORDER BY queue.rank ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(uri, name, artist, duration, chosen_by)| Track {
                chosen_by,
                ..Track::new(uri, name, artist, duration)
            })
            .collect())
    }
}

impl SessionStore for SqliteStore {
    async fn persist_session(&self, record: &SessionRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM lobby WHERE id = ?")
            .bind(&record.id)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(track) = &record.current_track {
            Self::upsert_track(&mut *tx, track).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO lobby (id, name, mode, genre, public, creator, admin, current_uri, current_chosen_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                mode = excluded.mode,
                genre = excluded.genre,
                public = excluded.public,
                creator = excluded.creator,
                admin = excluded.admin,
                current_uri = excluded.current_uri,
                current_chosen_by = excluded.current_chosen_by
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.mode.as_str())
        .bind(&record.genre)
        .bind(record.public)
        .bind(&record.creator)
        .bind(&record.admin)
        .bind(record.current_track.as_ref().map(|t| t.uri.as_str()))
        .bind(record.current_track.as_ref().and_then(|t| t.chosen_by.as_deref()))
        .execute(&mut *tx)
        .await?;

        if existing.is_none() {
            Self::replace_queue(&mut *tx, &record.id, &record.queue).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn persist_queue(&self, session_id: &str, queue: &[Track]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM lobby WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_none() {
            return Err(Error::Persistence(format!("unknown session {}", session_id)));
        }

        Self::replace_queue(&mut *tx, session_id, queue).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, LobbyRow>(
            r#"
            SELECT lobby.id, lobby.name, lobby.mode, lobby.genre, lobby.public,
                   lobby.creator, lobby.admin, lobby.current_uri, lobby.current_chosen_by,
                   track.name, track.artist, track.duration_millis
            FROM lobby
            LEFT JOIN track ON track.uri = lobby.current_uri
            ORDER BY lobby.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, name, mode, genre, public, creator, admin, uri, chosen_by, title, artist, duration) in
            rows
        {
            let mode = match mode.parse::<LobbyMode>() {
                Ok(mode) => mode,
                Err(e) => {
                    log::warn!("Skipping stored session {}: {}", id, e);
                    continue;
                }
            };
            let current_track = uri.map(|uri| Track {
                chosen_by,
                ..Track::new(
                    uri,
                    title.unwrap_or_default(),
                    artist.unwrap_or_default(),
                    duration.unwrap_or_default(),
                )
            });
            let queue = self.load_queue(&id).await?;

            records.push(SessionRecord {
                id,
                name,
                mode,
                genre,
                public,
                creator,
                admin,
                current_track,
                queue,
            });
        }
        Ok(records)
    }
}

enum PersistJob {
    Session(SessionRecord),
    Queue { session_id: String, queue: Vec<Track> },
    Flush(oneshot::Sender<()>),
}

/// Write-behind front for a [`SessionStore`]
///
/// Jobs are applied one at a time in submission order on a dedicated task.
/// Failures are logged and dropped; in-memory state is never rolled back.
#[derive(Debug, Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl fmt::Debug for PersistJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistJob::Session(record) => write!(f, "session {}", record.id),
            PersistJob::Queue { session_id, queue } => {
                write!(f, "queue of {} ({} tracks)", session_id, queue.len())
            }
            PersistJob::Flush(_) => write!(f, "flush"),
        }
    }
}

impl Persister {
    /// Spawn the writer task for `store`
    pub fn spawn<S: SessionStore + 'static>(store: Arc<S>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let label = format!("{:?}", job);
                let outcome = match job {
                    PersistJob::Session(record) => store.persist_session(&record).await,
                    PersistJob::Queue { session_id, queue } => {
                        store.persist_queue(&session_id, &queue).await
                    }
                    PersistJob::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };

                match outcome {
                    Ok(()) => log::trace!("Persisted {}", label),
                    Err(e) => log::warn!("Failed to persist {}: {}", label, e),
                }
            }
            log::debug!("Persister stopped");
        });

        Self { tx }
    }

    /// Queue a session write
    pub fn persist_session(&self, record: SessionRecord) {
        self.submit(PersistJob::Session(record));
    }

    /// Queue a queue write
    pub fn persist_queue(&self, session_id: &str, queue: Vec<Track>) {
        self.submit(PersistJob::Queue {
            session_id: session_id.to_string(),
            queue,
        });
    }

    /// Wait until every job submitted before this call has been applied
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.submit(PersistJob::Flush(done));
        let _ = wait.await;
    }

    fn submit(&self, job: PersistJob) {
        if self.tx.send(job).is_err() {
            log::warn!("Persister is not running, dropping write");
        }
    }
}
