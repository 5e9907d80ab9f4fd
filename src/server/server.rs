// ABOUTME: Main syncsong server implementation
// ABOUTME: Lobby HTTP routes, WebSocket join endpoint and startup restore

use crate::server::client_handler::handle_client;
use crate::server::clock::ServerClock;
use crate::server::config::ServerConfig;
use crate::server::registry::SessionRegistry;
use crate::server::session::{LobbyMode, SessionSettings, SessionSummary};
use crate::server::store::{MemoryStore, Persister, SessionStore, SqliteStore};
use axum::{
    extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Session registry
    pub registry: SessionRegistry,
    /// Server clock
    pub clock: Arc<ServerClock>,
}

/// SyncSong server
pub struct SyncSongServer {
    /// Server configuration
    config: Arc<ServerConfig>,
    /// Server clock
    clock: Arc<ServerClock>,
}

impl SyncSongServer {
    /// Create a new server with default configuration
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a new server with custom configuration
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            clock: Arc::new(ServerClock::new()),
        }
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open storage, restore persisted sessions and build the shared state
    ///
    /// With a data directory sessions go to SQLite, otherwise they live in memory.
    pub async fn start(&self) -> crate::Result<AppState> {
        match &self.config.data_dir {
            Some(dir) => self.start_with(Arc::new(SqliteStore::open(dir).await?)).await,
            None => self.start_with(Arc::new(MemoryStore::new())).await,
        }
    }

    /// Build the shared state over a specific storage backend
    pub async fn start_with<S: SessionStore + 'static>(
        &self,
        store: Arc<S>,
    ) -> crate::Result<AppState> {
        let registry = SessionRegistry::new(
            SessionSettings::from_config(&self.config),
            Arc::clone(&self.clock),
            Persister::spawn(Arc::clone(&store)),
        );

        match store.load_all().await {
            Ok(records) => {
                let restored = registry.restore(records);
                log::info!("Restored {} sessions from storage", restored);
            }
            Err(e) => log::error!("Failed to load stored sessions: {}", e),
        }

        Ok(AppState {
            config: Arc::clone(&self.config),
            registry,
            clock: Arc::clone(&self.clock),
        })
    }

    /// Run the server until Ctrl-C
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let state = self.start().await?;
        let app = router(state);

        // Bind and serve
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("SyncSong server listening on {}", self.config.bind_addr);

        // Setup graceful shutdown
        let shutdown_signal = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            log::info!("Received shutdown signal");
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        log::info!("Server shutdown complete");
        Ok(())
    }
}

impl Default for SyncSongServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the HTTP router over shared state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/lobbies", get(list_lobbies))
        .route("/lobbies/create", post(create_lobby))
        .route("/lobbies/{id}", get(get_lobby))
        .route("/lobbies/{id}/join", get(join_lobby))
        .with_state(state)
}

/// Form body for lobby creation
#[derive(Debug, Deserialize)]
struct CreateLobbyForm {
    name: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    genre: String,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    admin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    username: String,
}

async fn list_lobbies(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    let mut summaries = Vec::new();
    for handle in state.registry.handles() {
        match handle.summary().await {
            Ok(summary) => summaries.push(summary),
            Err(e) => log::warn!("Skipping session {}: {}", handle.id(), e),
        }
    }
    Json(summaries)
}

async fn get_lobby(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(handle) = state.registry.lookup(&id) else {
        return (StatusCode::NOT_FOUND, format!("Lobby {} does not exist", id)).into_response();
    };
    match handle.summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn create_lobby(State(state): State<AppState>, Form(form): Form<CreateLobbyForm>) -> Response {
    let mode = match form.mode.as_deref() {
        Some(mode) => match mode.parse::<LobbyMode>() {
            Ok(mode) => mode,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        },
        None => LobbyMode::AdminControlled,
    };

    let id = state.registry.create_session(
        form.name,
        mode,
        form.genre,
        form.public,
        form.admin.filter(|a| !a.is_empty()),
    );
    (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
}

/// WebSocket upgrade handler
async fn join_lobby(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<JoinParams>,
) -> Response {
    if params.username.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "username must not be empty").into_response();
    }

    let Some(session) = state.registry.lookup(&id) else {
        log::info!("Join for unknown lobby {}", id);
        return ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: close_code::UNSUPPORTED,
                    reason: "Lobby does not exist".into(),
                })))
                .await;
        });
    };

    log::info!("{}: join request from {}", id, params.username);
    ws.on_upgrade(move |socket| {
        handle_client(socket, session, params.username, state.clock, state.config)
    })
}
