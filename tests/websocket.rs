use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use syncsong::protocol::{ClientCommand, ServerTag};
use syncsong::server::{router, ServerConfig, SyncSongServer};
use syncsong::{Track, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Simulated client clock skew
const CLIENT_SKEW_MS: i64 = 250;

async fn spawn_server() -> SocketAddr {
    spawn_server_with(ServerConfig::default()).await
}

async fn spawn_server_with(config: ServerConfig) -> SocketAddr {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = config.handshake_timeout_ms(2_000);
    let state = SyncSongServer::with_config(config)
        .start()
        .await
        .expect("server state");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

fn wall_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn http(addr: SocketAddr, request: String) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn create_lobby(addr: SocketAddr, form: &str) -> String {
    let request = format!(
        "POST /lobbies/create HTTP/1.1\r\nHost: {}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        addr,
        form.len(),
        form
    );
    let (status, body) = http(addr, request).await;
    assert_eq!(status, 201, "body: {}", body);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    json["id"].as_str().unwrap().to_string()
}

async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    http(addr, request).await
}

async fn recv(ws: &mut Client) -> WireMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return WireMessage::from_json(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Client, command: ClientCommand) {
    let json = command.encode().to_json().unwrap();
    ws.send(Message::Text(json)).await.unwrap();
}

/// Answer probes as a client whose clock runs ahead until the zero probe
async fn answer_handshake(ws: &mut Client) -> usize {
    let mut rounds = 0;
    loop {
        let probe = recv(ws).await;
        assert_eq!(probe.command, ServerTag::Handshake.code());
        let ts = probe.timestamp_millis.unwrap();
        if ts == 0 {
            return rounds;
        }
        rounds += 1;
        send(ws, ClientCommand::HandshakeAck(ts + CLIENT_SKEW_MS)).await;
    }
}

async fn join(addr: SocketAddr, lobby: &str, username: &str) -> Client {
    let url = format!("ws://{}/lobbies/{}/join?username={}", addr, lobby, username);
    let (ws, _) = connect_async(url).await.expect("websocket connect");
    ws
}

#[tokio::test]
async fn test_lobby_routes() {
    let addr = spawn_server().await;
    let id = create_lobby(addr, "name=Friday&mode=free_for_all&genre=jazz&public=true").await;
    assert_eq!(id.len(), 4);
    assert!(id.chars().all(|c| c.is_ascii_uppercase()));

    let (status, body) = get(addr, &format!("/lobbies/{}", id)).await;
    assert_eq!(status, 200);
    let lobby: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(lobby["name"], "Friday");
    assert_eq!(lobby["mode"], "free_for_all");
    assert_eq!(lobby["numMembers"], 0);

    let (status, body) = get(addr, "/lobbies").await;
    assert_eq!(status, 200);
    let lobbies: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
    assert_eq!(lobbies.len(), 1);

    let (status, _) = get(addr, "/lobbies/ZZZZZ").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_handshake_then_add_song() {
    let addr = spawn_server().await;
    let id = create_lobby(addr, "name=Party&mode=admin_controlled").await;

    let mut ws = join(addr, &id, "alice").await;
    assert_eq!(answer_handshake(&mut ws).await, 5);

    // Join announcements end with a state broadcast naming alice as admin
    loop {
        let msg = recv(&mut ws).await;
        if msg.member_names.is_some() {
            assert_eq!(msg.admin.as_deref(), Some("alice"));
            break;
        }
    }

    let before = wall_millis();
    send(
        &mut ws,
        ClientCommand::AddSong(Track::new("spotify:track:1", "One", "Band", 200_000)),
    )
    .await;

    let play = loop {
        let msg = recv(&mut ws).await;
        if msg.command == ServerTag::Play.code() {
            break msg;
        }
    };
    let after = wall_millis();
    let at = play.timestamp_millis.unwrap();
    let expected_low = before + 500 + CLIENT_SKEW_MS - 100;
    let expected_high = after + 500 + CLIENT_SKEW_MS + 100;
    assert!(
        at >= expected_low && at <= expected_high,
        "execute-at {} outside [{}, {}]",
        at,
        expected_low,
        expected_high
    );
    assert_eq!(play.track.unwrap().chosen_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_unknown_lobby_is_closed() {
    let addr = spawn_server().await;
    let mut ws = join(addr, "NOPE", "alice").await;

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Unsupported);
            assert_eq!(close.reason, "Lobby does not exist");
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_non_ack_during_handshake_rejects_join() {
    let addr = spawn_server().await;
    let id = create_lobby(addr, "name=Strict&mode=free_for_all").await;
    let mut ws = join(addr, &id, "mallory").await;

    let probe = recv(&mut ws).await;
    assert_eq!(probe.command, ServerTag::Handshake.code());
    send(&mut ws, ClientCommand::VoteSkip).await;

    // Terminating probe, then the failure text
    let end = recv(&mut ws).await;
    assert_eq!(end.timestamp_millis, Some(0));
    let failure = recv(&mut ws).await;
    assert!(failure.user_text.unwrap().contains("handshake failed"));

    let (_, body) = get(addr, &format!("/lobbies/{}", id)).await;
    let lobby: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(lobby["numMembers"], 0);
}

#[tokio::test]
async fn test_lobbies_survive_restart() {
    let dir = std::env::temp_dir().join(format!("syncsong-restart-{}", uuid::Uuid::new_v4()));
    let addr = spawn_server_with(ServerConfig::default().data_dir(&dir)).await;
    let id = create_lobby(addr, "name=Durable&mode=free_for_all&genre=ska").await;

    // Writes land behind the request, so give the persister a moment
    let mut restored = None;
    for _ in 0..50 {
        let state = SyncSongServer::with_config(ServerConfig::default().data_dir(&dir))
            .start()
            .await
            .expect("restart");
        if let Some(handle) = state.registry.lookup(&id) {
            restored = Some(handle);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let summary = restored.expect("lobby restored").summary().await.unwrap();
    assert_eq!(summary.info.name, "Durable");
    assert_eq!(summary.num_members, 0);
    let _ = std::fs::remove_dir_all(dir);
}
