//! Integration tests for the session server.
//!
//! These tests run a real server on a loopback listener, drive it through
//! real TCP connections speaking the wire protocol, and back it with a
//! minimal in-process HTTP identity service.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use tempolink_server::config::ServerConfig;
use tempolink_server::server::Server;
use tempolink_shared::commands::AuthenticateResponse;
use tempolink_shared::{
    read_frame, write_frame, ClientCommand, JoinRoomResponse, Message, RoomState, ServerCommand,
    PROTOCOL_VERSION,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn token_a() -> String {
    "A".repeat(32)
}

fn token_b() -> String {
    "B".repeat(32)
}

/// Minimal HTTP identity service. Tokens starting with 'A' resolve to user
/// 100 (alice) and 'B' to user 101 (bob); `/chart/{id}` answers with chart
/// name "X"; `/record/{id}` maps record id to player `id / 10`.
async fn spawn_identity_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                loop {
                    match stream.read(&mut byte).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => request.push(byte[0]),
                    }
                    if request.ends_with(b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&request);
                let response = match route(&request) {
                    Some(json) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{json}",
                        json.len()
                    ),
                    None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\
                             Connection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

fn route(request: &str) -> Option<String> {
    let path = request.lines().next()?.split_whitespace().nth(1)?;
    if path == "/me" {
        let token = request.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("authorization") {
                value.trim().strip_prefix("Bearer ").map(str::to_string)
            } else {
                None
            }
        })?;
        let (id, name) = match token.chars().next()? {
            'A' => (100, "alice"),
            'B' => (101, "bob"),
            _ => return None,
        };
        Some(format!(r#"{{"id":{id},"name":"{name}","language":"en"}}"#))
    } else if let Some(id) = path.strip_prefix("/chart/") {
        Some(format!(r#"{{"id":{id},"name":"X"}}"#))
    } else if let Some(id) = path.strip_prefix("/record/") {
        let id: i32 = id.parse().ok()?;
        let player = id / 10;
        Some(format!(
            r#"{{"id":{id},"player":{player},"score":995023,"accuracy":0.985,"fullCombo":true}}"#
        ))
    } else {
        None
    }
}

async fn spawn_server() -> SocketAddr {
    let api = spawn_identity_service().await;
    let config = ServerConfig {
        api_url: format!("http://{api}"),
        ..ServerConfig::default()
    };
    let server = Server::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// A protocol-speaking test client over a real socket.
struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    buf: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_u8(PROTOCOL_VERSION).await.unwrap();
        let server_version = stream.read_u8().await.unwrap();
        assert_eq!(server_version, PROTOCOL_VERSION);
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, cmd: ClientCommand) {
        write_frame(&mut self.writer, &cmd.encode()).await.unwrap();
    }

    async fn recv(&mut self) -> ServerCommand {
        timeout(RECV_TIMEOUT, read_frame(&mut self.reader, &mut self.buf))
            .await
            .expect("timed out waiting for a server command")
            .unwrap();
        ServerCommand::decode(&self.buf).unwrap()
    }

    async fn authenticate(&mut self, token: &str) -> AuthenticateResponse {
        self.send(ClientCommand::Authenticate {
            token: token.to_string(),
        })
        .await;
        match self.recv().await {
            ServerCommand::Authenticate(Ok(response)) => response,
            other => panic!("expected successful authentication, got {other:?}"),
        }
    }

    async fn create_room(&mut self, id: &str) {
        self.send(ClientCommand::CreateRoom {
            id: id.parse().unwrap(),
        })
        .await;
        assert_eq!(
            self.recv().await,
            ServerCommand::Message(Message::CreateRoom { user: 100 })
        );
        assert_eq!(self.recv().await, ServerCommand::CreateRoom(Ok(())));
    }

    async fn join_room(&mut self, id: &str) -> JoinRoomResponse {
        self.send(ClientCommand::JoinRoom {
            id: id.parse().unwrap(),
            monitor: false,
        })
        .await;
        match self.recv().await {
            ServerCommand::JoinRoom(Ok(response)) => response,
            other => panic!("expected successful join, got {other:?}"),
        }
    }
}

/// PROTOCOL-LEVEL TESTS
mod protocol_tests {
    use super::*;

    /// A ping is answered before authentication.
    #[tokio::test]
    async fn ping_pong_pre_auth() {
        let addr = spawn_server().await;
        let mut client = TestClient::connect(addr).await;
        client.send(ClientCommand::Ping).await;
        assert_eq!(client.recv().await, ServerCommand::Pong);
    }

    /// Tokens of the wrong length are rejected locally.
    #[tokio::test]
    async fn short_token_is_rejected() {
        let addr = spawn_server().await;
        let mut client = TestClient::connect(addr).await;
        client
            .send(ClientCommand::Authenticate {
                token: "short".to_string(),
            })
            .await;
        match client.recv().await {
            ServerCommand::Authenticate(Err(error)) => {
                assert_eq!(error, "invalid token length");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    /// A declared frame length of 3 × 2²⁰ terminates the connection without
    /// the payload ever being read.
    #[tokio::test]
    async fn oversized_frame_drops_connection() {
        let addr = spawn_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_u8(PROTOCOL_VERSION).await.unwrap();
        let _ = stream.read_u8().await.unwrap();

        // varint(3 * 1024 * 1024), nothing behind it.
        stream.write_all(&[0x80, 0x80, 0xc0, 0x01]).await.unwrap();

        // The server closes; the next read reports EOF (or a reset) rather
        // than hanging for a payload that will never be accepted.
        let mut byte = [0u8; 1];
        let read = timeout(RECV_TIMEOUT, stream.read(&mut byte)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "connection still open");
    }

    /// A malformed command inside a valid frame is skipped, not fatal.
    #[tokio::test]
    async fn bad_tag_is_skipped() {
        let addr = spawn_server().await;
        let mut client = TestClient::connect(addr).await;
        write_frame(&mut client.writer, &[0xff]).await.unwrap();

        // The connection is still alive and serving.
        client.send(ClientCommand::Ping).await;
        assert_eq!(client.recv().await, ServerCommand::Pong);
    }
}

/// ROOM LIFECYCLE SCENARIOS
mod scenario_tests {
    use super::*;

    /// Scenario: create, join, chat. Both members observe the chat message
    /// and the sender gets an acknowledgement.
    #[tokio::test]
    async fn create_join_chat() {
        let addr = spawn_server().await;

        let mut alice = TestClient::connect(addr).await;
        let me = alice.authenticate(&token_a()).await;
        assert_eq!(me.me.id, 100);
        assert!(me.room.is_none());
        alice.create_room("ROOM1").await;

        let mut bob = TestClient::connect(addr).await;
        assert_eq!(bob.authenticate(&token_b()).await.me.id, 101);
        let joined = bob.join_room("ROOM1").await;
        assert_eq!(joined.state, RoomState::SelectChart(None));
        assert_eq!(joined.users.len(), 2);
        assert!(!joined.live);

        // Alice observes the join.
        assert!(matches!(
            alice.recv().await,
            ServerCommand::OnJoinRoom(user) if user.id == 101
        ));
        assert_eq!(
            alice.recv().await,
            ServerCommand::Message(Message::JoinRoom {
                user: 101,
                name: "bob".to_string()
            })
        );

        bob.send(ClientCommand::Chat {
            message: "hi".to_string(),
        })
        .await;
        let expected = ServerCommand::Message(Message::Chat {
            user: 101,
            content: "hi".to_string(),
        });
        assert_eq!(alice.recv().await, expected);
        assert_eq!(bob.recv().await, expected);
        assert_eq!(bob.recv().await, ServerCommand::Chat(Ok(())));
    }

    /// Scenario: chart selection, start, readiness, and a full game ending
    /// in one record and one abort.
    #[tokio::test]
    async fn two_player_game() {
        let addr = spawn_server().await;
        let mut alice = TestClient::connect(addr).await;
        alice.authenticate(&token_a()).await;
        alice.create_room("ROOM1").await;
        let mut bob = TestClient::connect(addr).await;
        bob.authenticate(&token_b()).await;
        bob.join_room("ROOM1").await;
        alice.recv().await; // OnJoinRoom
        alice.recv().await; // Message::JoinRoom

        // Chart selection reaches everyone, then the response.
        alice.send(ClientCommand::SelectChart { id: 42 }).await;
        let select = ServerCommand::Message(Message::SelectChart {
            user: 100,
            name: "X".to_string(),
            id: 42,
        });
        let state = ServerCommand::ChangeState(RoomState::SelectChart(Some(42)));
        assert_eq!(alice.recv().await, select);
        assert_eq!(alice.recv().await, state);
        assert_eq!(alice.recv().await, ServerCommand::SelectChart(Ok(())));
        assert_eq!(bob.recv().await, select);
        assert_eq!(bob.recv().await, state);

        alice.send(ClientCommand::RequestStart).await;
        let game_start = ServerCommand::Message(Message::GameStart { user: 100 });
        let waiting = ServerCommand::ChangeState(RoomState::WaitingForReady);
        assert_eq!(alice.recv().await, game_start);
        assert_eq!(alice.recv().await, waiting);
        assert_eq!(alice.recv().await, ServerCommand::RequestStart(Ok(())));
        assert_eq!(bob.recv().await, game_start);
        assert_eq!(bob.recv().await, waiting);

        // Bob readies up; the host is already waiting, so play begins.
        bob.send(ClientCommand::Ready).await;
        let ready = ServerCommand::Message(Message::Ready { user: 101 });
        let start_playing = ServerCommand::Message(Message::StartPlaying);
        let playing = ServerCommand::ChangeState(RoomState::Playing);
        assert_eq!(bob.recv().await, ready);
        assert_eq!(bob.recv().await, start_playing);
        assert_eq!(bob.recv().await, playing);
        assert_eq!(bob.recv().await, ServerCommand::Ready(Ok(())));
        assert_eq!(alice.recv().await, ready);
        assert_eq!(alice.recv().await, start_playing);
        assert_eq!(alice.recv().await, playing);

        // Alice reports a record (record 1000 belongs to player 100), bob
        // aborts; the game ends and the room returns to chart selection.
        alice.send(ClientCommand::Played { id: 1000 }).await;
        let played = ServerCommand::Message(Message::Played {
            user: 100,
            score: 995_023,
            accuracy: 0.985,
            full_combo: true,
        });
        assert_eq!(alice.recv().await, played);
        assert_eq!(alice.recv().await, ServerCommand::Played(Ok(())));
        assert_eq!(bob.recv().await, played);

        bob.send(ClientCommand::Abort).await;
        let abort = ServerCommand::Message(Message::Abort { user: 101 });
        let game_end = ServerCommand::Message(Message::GameEnd);
        let back = ServerCommand::ChangeState(RoomState::SelectChart(Some(42)));
        assert_eq!(bob.recv().await, abort);
        assert_eq!(bob.recv().await, game_end);
        assert_eq!(bob.recv().await, back);
        assert_eq!(bob.recv().await, ServerCommand::Abort(Ok(())));
        assert_eq!(alice.recv().await, abort);
        assert_eq!(alice.recv().await, game_end);
        assert_eq!(alice.recv().await, back);
    }

    /// Scenario: a lone player cannot start a game.
    #[tokio::test]
    async fn refuse_single_player_start() {
        let addr = spawn_server().await;
        let mut alice = TestClient::connect(addr).await;
        alice.authenticate(&token_a()).await;
        alice.create_room("ROOM1").await;

        alice.send(ClientCommand::SelectChart { id: 42 }).await;
        alice.recv().await; // Message::SelectChart
        alice.recv().await; // ChangeState
        assert_eq!(alice.recv().await, ServerCommand::SelectChart(Ok(())));

        alice.send(ClientCommand::RequestStart).await;
        match alice.recv().await {
            ServerCommand::RequestStart(Err(error)) => {
                assert!(error.starts_with("If no one"), "unexpected error: {error}");
            }
            other => panic!("expected a refusal, got {other:?}"),
        }
    }

    /// Scenario: the host leaves while the room waits for readiness. The
    /// remaining player is promoted and the wait set shrinks with the
    /// leaver.
    #[tokio::test]
    async fn host_leaves_mid_wait() {
        let addr = spawn_server().await;
        let mut alice = TestClient::connect(addr).await;
        alice.authenticate(&token_a()).await;
        alice.create_room("ROOM1").await;
        let mut bob = TestClient::connect(addr).await;
        bob.authenticate(&token_b()).await;
        bob.join_room("ROOM1").await;
        alice.recv().await; // OnJoinRoom
        alice.recv().await; // Message::JoinRoom

        alice.send(ClientCommand::SelectChart { id: 42 }).await;
        alice.recv().await;
        alice.recv().await;
        alice.recv().await;
        bob.recv().await;
        bob.recv().await;
        alice.send(ClientCommand::RequestStart).await;
        alice.recv().await;
        alice.recv().await;
        alice.recv().await;
        bob.recv().await;
        bob.recv().await;

        alice.send(ClientCommand::LeaveRoom).await;
        assert_eq!(alice.recv().await, ServerCommand::LeaveRoom(Ok(())));
        assert_eq!(
            bob.recv().await,
            ServerCommand::Message(Message::LeaveRoom {
                user: 100,
                name: "alice".to_string()
            })
        );
        assert_eq!(
            bob.recv().await,
            ServerCommand::Message(Message::NewHost { user: 101 })
        );
        assert_eq!(bob.recv().await, ServerCommand::ChangeHost(true));

        // Bob was not ready, so the room is still waiting; as the new host,
        // cancelling takes it back to chart selection.
        bob.send(ClientCommand::CancelReady).await;
        assert_eq!(
            bob.recv().await,
            ServerCommand::Message(Message::CancelGame { user: 101 })
        );
        assert_eq!(
            bob.recv().await,
            ServerCommand::ChangeState(RoomState::SelectChart(Some(42)))
        );
        assert_eq!(bob.recv().await, ServerCommand::CancelReady(Ok(())));
    }

    /// Scenario: a disconnect followed by a quick reconnect restores the
    /// same user in the same room, with a matching snapshot.
    #[tokio::test]
    async fn reconnect_resumes_room() {
        let addr = spawn_server().await;
        let mut alice = TestClient::connect(addr).await;
        alice.authenticate(&token_a()).await;
        alice.create_room("ROOM1").await;
        let mut bob = TestClient::connect(addr).await;
        bob.authenticate(&token_b()).await;
        bob.join_room("ROOM1").await;

        // Alice's socket dies without a LeaveRoom.
        drop(alice);
        // Give the server a moment to notice and start the grace period.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut alice = TestClient::connect(addr).await;
        let me = alice.authenticate(&token_a()).await;
        assert_eq!(me.me.id, 100);
        let room = me.room.expect("room membership must survive the flap");
        assert_eq!(room.id.as_str(), "ROOM1");
        assert!(room.is_host);
        assert!(!room.is_ready);
        assert_eq!(room.state, RoomState::SelectChart(None));
        assert_eq!(room.users.len(), 2);
        assert!(room.users.contains_key(&100));
        assert!(room.users.contains_key(&101));
    }
}
