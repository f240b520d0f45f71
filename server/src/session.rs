//! Per-connection session: the authentication gate and command dispatch.
//!
//! A session is owned by its socket tasks (see `connection`) and referenced
//! weakly from the [`User`] it authenticates as. Until authentication
//! succeeds only `Authenticate` is accepted; everything else is logged and
//! dropped. After authentication each command maps to a single room or
//! server operation, and every operation's outcome is reported back as a
//! response command; errors never terminate the connection.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use tempolink_shared::commands::AuthenticateResponse;
use tempolink_shared::{ClientCommand, JudgeEvent, ServerCommand, TouchFrame, TOKEN_LEN};

use crate::room::Room;
use crate::server::Server;
use crate::user::User;

pub struct Session {
    pub id: Uuid,
    /// Protocol version the peer announced in the handshake. Currently
    /// informational; behavioural divergence is deferred to future versions.
    pub version: u8,
    server: Arc<Server>,
    queue: mpsc::UnboundedSender<ServerCommand>,
    last_received: Mutex<Instant>,
    user: RwLock<Option<Arc<User>>>,
}

impl Session {
    pub fn new(
        server: Arc<Server>,
        version: u8,
        queue: mpsc::UnboundedSender<ServerCommand>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            version,
            server,
            queue,
            last_received: Mutex::new(Instant::now()),
            user: RwLock::new(None),
        })
    }

    /// Enqueues a command for the send loop. A closed queue means the
    /// connection is already going down; the command is silently dropped.
    pub fn send(&self, cmd: ServerCommand) {
        let _ = self.queue.send(cmd);
    }

    /// Records that a byte arrived from the peer.
    pub fn touch(&self) {
        *self.last_received.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_received.lock().unwrap().elapsed()
    }

    pub fn user(&self) -> Option<Arc<User>> {
        self.user.read().unwrap().clone()
    }

    pub async fn handle(self: &Arc<Self>, cmd: ClientCommand) {
        let Some(user) = self.user() else {
            match cmd {
                ClientCommand::Authenticate { token } => {
                    let result = self.authenticate(&token).await;
                    if let Err(error) = &result {
                        info!("session {} failed to authenticate: {error}", self.id);
                    }
                    self.send(ServerCommand::Authenticate(result));
                }
                other => {
                    warn!("session {} dropped pre-auth command {other:?}", self.id);
                }
            }
            return;
        };

        match cmd {
            ClientCommand::Ping => self.send(ServerCommand::Pong),
            ClientCommand::Authenticate { .. } => {
                self.send(ServerCommand::Authenticate(Err(
                    "already authenticated".to_string()
                )));
            }
            ClientCommand::Chat { message } => {
                let result = match room_of(&user) {
                    Ok(room) => room.chat(&user, message).await,
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::Chat(result));
            }
            ClientCommand::Touches { frames } => self.forward_touches(&user, frames).await,
            ClientCommand::Judges { judges } => self.forward_judges(&user, judges).await,
            ClientCommand::CreateRoom { id } => {
                let result = self.server.create_room(&user, id).await;
                self.send(ServerCommand::CreateRoom(result));
            }
            ClientCommand::JoinRoom { id, monitor } => {
                let result = self.server.join_room(&user, id, monitor).await;
                self.send(ServerCommand::JoinRoom(result));
            }
            ClientCommand::LeaveRoom => {
                let result = self.server.leave_room(&user).await;
                self.send(ServerCommand::LeaveRoom(result));
            }
            ClientCommand::LockRoom { lock } => {
                let result = match room_of(&user) {
                    Ok(room) => room.lock(&user, lock).await,
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::LockRoom(result));
            }
            ClientCommand::CycleRoom { cycle } => {
                let result = match room_of(&user) {
                    Ok(room) => room.set_cycle(&user, cycle).await,
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::CycleRoom(result));
            }
            ClientCommand::SelectChart { id } => {
                // The chart lookup happens before the room is locked.
                let result = match room_of(&user) {
                    Ok(room) => match self.server.identity.chart(id).await {
                        Ok(chart) => room.select_chart(&user, chart).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::SelectChart(result));
            }
            ClientCommand::RequestStart => {
                let result = match room_of(&user) {
                    Ok(room) => room.request_start(&user).await,
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::RequestStart(result));
            }
            ClientCommand::Ready => {
                let result = match room_of(&user) {
                    Ok(room) => room.ready(&user).await,
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::Ready(result));
            }
            ClientCommand::CancelReady => {
                let result = match room_of(&user) {
                    Ok(room) => room.cancel_ready(&user).await,
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::CancelReady(result));
            }
            ClientCommand::Played { id } => {
                // Fetch and hand over the record before the room is locked.
                let result = match room_of(&user) {
                    Ok(room) => match self.server.identity.record(id).await {
                        Ok(record) => room.played(&user, record).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::Played(result));
            }
            ClientCommand::Abort => {
                let result = match room_of(&user) {
                    Ok(room) => room.abort(&user).await,
                    Err(e) => Err(e),
                };
                self.send(ServerCommand::Abort(result));
            }
        }
    }

    async fn authenticate(self: &Arc<Self>, token: &str) -> Result<AuthenticateResponse, String> {
        // Tokens have a fixed length; anything else is rejected locally
        // without an upstream call.
        if token.chars().count() != TOKEN_LEN {
            return Err("invalid token length".to_string());
        }
        let profile = self.server.identity.me(token).await?;
        let user = self.server.find_or_create_user(profile);
        user.attach_session(self);
        *self.user.write().unwrap() = Some(user.clone());

        let room = match user.current_room() {
            Some(room) => Some(room.client_state(&user).await),
            None => None,
        };
        info!(
            "session {} authenticated as user {} ({})",
            self.id, user.id, user.name
        );
        Ok(AuthenticateResponse {
            me: user.info(),
            room,
        })
    }

    // Touches and Judges are fire-and-forget: no response command exists for
    // them, so nothing is sent back even on a missing room.

    async fn forward_touches(&self, user: &Arc<User>, frames: Vec<TouchFrame>) {
        let latest = frames.iter().fold(f32::NEG_INFINITY, |acc, f| acc.max(f.time));
        if !frames.is_empty() {
            user.advance_game_time(latest);
        }
        if let Some(room) = user.current_room() {
            room.broadcast_monitors(ServerCommand::Touches {
                player: user.id,
                frames,
            })
            .await;
        }
    }

    async fn forward_judges(&self, user: &Arc<User>, judges: Vec<JudgeEvent>) {
        let latest = judges.iter().fold(f32::NEG_INFINITY, |acc, j| acc.max(j.time));
        if !judges.is_empty() {
            user.advance_game_time(latest);
        }
        if let Some(room) = user.current_room() {
            room.broadcast_monitors(ServerCommand::Judges {
                player: user.id,
                judges,
            })
            .await;
        }
    }
}

fn room_of(user: &User) -> Result<Arc<Room>, String> {
    user.current_room()
        .ok_or_else(|| "not in a room".to_string())
}
