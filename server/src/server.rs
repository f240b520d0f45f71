//! Listening socket, global registries, and lost-connection handling.
//!
//! The server owns three concurrent registries (sessions, users, rooms) and
//! a lost-connection channel. Connection tasks report their session id on
//! that channel when any of their loops exit; a single drain task removes
//! the session and, when the user's *current* session is still the dead one,
//! starts the dangling grace period. The "still the dead one" check is what
//! keeps a quick reconnect from being cancelled by its predecessor's death.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use tempolink_shared::{JoinRoomResponse, RoomId};

use crate::config::ServerConfig;
use crate::connection;
use crate::identity::{IdentityClient, UserProfile};
use crate::room::Room;
use crate::session::Session;
use crate::user::User;
use crate::DANGLE_GRACE;

pub struct Server {
    pub config: ServerConfig,
    pub identity: IdentityClient,
    sessions: DashMap<Uuid, Arc<Session>>,
    users: DashMap<i32, Arc<User>>,
    rooms: DashMap<RoomId, Arc<Room>>,
    lost_tx: mpsc::UnboundedSender<Uuid>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> reqwest::Result<Arc<Self>> {
        let identity = IdentityClient::new(config.api_url.clone())?;
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            config,
            identity,
            sessions: DashMap::new(),
            users: DashMap::new(),
            rooms: DashMap::new(),
            lost_tx,
            lost_rx: Mutex::new(Some(lost_rx)),
        }))
    }

    /// Binds the configured address and serves until the listener fails.
    /// The IPv6 wildcard default accepts IPv4 clients too on platforms that
    /// dual-stack by default.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let ip: IpAddr = self.config.bind_ip.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid bind_ip {:?}: {e}", self.config.bind_ip),
            )
        })?;
        let listener = TcpListener::bind((ip, self.config.port)).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Split out from [`run`]
    /// so tests can bind port 0 themselves.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("listening on {}", listener.local_addr()?);

        if let Some(rx) = self.lost_rx.lock().unwrap().take() {
            let server = self.clone();
            tokio::spawn(async move { server.drain_lost(rx).await });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted connection from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                connection::handle_connection(server, stream, addr).await;
            });
        }
    }

    pub(crate) fn register_session(&self, session: &Arc<Session>) {
        self.sessions.insert(session.id, session.clone());
    }

    pub(crate) fn report_lost(&self, session_id: Uuid) {
        let _ = self.lost_tx.send(session_id);
    }

    async fn drain_lost(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(session_id) = rx.recv().await {
            let Some((_, session)) = self.sessions.remove(&session_id) else {
                continue;
            };
            if let Some(user) = session.user() {
                if user.session_is(&session) {
                    self.dangle(user).await;
                } else {
                    debug!(
                        "session {session_id} was already replaced by a reconnect, ignoring"
                    );
                }
            }
        }
    }

    /// Handles a lost connection for `user`. Mid-game the user leaves
    /// immediately; otherwise an eviction timer is armed that fires only if
    /// no reconnect bumps the dangle epoch within the grace period.
    pub async fn dangle(self: &Arc<Self>, user: Arc<User>) {
        if let Some(room) = user.current_room() {
            if room.is_playing().await {
                info!("user {} lost mid-game, evicting immediately", user.id);
                self.evict(&user).await;
                return;
            }
        }
        let epoch = user.bump_epoch();
        debug!("user {} dangling with epoch {epoch}", user.id);
        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DANGLE_GRACE).await;
            if user.epoch() == epoch {
                info!(
                    "user {} did not reconnect within {DANGLE_GRACE:?}, evicting",
                    user.id
                );
                server.evict(&user).await;
            }
        });
    }

    /// Removes the user from its room (possibly destroying it) and from the
    /// user registry.
    async fn evict(&self, user: &Arc<User>) {
        if let Some(room) = user.current_room() {
            self.remove_from_room(user, &room).await;
        }
        self.users.remove(&user.id);
    }

    async fn remove_from_room(&self, user: &Arc<User>, room: &Arc<Room>) {
        if room.leave(user).await {
            self.rooms.remove(&room.id);
            info!("room {} destroyed", room.id);
        }
    }

    /// Reconnects reuse the existing record; its session reference is
    /// swapped by the caller.
    pub(crate) fn find_or_create_user(&self, profile: UserProfile) -> Arc<User> {
        self.users
            .entry(profile.id)
            .or_insert_with(|| User::new(profile.id, profile.name, profile.language))
            .clone()
    }

    pub(crate) async fn create_room(&self, user: &Arc<User>, id: RoomId) -> Result<(), String> {
        if user.current_room().is_some() {
            return Err("you are already in a room".to_string());
        }
        match self.rooms.entry(id.clone()) {
            Entry::Occupied(_) => Err("a room with this id already exists".to_string()),
            Entry::Vacant(entry) => {
                let room = Room::new(
                    id.clone(),
                    user.clone(),
                    self.config.room_max_players,
                    self.config.cycle_voting,
                );
                user.set_room(room.clone());
                entry.insert(room);
                info!("user {} created room {id}", user.id);
                Ok(())
            }
        }
    }

    pub(crate) async fn join_room(
        &self,
        user: &Arc<User>,
        id: RoomId,
        monitor: bool,
    ) -> Result<JoinRoomResponse, String> {
        if user.current_room().is_some() {
            return Err("you are already in a room".to_string());
        }
        if monitor && !self.config.monitors.contains(&user.id) {
            return Err("you are not allowed to join as a monitor".to_string());
        }
        let room = self
            .rooms
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| "the room does not exist".to_string())?;
        let response = room.join(user, monitor).await?;
        user.set_room(room);
        Ok(response)
    }

    pub(crate) async fn leave_room(&self, user: &Arc<User>) -> Result<(), String> {
        let room = user
            .current_room()
            .ok_or_else(|| "not in a room".to_string())?;
        self.remove_from_room(user, &room).await;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn user_count(&self) -> usize {
        self.users.len()
    }

    #[cfg(test)]
    pub(crate) fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
