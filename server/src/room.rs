//! Room coordination: membership, the game state machine, host policy,
//! chart votes, and broadcast fan-out.
//!
//! All room state lives behind a single `tokio::sync::Mutex`. Every
//! operation locks, mutates, broadcasts, and unlocks; broadcasts enqueue to
//! unbounded per-connection channels, so fanning out under the lock never
//! blocks on remote I/O. Upstream HTTP lookups (charts, records) are done by
//! the session *before* calling into the room, so the lock is never held
//! across a suspension point that can stall.
//!
//! Operations return `Result<_, String>`; the error string flows verbatim
//! into the failed response command for the initiating client.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::info;
use rand::Rng;
use tokio::sync::Mutex;

use tempolink_shared::{
    ClientRoomState, JoinRoomResponse, Message, RoomId, RoomState, ServerCommand, UserInfo,
};

use crate::identity::{Chart, Record};
use crate::user::User;

/// Internal state variants with their per-state bookkeeping. Transitions
/// construct a fresh value rather than mutating fields in place, so stale
/// `wait`/`results` data cannot leak across states.
enum InternalState {
    SelectChart,
    WaitingForReady {
        /// Members (players and monitors) that have confirmed readiness.
        wait: HashSet<i32>,
    },
    Playing {
        results: HashMap<i32, Record>,
        aborted: HashSet<i32>,
    },
}

struct RoomInner {
    host: i32,
    state: InternalState,
    live: bool,
    locked: bool,
    cycle: bool,
    chart: Option<Chart>,
    /// Players in join order. The order is load-bearing: host cycling
    /// advances through it.
    players: Vec<Arc<User>>,
    monitors: Vec<Arc<User>>,
    /// Chart votes, only meaningful while cycling with voting enabled.
    votes: HashMap<i32, Chart>,
}

pub struct Room {
    pub id: RoomId,
    max_players: usize,
    /// Server-wide flag: rooms with cycling enabled use vote-based chart
    /// selection instead of plain host rotation.
    cycle_voting: bool,
    inner: Mutex<RoomInner>,
}

impl Room {
    /// Creates a room with `creator` as its host and sole player.
    pub fn new(id: RoomId, creator: Arc<User>, max_players: usize, cycle_voting: bool) -> Arc<Self> {
        creator.try_send(ServerCommand::Message(Message::CreateRoom { user: creator.id }));
        let inner = RoomInner {
            host: creator.id,
            state: InternalState::SelectChart,
            live: false,
            locked: false,
            cycle: false,
            chart: None,
            players: vec![creator],
            monitors: Vec::new(),
            votes: HashMap::new(),
        };
        Arc::new(Self {
            id,
            max_players,
            cycle_voting,
            inner: Mutex::new(inner),
        })
    }

    /// Builds the snapshot a reconnecting client needs to restore its UI.
    pub async fn client_state(&self, viewer: &User) -> ClientRoomState {
        let inner = self.inner.lock().await;
        let is_ready = match &inner.state {
            InternalState::WaitingForReady { wait } => wait.contains(&viewer.id),
            _ => false,
        };
        ClientRoomState {
            id: self.id.clone(),
            state: inner.public_state(),
            live: inner.live,
            locked: inner.locked,
            cycle: inner.cycle,
            is_host: inner.host == viewer.id,
            is_ready,
            users: inner.member_map(),
        }
    }

    /// Admits `user` as a player or monitor. The monitor allow-list is
    /// checked by the caller; everything else is checked here.
    pub async fn join(&self, user: &Arc<User>, monitor: bool) -> Result<JoinRoomResponse, String> {
        let mut inner = self.inner.lock().await;
        if inner.locked {
            return Err("the room is locked".to_string());
        }
        if !matches!(inner.state, InternalState::SelectChart) {
            return Err("the room has already started a game".to_string());
        }
        if !monitor && inner.players.len() >= self.max_players {
            return Err("the room is full".to_string());
        }

        user.set_monitor(monitor);
        inner.broadcast(ServerCommand::OnJoinRoom(user.info()));
        inner.broadcast_message(Message::JoinRoom {
            user: user.id,
            name: user.name.clone(),
        });
        if monitor {
            inner.monitors.push(user.clone());
            // Latches on the first monitor and never reverts.
            inner.live = true;
        } else {
            inner.players.push(user.clone());
        }
        info!(
            "user {} joined room {} (monitor: {monitor})",
            user.id, self.id
        );
        Ok(JoinRoomResponse {
            state: inner.public_state(),
            users: inner.member_infos(),
            live: inner.live,
        })
    }

    /// Removes `user` from the room. Returns `true` when the last player is
    /// gone and the room must be destroyed by the caller.
    ///
    /// The all-ready and all-done checks run unconditionally afterwards: if
    /// the leaver was the last member the room was waiting on, their leave
    /// completes the pending transition.
    pub async fn leave(&self, user: &Arc<User>) -> bool {
        let mut inner = self.inner.lock().await;
        inner.players.retain(|u| u.id != user.id);
        inner.monitors.retain(|u| u.id != user.id);
        inner.votes.remove(&user.id);
        match &mut inner.state {
            InternalState::WaitingForReady { wait } => {
                wait.remove(&user.id);
            }
            InternalState::Playing { results, aborted } => {
                results.remove(&user.id);
                aborted.remove(&user.id);
            }
            InternalState::SelectChart => {}
        }
        user.clear_room();
        inner.broadcast_message(Message::LeaveRoom {
            user: user.id,
            name: user.name.clone(),
        });
        info!("user {} left room {}", user.id, self.id);

        if inner.players.is_empty() {
            // Monitors cannot keep a room alive; release them with it.
            for monitor in &inner.monitors {
                monitor.clear_room();
            }
            inner.monitors.clear();
            return true;
        }

        if inner.host == user.id {
            let index = rand::thread_rng().gen_range(0..inner.players.len());
            let new_host = inner.players[index].clone();
            inner.host = new_host.id;
            inner.broadcast_message(Message::NewHost { user: new_host.id });
            new_host.try_send(ServerCommand::ChangeHost(true));
            info!("room {} host is now {}", self.id, new_host.id);
        }

        inner.check_all_ready();
        inner.check_all_done(self.cycle_voting);
        false
    }

    pub async fn lock(&self, user: &User, lock: bool) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.require_host(user)?;
        inner.locked = lock;
        inner.broadcast_message(Message::LockRoom { lock });
        Ok(())
    }

    pub async fn set_cycle(&self, user: &User, cycle: bool) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.require_host(user)?;
        inner.cycle = cycle;
        inner.broadcast_message(Message::CycleRoom { cycle });
        Ok(())
    }

    /// Sets the room's chart. In cycle+voting mode any player may call this
    /// and the selection doubles as that player's vote; otherwise only the
    /// host may select.
    pub async fn select_chart(&self, user: &User, chart: Chart) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, InternalState::SelectChart) {
            return Err("a chart can only be selected between games".to_string());
        }
        if inner.cycle && self.cycle_voting {
            if user.is_monitor() {
                return Err("monitors cannot select a chart".to_string());
            }
            inner.votes.insert(user.id, chart.clone());
        } else {
            inner.require_host(user)?;
        }
        inner.broadcast_message(Message::SelectChart {
            user: user.id,
            name: chart.name.clone(),
            id: chart.id,
        });
        inner.chart = Some(chart);
        inner.broadcast_state();
        Ok(())
    }

    /// Starts the ready phase. Requires the host, at least two players, and
    /// a selected chart. In cycle+voting mode a random vote becomes the
    /// chart and the pseudo-host grants are revoked first.
    pub async fn request_start(&self, user: &User) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.require_host(user)?;
        if !matches!(inner.state, InternalState::SelectChart) {
            return Err("the game has already started".to_string());
        }
        if inner.players.len() < 2 {
            return Err(
                "If no one else is in the room, the game cannot start".to_string(),
            );
        }
        if inner.cycle && self.cycle_voting && !inner.votes.is_empty() {
            let charts: Vec<Chart> = inner.votes.values().cloned().collect();
            let chosen = charts[rand::thread_rng().gen_range(0..charts.len())].clone();
            info!(
                "room {} picked chart {} from {} votes",
                self.id,
                chosen.id,
                charts.len()
            );
            inner.chart = Some(chosen);
            let host = inner.host;
            for player in &inner.players {
                if player.id != host {
                    player.try_send(ServerCommand::ChangeHost(false));
                }
            }
            inner.votes.clear();
        }
        if inner.chart.is_none() {
            return Err("no chart has been selected".to_string());
        }

        let host = inner.host;
        inner.state = InternalState::WaitingForReady {
            wait: HashSet::from([host]),
        };
        inner.broadcast_message(Message::GameStart { user: host });
        inner.broadcast_state();
        inner.check_all_ready();
        Ok(())
    }

    pub async fn ready(&self, user: &User) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        match &mut inner.state {
            InternalState::WaitingForReady { wait } => {
                wait.insert(user.id);
            }
            _ => return Err("the room is not waiting for ready".to_string()),
        }
        inner.broadcast_message(Message::Ready { user: user.id });
        inner.check_all_ready();
        Ok(())
    }

    /// A non-host retracts their readiness; the host aborts the countdown
    /// entirely, returning the room to chart selection.
    pub async fn cancel_ready(&self, user: &User) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, InternalState::WaitingForReady { .. }) {
            return Err("the room is not waiting for ready".to_string());
        }
        if inner.host == user.id {
            inner.broadcast_message(Message::CancelGame { user: user.id });
            inner.state = InternalState::SelectChart;
            if inner.cycle && self.cycle_voting {
                // Back to voting: everyone regains selection rights.
                inner.chart = None;
                let host = inner.host;
                for player in &inner.players {
                    if player.id != host {
                        player.try_send(ServerCommand::ChangeHost(true));
                    }
                }
            }
            inner.broadcast_state();
        } else {
            if let InternalState::WaitingForReady { wait } = &mut inner.state {
                wait.remove(&user.id);
            }
            inner.broadcast_message(Message::CancelReady { user: user.id });
        }
        Ok(())
    }

    /// Registers a fetched and ownership-verified record for `user`.
    pub async fn played(&self, user: &User, record: Record) -> Result<(), String> {
        if record.player != user.id {
            return Err("the record belongs to another player".to_string());
        }
        let mut inner = self.inner.lock().await;
        match &mut inner.state {
            InternalState::Playing { results, aborted } => {
                if aborted.contains(&user.id) {
                    return Err("you have already aborted".to_string());
                }
                results.insert(user.id, record.clone());
            }
            _ => return Err("the game is not in progress".to_string()),
        }
        inner.broadcast_message(Message::Played {
            user: user.id,
            score: record.score,
            accuracy: record.accuracy,
            full_combo: record.full_combo,
        });
        inner.check_all_done(self.cycle_voting);
        Ok(())
    }

    pub async fn abort(&self, user: &User) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        match &mut inner.state {
            InternalState::Playing { results, aborted } => {
                if results.contains_key(&user.id) {
                    return Err("you have already submitted a record".to_string());
                }
                aborted.insert(user.id);
            }
            _ => return Err("the game is not in progress".to_string()),
        }
        inner.broadcast_message(Message::Abort { user: user.id });
        inner.check_all_done(self.cycle_voting);
        Ok(())
    }

    pub async fn chat(&self, user: &User, content: String) -> Result<(), String> {
        let inner = self.inner.lock().await;
        inner.broadcast_message(Message::Chat {
            user: user.id,
            content,
        });
        Ok(())
    }

    /// Mirrors gameplay telemetry to monitors only.
    pub async fn broadcast_monitors(&self, cmd: ServerCommand) {
        let inner = self.inner.lock().await;
        for monitor in &inner.monitors {
            monitor.try_send(cmd.clone());
        }
    }

    pub async fn is_playing(&self) -> bool {
        matches!(
            self.inner.lock().await.state,
            InternalState::Playing { .. }
        )
    }
}

impl RoomInner {
    fn public_state(&self) -> RoomState {
        match &self.state {
            InternalState::SelectChart => {
                RoomState::SelectChart(self.chart.as_ref().map(|c| c.id))
            }
            InternalState::WaitingForReady { .. } => RoomState::WaitingForReady,
            InternalState::Playing { .. } => RoomState::Playing,
        }
    }

    fn require_host(&self, user: &User) -> Result<(), String> {
        if self.host == user.id {
            Ok(())
        } else {
            Err("only the host can do that".to_string())
        }
    }

    fn members(&self) -> impl Iterator<Item = &Arc<User>> {
        self.players.iter().chain(self.monitors.iter())
    }

    fn member_infos(&self) -> Vec<UserInfo> {
        self.members().map(|u| u.info()).collect()
    }

    fn member_map(&self) -> HashMap<i32, UserInfo> {
        self.members().map(|u| (u.id, u.info())).collect()
    }

    /// Fans one command out to players and monitors alike. Recipients whose
    /// session is gone are skipped silently.
    fn broadcast(&self, cmd: ServerCommand) {
        for user in self.members() {
            user.try_send(cmd.clone());
        }
    }

    fn broadcast_message(&self, message: Message) {
        self.broadcast(ServerCommand::Message(message));
    }

    fn broadcast_state(&self) {
        self.broadcast(ServerCommand::ChangeState(self.public_state()));
    }

    /// Starts gameplay once every member, monitors included, is in `wait`.
    fn check_all_ready(&mut self) {
        let InternalState::WaitingForReady { wait } = &self.state else {
            return;
        };
        if self.players.is_empty() || !self.members().all(|u| wait.contains(&u.id)) {
            return;
        }
        self.broadcast_message(Message::StartPlaying);
        for player in &self.players {
            player.reset_game_time();
        }
        self.state = InternalState::Playing {
            results: HashMap::new(),
            aborted: HashSet::new(),
        };
        self.broadcast_state();
    }

    /// Ends the game once every player has reported a record or aborted,
    /// then applies the cycling policy.
    fn check_all_done(&mut self, cycle_voting: bool) {
        let InternalState::Playing { results, aborted } = &self.state else {
            return;
        };
        if self.players.is_empty() {
            return;
        }
        let all_accounted = self
            .players
            .iter()
            .all(|p| results.contains_key(&p.id) || aborted.contains(&p.id));
        if !all_accounted {
            return;
        }

        self.broadcast_message(Message::GameEnd);
        self.state = InternalState::SelectChart;
        if self.cycle {
            if cycle_voting {
                // Open the next round's vote to everyone.
                self.chart = None;
                self.votes.clear();
                let host = self.host;
                for player in &self.players {
                    if player.id != host {
                        player.try_send(ServerCommand::ChangeHost(true));
                    }
                }
            } else if let Some(pos) = self.players.iter().position(|p| p.id == self.host) {
                let next = self.players[(pos + 1) % self.players.len()].clone();
                if next.id != self.host {
                    self.players[pos].try_send(ServerCommand::ChangeHost(false));
                    next.try_send(ServerCommand::ChangeHost(true));
                    self.host = next.id;
                    self.broadcast_message(Message::NewHost { user: next.id });
                }
            }
        }
        self.broadcast_state();
    }
}
