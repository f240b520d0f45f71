//! Identity-keyed presence records.
//!
//! A [`User`] outlives any single connection: it is created on first
//! successful authentication and binds the *current* session (replaceable
//! across reconnects) to at most one room. The session edge is a `Weak`
//! reference: the session is owned by its socket and may die at any time,
//! at which point sends silently degrade to no-ops.
//!
//! ## Dangling
//!
//! When a connection is lost outside gameplay the user is not evicted
//! immediately. Instead the server bumps the user's *dangle epoch*, captures
//! the new value, and arms a grace timer. When the timer fires it compares
//! the captured epoch against the current one: a successful reconnect has
//! bumped the epoch again, so the stale timer does nothing. This turns
//! momentary socket flaps into UI-invisible events without allowing
//! indefinite ghost presence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tempolink_shared::{ServerCommand, UserInfo};

use crate::room::Room;
use crate::session::Session;

pub struct User {
    pub id: i32,
    pub name: String,
    pub language: String,
    monitor: AtomicBool,
    session: RwLock<Weak<Session>>,
    room: Mutex<Option<Arc<Room>>>,
    game_time: Mutex<f32>,
    dangle_epoch: AtomicU64,
}

impl User {
    pub fn new(id: i32, name: String, language: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            language,
            monitor: AtomicBool::new(false),
            session: RwLock::new(Weak::new()),
            room: Mutex::new(None),
            game_time: Mutex::new(f32::NEG_INFINITY),
            dangle_epoch: AtomicU64::new(0),
        })
    }

    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            name: self.name.clone(),
            monitor: self.is_monitor(),
        }
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor.load(Ordering::SeqCst)
    }

    pub fn set_monitor(&self, monitor: bool) {
        self.monitor.store(monitor, Ordering::SeqCst);
    }

    /// Installs `session` as the user's active session and bumps the dangle
    /// epoch, invalidating any pending eviction timer.
    pub fn attach_session(&self, session: &Arc<Session>) {
        *self.session.write().unwrap() = Arc::downgrade(session);
        self.bump_epoch();
    }

    /// Whether `session` is still the user's active session. The lost-
    /// connection drain uses this to avoid cancelling a reconnect that has
    /// already replaced the dead session.
    pub fn session_is(&self, session: &Arc<Session>) -> bool {
        self.session
            .read()
            .unwrap()
            .upgrade()
            .is_some_and(|current| Arc::ptr_eq(&current, session))
    }

    /// Enqueues a command on the user's connection, if it still has one.
    pub fn try_send(&self, cmd: ServerCommand) {
        if let Some(session) = self.session.read().unwrap().upgrade() {
            session.send(cmd);
        }
    }

    pub fn current_room(&self) -> Option<Arc<Room>> {
        self.room.lock().unwrap().clone()
    }

    pub fn set_room(&self, room: Arc<Room>) {
        *self.room.lock().unwrap() = Some(room);
    }

    pub fn clear_room(&self) {
        *self.room.lock().unwrap() = None;
        self.set_monitor(false);
    }

    pub fn game_time(&self) -> f32 {
        *self.game_time.lock().unwrap()
    }

    /// Advances the user's game time; telemetry batches may arrive out of
    /// order, so the clock only moves forward.
    pub fn advance_game_time(&self, time: f32) {
        let mut current = self.game_time.lock().unwrap();
        if time > *current {
            *current = time;
        }
    }

    pub fn reset_game_time(&self) {
        *self.game_time.lock().unwrap() = f32::NEG_INFINITY;
    }

    pub fn epoch(&self) -> u64 {
        self.dangle_epoch.load(Ordering::SeqCst)
    }

    /// Advances the dangle epoch and returns the new value.
    pub fn bump_epoch(&self) -> u64 {
        self.dangle_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_bump_invalidates_captured_value() {
        let user = User::new(100, "alice".into(), "en".into());
        let captured = user.bump_epoch();
        assert_eq!(user.epoch(), captured);

        // A reconnect bumps again; the captured value is now stale.
        user.bump_epoch();
        assert_ne!(user.epoch(), captured);
    }

    #[test]
    fn game_time_only_moves_forward() {
        let user = User::new(100, "alice".into(), "en".into());
        assert_eq!(user.game_time(), f32::NEG_INFINITY);

        user.advance_game_time(3.5);
        user.advance_game_time(1.0);
        assert_eq!(user.game_time(), 3.5);

        user.reset_game_time();
        assert_eq!(user.game_time(), f32::NEG_INFINITY);
    }

    #[test]
    fn send_without_session_is_a_no_op() {
        let user = User::new(100, "alice".into(), "en".into());
        // No session attached; must not panic.
        user.try_send(ServerCommand::Pong);
        assert!(user.session.read().unwrap().upgrade().is_none());
    }
}
