//! Protocol commands for client-server communication.
//!
//! Two enums define the full protocol vocabulary:
//! - [`ClientCommand`]: sent by game clients to the session server.
//! - [`ServerCommand`]: sent by the session server to game clients.
//!
//! Every command starts with a one-byte tag, assigned contiguously from 0 in
//! declaration order. Out-of-range tags fail decoding. Broadcast
//! notifications travel inside [`ServerCommand::Message`] with their own
//! sub-tag space.
//!
//! Request/response commands use `Result<T, String>`: a `bool` success flag
//! followed by the payload on success or a human-readable error string on
//! failure. `Touches` and `Judges` are the only client commands the server
//! never acknowledges.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::codec::{ByteReader, ByteWriter, DecodeError, Wire};
use crate::{MAX_CHAT_LEN, TOKEN_LEN};

/// A room identifier: 1–20 characters of `[A-Za-z0-9_-]`.
///
/// Validation happens on construction and on decode, so a `RoomId` value is
/// always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self, DecodeError> {
        let id = id.into();
        let valid_len = (1..=20).contains(&id.len());
        let valid_chars = id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid_len && valid_chars {
            Ok(Self(id))
        } else {
            Err(DecodeError::InvalidRoomId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Wire for RoomId {
    fn write(&self, w: &mut ByteWriter) {
        w.string(&self.0);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Self::new(r.varchar(20)?)
    }
}

/// Public identity of a room member as clients see it.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub id: i32,
    pub name: String,
    pub monitor: bool,
}

impl Wire for UserInfo {
    fn write(&self, w: &mut ByteWriter) {
        w.i32(self.id);
        w.string(&self.name);
        w.bool(self.monitor);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: r.i32()?,
            name: r.string()?,
            monitor: r.bool()?,
        })
    }
}

/// One touch sample inside a [`TouchFrame`].
///
/// Positions travel as IEEE-754 binary16, so values are quantised to
/// half precision on encode.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchPoint {
    pub id: i8,
    pub x: f32,
    pub y: f32,
}

impl Wire for TouchPoint {
    fn write(&self, w: &mut ByteWriter) {
        w.i8(self.id);
        w.f16(self.x);
        w.f16(self.y);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: r.i8()?,
            x: r.f16()?,
            y: r.f16()?,
        })
    }
}

/// A timestamped batch of touch positions, mirrored to monitors.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchFrame {
    pub time: f32,
    pub points: Vec<TouchPoint>,
}

impl Wire for TouchFrame {
    fn write(&self, w: &mut ByteWriter) {
        w.f32(self.time);
        w.seq(&self.points);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            time: r.f32()?,
            points: r.seq()?,
        })
    }
}

/// A single note judgement, mirrored to monitors. `judgement` is `0..=5`.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeEvent {
    pub time: f32,
    pub line_id: u32,
    pub note_id: u32,
    pub judgement: u8,
}

impl Wire for JudgeEvent {
    fn write(&self, w: &mut ByteWriter) {
        w.f32(self.time);
        w.u32(self.line_id);
        w.u32(self.note_id);
        w.u8(self.judgement);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let time = r.f32()?;
        let line_id = r.u32()?;
        let note_id = r.u32()?;
        let judgement = r.u8()?;
        if judgement > 5 {
            return Err(DecodeError::InvalidJudgement(judgement));
        }
        Ok(Self {
            time,
            line_id,
            note_id,
            judgement,
        })
    }
}

/// Room state as clients see it. The `SelectChart` payload is the currently
/// selected chart id, when one is set.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomState {
    SelectChart(Option<i32>),
    WaitingForReady,
    Playing,
}

impl Wire for RoomState {
    fn write(&self, w: &mut ByteWriter) {
        match self {
            Self::SelectChart(chart) => {
                w.u8(0);
                w.option(chart);
            }
            Self::WaitingForReady => w.u8(1),
            Self::Playing => w.u8(2),
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        match r.u8()? {
            0 => Ok(Self::SelectChart(r.option()?)),
            1 => Ok(Self::WaitingForReady),
            2 => Ok(Self::Playing),
            tag => Err(DecodeError::UnknownTag {
                kind: "room state",
                tag,
            }),
        }
    }
}

/// Snapshot of a room sent to a reconnecting client so its UI can resume.
///
/// `users` covers every member, monitors included.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRoomState {
    pub id: RoomId,
    pub state: RoomState,
    pub live: bool,
    pub locked: bool,
    pub cycle: bool,
    pub is_host: bool,
    pub is_ready: bool,
    pub users: HashMap<i32, UserInfo>,
}

impl Wire for ClientRoomState {
    fn write(&self, w: &mut ByteWriter) {
        self.id.write(w);
        self.state.write(w);
        w.bool(self.live);
        w.bool(self.locked);
        w.bool(self.cycle);
        w.bool(self.is_host);
        w.bool(self.is_ready);
        self.users.write(w);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: RoomId::read(r)?,
            state: RoomState::read(r)?,
            live: r.bool()?,
            locked: r.bool()?,
            cycle: r.bool()?,
            is_host: r.bool()?,
            is_ready: r.bool()?,
            users: HashMap::read(r)?,
        })
    }
}

/// Success payload of [`ServerCommand::JoinRoom`].
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRoomResponse {
    pub state: RoomState,
    pub users: Vec<UserInfo>,
    pub live: bool,
}

impl Wire for JoinRoomResponse {
    fn write(&self, w: &mut ByteWriter) {
        self.state.write(w);
        w.seq(&self.users);
        w.bool(self.live);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            state: RoomState::read(r)?,
            users: r.seq()?,
            live: r.bool()?,
        })
    }
}

/// Commands sent by a client to the server. Tags run 0–15 in declaration
/// order; anything above is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Ping,
    Authenticate { token: String },
    Chat { message: String },
    Touches { frames: Vec<TouchFrame> },
    Judges { judges: Vec<JudgeEvent> },
    CreateRoom { id: RoomId },
    JoinRoom { id: RoomId, monitor: bool },
    LeaveRoom,
    LockRoom { lock: bool },
    CycleRoom { cycle: bool },
    SelectChart { id: i32 },
    RequestStart,
    Ready,
    CancelReady,
    Played { id: i32 },
    Abort,
}

impl Wire for ClientCommand {
    fn write(&self, w: &mut ByteWriter) {
        match self {
            Self::Ping => w.u8(0),
            Self::Authenticate { token } => {
                w.u8(1);
                w.string(token);
            }
            Self::Chat { message } => {
                w.u8(2);
                w.string(message);
            }
            Self::Touches { frames } => {
                w.u8(3);
                w.seq(frames);
            }
            Self::Judges { judges } => {
                w.u8(4);
                w.seq(judges);
            }
            Self::CreateRoom { id } => {
                w.u8(5);
                id.write(w);
            }
            Self::JoinRoom { id, monitor } => {
                w.u8(6);
                id.write(w);
                w.bool(*monitor);
            }
            Self::LeaveRoom => w.u8(7),
            Self::LockRoom { lock } => {
                w.u8(8);
                w.bool(*lock);
            }
            Self::CycleRoom { cycle } => {
                w.u8(9);
                w.bool(*cycle);
            }
            Self::SelectChart { id } => {
                w.u8(10);
                w.i32(*id);
            }
            Self::RequestStart => w.u8(11),
            Self::Ready => w.u8(12),
            Self::CancelReady => w.u8(13),
            Self::Played { id } => {
                w.u8(14);
                w.i32(*id);
            }
            Self::Abort => w.u8(15),
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        match r.u8()? {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Authenticate {
                token: r.varchar(TOKEN_LEN)?,
            }),
            2 => Ok(Self::Chat {
                message: r.varchar(MAX_CHAT_LEN)?,
            }),
            3 => Ok(Self::Touches { frames: r.seq()? }),
            4 => Ok(Self::Judges { judges: r.seq()? }),
            5 => Ok(Self::CreateRoom {
                id: RoomId::read(r)?,
            }),
            6 => Ok(Self::JoinRoom {
                id: RoomId::read(r)?,
                monitor: r.bool()?,
            }),
            7 => Ok(Self::LeaveRoom),
            8 => Ok(Self::LockRoom { lock: r.bool()? }),
            9 => Ok(Self::CycleRoom { cycle: r.bool()? }),
            10 => Ok(Self::SelectChart { id: r.i32()? }),
            11 => Ok(Self::RequestStart),
            12 => Ok(Self::Ready),
            13 => Ok(Self::CancelReady),
            14 => Ok(Self::Played { id: r.i32()? }),
            15 => Ok(Self::Abort),
            tag => Err(DecodeError::UnknownTag {
                kind: "client command",
                tag,
            }),
        }
    }
}

impl ClientCommand {
    /// Decodes a full frame payload, requiring every byte to be consumed.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(payload);
        let cmd = Self::read(&mut r)?;
        r.expect_end()?;
        Ok(cmd)
    }

    /// Encodes into a fresh frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.write(&mut w);
        w.into_inner()
    }
}

/// Broadcast notifications carried inside [`ServerCommand::Message`].
/// Sub-tags run 0–15 in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Chat { user: i32, content: String },
    CreateRoom { user: i32 },
    JoinRoom { user: i32, name: String },
    LeaveRoom { user: i32, name: String },
    NewHost { user: i32 },
    SelectChart { user: i32, name: String, id: i32 },
    GameStart { user: i32 },
    Ready { user: i32 },
    CancelReady { user: i32 },
    CancelGame { user: i32 },
    StartPlaying,
    Played { user: i32, score: i32, accuracy: f32, full_combo: bool },
    GameEnd,
    Abort { user: i32 },
    LockRoom { lock: bool },
    CycleRoom { cycle: bool },
}

impl Wire for Message {
    fn write(&self, w: &mut ByteWriter) {
        match self {
            Self::Chat { user, content } => {
                w.u8(0);
                w.i32(*user);
                w.string(content);
            }
            Self::CreateRoom { user } => {
                w.u8(1);
                w.i32(*user);
            }
            Self::JoinRoom { user, name } => {
                w.u8(2);
                w.i32(*user);
                w.string(name);
            }
            Self::LeaveRoom { user, name } => {
                w.u8(3);
                w.i32(*user);
                w.string(name);
            }
            Self::NewHost { user } => {
                w.u8(4);
                w.i32(*user);
            }
            Self::SelectChart { user, name, id } => {
                w.u8(5);
                w.i32(*user);
                w.string(name);
                w.i32(*id);
            }
            Self::GameStart { user } => {
                w.u8(6);
                w.i32(*user);
            }
            Self::Ready { user } => {
                w.u8(7);
                w.i32(*user);
            }
            Self::CancelReady { user } => {
                w.u8(8);
                w.i32(*user);
            }
            Self::CancelGame { user } => {
                w.u8(9);
                w.i32(*user);
            }
            Self::StartPlaying => w.u8(10),
            Self::Played {
                user,
                score,
                accuracy,
                full_combo,
            } => {
                w.u8(11);
                w.i32(*user);
                w.i32(*score);
                w.f32(*accuracy);
                w.bool(*full_combo);
            }
            Self::GameEnd => w.u8(12),
            Self::Abort { user } => {
                w.u8(13);
                w.i32(*user);
            }
            Self::LockRoom { lock } => {
                w.u8(14);
                w.bool(*lock);
            }
            Self::CycleRoom { cycle } => {
                w.u8(15);
                w.bool(*cycle);
            }
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        match r.u8()? {
            0 => Ok(Self::Chat {
                user: r.i32()?,
                content: r.string()?,
            }),
            1 => Ok(Self::CreateRoom { user: r.i32()? }),
            2 => Ok(Self::JoinRoom {
                user: r.i32()?,
                name: r.string()?,
            }),
            3 => Ok(Self::LeaveRoom {
                user: r.i32()?,
                name: r.string()?,
            }),
            4 => Ok(Self::NewHost { user: r.i32()? }),
            5 => Ok(Self::SelectChart {
                user: r.i32()?,
                name: r.string()?,
                id: r.i32()?,
            }),
            6 => Ok(Self::GameStart { user: r.i32()? }),
            7 => Ok(Self::Ready { user: r.i32()? }),
            8 => Ok(Self::CancelReady { user: r.i32()? }),
            9 => Ok(Self::CancelGame { user: r.i32()? }),
            10 => Ok(Self::StartPlaying),
            11 => Ok(Self::Played {
                user: r.i32()?,
                score: r.i32()?,
                accuracy: r.f32()?,
                full_combo: r.bool()?,
            }),
            12 => Ok(Self::GameEnd),
            13 => Ok(Self::Abort { user: r.i32()? }),
            14 => Ok(Self::LockRoom { lock: r.bool()? }),
            15 => Ok(Self::CycleRoom { cycle: r.bool()? }),
            tag => Err(DecodeError::UnknownTag {
                kind: "message",
                tag,
            }),
        }
    }
}

fn write_result<T: Wire>(w: &mut ByteWriter, result: &Result<T, String>) {
    match result {
        Ok(value) => {
            w.bool(true);
            value.write(w);
        }
        Err(error) => {
            w.bool(false);
            w.string(error);
        }
    }
}

fn read_result<T: Wire>(r: &mut ByteReader<'_>) -> Result<Result<T, String>, DecodeError> {
    if r.bool()? {
        Ok(Ok(T::read(r)?))
    } else {
        Ok(Err(r.string()?))
    }
}

fn write_unit_result(w: &mut ByteWriter, result: &Result<(), String>) {
    match result {
        Ok(()) => w.bool(true),
        Err(error) => {
            w.bool(false);
            w.string(error);
        }
    }
}

fn read_unit_result(r: &mut ByteReader<'_>) -> Result<Result<(), String>, DecodeError> {
    if r.bool()? {
        Ok(Ok(()))
    } else {
        Ok(Err(r.string()?))
    }
}

/// Success payload of [`ServerCommand::Authenticate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticateResponse {
    pub me: UserInfo,
    pub room: Option<ClientRoomState>,
}

impl Wire for AuthenticateResponse {
    fn write(&self, w: &mut ByteWriter) {
        self.me.write(w);
        w.option(&self.room);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            me: UserInfo::read(r)?,
            room: r.option()?,
        })
    }
}

/// Commands sent by the server to a client. Tags run 0–19 in declaration
/// order. Variants named after a client command are its response; the rest
/// are unsolicited pushes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    Pong,
    Authenticate(Result<AuthenticateResponse, String>),
    Chat(Result<(), String>),
    Touches { player: i32, frames: Vec<TouchFrame> },
    Judges { player: i32, judges: Vec<JudgeEvent> },
    Message(Message),
    ChangeState(RoomState),
    ChangeHost(bool),
    CreateRoom(Result<(), String>),
    JoinRoom(Result<JoinRoomResponse, String>),
    OnJoinRoom(UserInfo),
    LeaveRoom(Result<(), String>),
    LockRoom(Result<(), String>),
    CycleRoom(Result<(), String>),
    SelectChart(Result<(), String>),
    RequestStart(Result<(), String>),
    Ready(Result<(), String>),
    CancelReady(Result<(), String>),
    Played(Result<(), String>),
    Abort(Result<(), String>),
}

impl Wire for ServerCommand {
    fn write(&self, w: &mut ByteWriter) {
        match self {
            Self::Pong => w.u8(0),
            Self::Authenticate(result) => {
                w.u8(1);
                write_result(w, result);
            }
            Self::Chat(result) => {
                w.u8(2);
                write_unit_result(w, result);
            }
            Self::Touches { player, frames } => {
                w.u8(3);
                w.i32(*player);
                w.seq(frames);
            }
            Self::Judges { player, judges } => {
                w.u8(4);
                w.i32(*player);
                w.seq(judges);
            }
            Self::Message(message) => {
                w.u8(5);
                message.write(w);
            }
            Self::ChangeState(state) => {
                w.u8(6);
                state.write(w);
            }
            Self::ChangeHost(host) => {
                w.u8(7);
                w.bool(*host);
            }
            Self::CreateRoom(result) => {
                w.u8(8);
                write_unit_result(w, result);
            }
            Self::JoinRoom(result) => {
                w.u8(9);
                write_result(w, result);
            }
            Self::OnJoinRoom(user) => {
                w.u8(10);
                user.write(w);
            }
            Self::LeaveRoom(result) => {
                w.u8(11);
                write_unit_result(w, result);
            }
            Self::LockRoom(result) => {
                w.u8(12);
                write_unit_result(w, result);
            }
            Self::CycleRoom(result) => {
                w.u8(13);
                write_unit_result(w, result);
            }
            Self::SelectChart(result) => {
                w.u8(14);
                write_unit_result(w, result);
            }
            Self::RequestStart(result) => {
                w.u8(15);
                write_unit_result(w, result);
            }
            Self::Ready(result) => {
                w.u8(16);
                write_unit_result(w, result);
            }
            Self::CancelReady(result) => {
                w.u8(17);
                write_unit_result(w, result);
            }
            Self::Played(result) => {
                w.u8(18);
                write_unit_result(w, result);
            }
            Self::Abort(result) => {
                w.u8(19);
                write_unit_result(w, result);
            }
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        match r.u8()? {
            0 => Ok(Self::Pong),
            1 => Ok(Self::Authenticate(read_result(r)?)),
            2 => Ok(Self::Chat(read_unit_result(r)?)),
            3 => Ok(Self::Touches {
                player: r.i32()?,
                frames: r.seq()?,
            }),
            4 => Ok(Self::Judges {
                player: r.i32()?,
                judges: r.seq()?,
            }),
            5 => Ok(Self::Message(Message::read(r)?)),
            6 => Ok(Self::ChangeState(RoomState::read(r)?)),
            7 => Ok(Self::ChangeHost(r.bool()?)),
            8 => Ok(Self::CreateRoom(read_unit_result(r)?)),
            9 => Ok(Self::JoinRoom(read_result(r)?)),
            10 => Ok(Self::OnJoinRoom(UserInfo::read(r)?)),
            11 => Ok(Self::LeaveRoom(read_unit_result(r)?)),
            12 => Ok(Self::LockRoom(read_unit_result(r)?)),
            13 => Ok(Self::CycleRoom(read_unit_result(r)?)),
            14 => Ok(Self::SelectChart(read_unit_result(r)?)),
            15 => Ok(Self::RequestStart(read_unit_result(r)?)),
            16 => Ok(Self::Ready(read_unit_result(r)?)),
            17 => Ok(Self::CancelReady(read_unit_result(r)?)),
            18 => Ok(Self::Played(read_unit_result(r)?)),
            19 => Ok(Self::Abort(read_unit_result(r)?)),
            tag => Err(DecodeError::UnknownTag {
                kind: "server command",
                tag,
            }),
        }
    }
}

impl ServerCommand {
    /// Decodes a full frame payload, requiring every byte to be consumed.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(payload);
        let cmd = Self::read(&mut r)?;
        r.expect_end()?;
        Ok(cmd)
    }

    /// Encodes into a fresh frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.write(&mut w);
        w.into_inner()
    }
}
