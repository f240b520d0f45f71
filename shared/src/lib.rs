//! # Shared Protocol Library
//!
//! This crate contains the complete wire vocabulary shared by the session
//! server and its clients: the binary codec primitives, the tagged command
//! enums for both directions, and the length-prefixed frame layer.
//!
//! ## Wire Format
//!
//! Every application message travels as a frame: an unsigned variable-length
//! integer length followed by that many payload bytes. The payload is a
//! one-byte command tag followed by the command's fields, encoded with the
//! primitives in [`codec`]:
//!
//! - Fixed-width integers are little-endian.
//! - `f32` is IEEE-754 little-endian; touch positions travel as IEEE-754
//!   binary16 to halve telemetry bandwidth.
//! - `bool` is exactly `0x00` or `0x01`; anything else fails decoding.
//! - Strings are a varint byte length followed by UTF-8.
//! - Sequences are a varint count followed by the elements.
//! - Optionals are a `bool` discriminant followed by the value when `true`.
//!
//! ## Handshake
//!
//! Immediately after the TCP connection is established, each side writes a
//! single raw byte carrying its protocol version ([`PROTOCOL_VERSION`]).
//! Neither side waits for the peer's byte before sending its own. A version
//! mismatch is not an error at this layer.
//!
//! ## Error Model
//!
//! Frame-local problems (unknown tag, malformed string, truncated payload)
//! surface as [`codec::DecodeError`] and leave the connection usable; the
//! server logs and skips the frame. Transport-level problems (I/O errors,
//! an over-long length encoding, a length above [`frame::MAX_FRAME_SIZE`])
//! surface as `std::io::Error` from the frame layer and terminate the
//! connection.

pub mod codec;
pub mod commands;
pub mod frame;

pub use codec::{ByteReader, ByteWriter, DecodeError, Wire};
pub use commands::{
    ClientCommand, ClientRoomState, JoinRoomResponse, JudgeEvent, Message, RoomId, RoomState,
    ServerCommand, TouchFrame, TouchPoint, UserInfo,
};
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};

/// Protocol version advertised in the handshake byte.
pub const PROTOCOL_VERSION: u8 = 0;

/// Maximum length of a chat message, enforced at decode time.
pub const MAX_CHAT_LEN: usize = 200;

/// Maximum length of an authentication token, enforced at decode time.
/// The server additionally requires tokens to be exactly this long.
pub const TOKEN_LEN: usize = 32;
