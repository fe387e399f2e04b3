//! Wire protocol shared between the routing server and the client.
//!
//! Every message starts with a fixed 8-byte header followed by a
//! type-specific body. All integer fields are little-endian u32.
//!
//! ```text
//! Header:             | TYPE | LEN  |                          8 bytes
//! CONNECT/DISCONNECT: | TYPE | LEN  | IDENT |                 12 bytes
//! SEND:               | TYPE | LEN  | SRC | DST | FORMAT | DATA ...
//! JOIN/LEAVE:         | TYPE | LEN  | SRC | DST |         16 bytes
//! REPLY:              | TYPE | LEN  | CODE |                 12 bytes
//! ```
//!
//! `LEN` is the total frame length including the header, so a receiver can
//! walk a buffer containing several concatenated frames. The `SEND` payload
//! is opaque to the protocol; `FORMAT` is carried through untouched.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Per-read buffer capacity shared by server and client receive loops.
pub const MAX_FRAME_BATCH: usize = 65535;

/// Size of the fixed frame header (type + length).
pub const HEADER_LEN: usize = 8;

/// Size of a CONNECT/DISCONNECT frame.
pub const CONN_FRAME_LEN: usize = 12;

/// Size of a JOIN/LEAVE frame.
pub const ROOM_FRAME_LEN: usize = 16;

/// Size of a REPLY frame.
pub const REPLY_FRAME_LEN: usize = 12;

/// Size of a SEND frame with an empty payload.
pub const SEND_HEADER_LEN: usize = 20;

const TYPE_NONE: u32 = 0;
const TYPE_CONNECT: u32 = 1;
const TYPE_DISCONNECT: u32 = 2;
const TYPE_SEND: u32 = 3;
const TYPE_JOIN: u32 = 5;
const TYPE_LEAVE: u32 = 6;
const TYPE_REPLY: u32 = 7;

/// Errors produced while decoding a frame.
///
/// Only structurally broken frames are errors; an unknown message type is
/// not (it decodes to [`Message::Unknown`] so future types can be skipped).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The header declares a length smaller than the minimum for its type.
    #[error("frame length {length} below minimum {min} for message type {msg_type}")]
    LengthBelowMinimum { msg_type: u32, length: u32, min: u32 },
}

/// Outcome code carried by a REPLY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// No outcome; ignored by receivers.
    None,
    /// The request succeeded.
    Ok,
    /// Forwarding a SEND to its destination failed.
    SendFailed,
    /// The identifier of a CONNECT is already registered.
    DuplicateId,
    /// The destination of a SEND matches no client and no room.
    DstNotFound,
    /// The room of a LEAVE does not exist.
    RoomNotFound,
    /// The sender of a LEAVE is not a member of the room.
    NotInRoom,
    /// Reserved: room id collides with a client identifier. Carried for
    /// wire compatibility; no server path currently emits it.
    RoomConflict,
}

impl ReplyCode {
    /// Decodes a wire value. Unknown values map to `None` so that newer
    /// peers can introduce codes without breaking older ones.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => ReplyCode::Ok,
            2 => ReplyCode::SendFailed,
            3 => ReplyCode::DuplicateId,
            4 => ReplyCode::DstNotFound,
            5 => ReplyCode::RoomNotFound,
            6 => ReplyCode::NotInRoom,
            7 => ReplyCode::RoomConflict,
            _ => ReplyCode::None,
        }
    }

    /// Wire value of this code.
    pub fn as_u32(self) -> u32 {
        match self {
            ReplyCode::None => 0,
            ReplyCode::Ok => 1,
            ReplyCode::SendFailed => 2,
            ReplyCode::DuplicateId => 3,
            ReplyCode::DstNotFound => 4,
            ReplyCode::RoomNotFound => 5,
            ReplyCode::NotInRoom => 6,
            ReplyCode::RoomConflict => 7,
        }
    }
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Placeholder frame; ignored by all receivers.
    None,
    /// Registers `ident` as belonging to the sending connection.
    Connect { ident: u32 },
    /// Removes `ident` from the registry.
    Disconnect { ident: u32 },
    /// Routes `payload` from `src` to `dst` (a client or a room).
    Send {
        src: u32,
        dst: u32,
        format: u32,
        payload: Vec<u8>,
    },
    /// Adds `src` to room `room`.
    Join { src: u32, room: u32 },
    /// Removes `src` from room `room`.
    Leave { src: u32, room: u32 },
    /// Server outcome for the preceding request on this connection.
    Reply { code: ReplyCode },
    /// A type this build does not know. Receivers skip it by `length`.
    Unknown { msg_type: u32, length: u32 },
}

/// Result of attempting to decode one frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame: the message and the exact bytes it occupied.
    Frame { message: Message, consumed: usize },
    /// The buffer holds less than one complete frame; read more first.
    Incomplete,
}

/// Minimum legal frame length for a wire type. Unknown types only need to
/// carry the header itself.
fn min_frame_len(msg_type: u32) -> usize {
    match msg_type {
        TYPE_CONNECT | TYPE_DISCONNECT => CONN_FRAME_LEN,
        TYPE_SEND => SEND_HEADER_LEN,
        TYPE_JOIN | TYPE_LEAVE => ROOM_FRAME_LEN,
        TYPE_REPLY => REPLY_FRAME_LEN,
        _ => HEADER_LEN,
    }
}

/// Decodes one frame from the front of `buf`.
///
/// Reads exactly `header.length` bytes and never inspects anything past
/// them, so `buf` may contain further concatenated frames or garbage.
/// Returns [`Decoded::Incomplete`] when fewer than `header.length` bytes
/// are available, and an error only for structurally impossible lengths.
pub fn decode(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete);
    }

    let mut cursor = buf;
    let msg_type = cursor.get_u32_le();
    let length = cursor.get_u32_le();

    let min = min_frame_len(msg_type);
    if (length as usize) < min {
        return Err(ProtocolError::LengthBelowMinimum {
            msg_type,
            length,
            min: min as u32,
        });
    }

    let consumed = length as usize;
    if buf.len() < consumed {
        return Ok(Decoded::Incomplete);
    }

    let message = match msg_type {
        TYPE_NONE => Message::None,
        TYPE_CONNECT => Message::Connect {
            ident: cursor.get_u32_le(),
        },
        TYPE_DISCONNECT => Message::Disconnect {
            ident: cursor.get_u32_le(),
        },
        TYPE_SEND => {
            let src = cursor.get_u32_le();
            let dst = cursor.get_u32_le();
            let format = cursor.get_u32_le();
            let payload = buf[SEND_HEADER_LEN..consumed].to_vec();
            Message::Send {
                src,
                dst,
                format,
                payload,
            }
        }
        TYPE_JOIN => Message::Join {
            src: cursor.get_u32_le(),
            room: cursor.get_u32_le(),
        },
        TYPE_LEAVE => Message::Leave {
            src: cursor.get_u32_le(),
            room: cursor.get_u32_le(),
        },
        TYPE_REPLY => Message::Reply {
            code: ReplyCode::from_u32(cursor.get_u32_le()),
        },
        other => Message::Unknown {
            msg_type: other,
            length,
        },
    };

    Ok(Decoded::Frame { message, consumed })
}

fn frame(msg_type: u32, length: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(length);
    buf.put_u32_le(msg_type);
    buf.put_u32_le(length as u32);
    buf
}

/// Encodes a NONE frame (header only).
pub fn encode_none() -> Vec<u8> {
    frame(TYPE_NONE, HEADER_LEN).to_vec()
}

/// Encodes a CONNECT frame for `ident`.
pub fn encode_connect(ident: u32) -> Vec<u8> {
    let mut buf = frame(TYPE_CONNECT, CONN_FRAME_LEN);
    buf.put_u32_le(ident);
    buf.to_vec()
}

/// Encodes a DISCONNECT frame for `ident`.
pub fn encode_disconnect(ident: u32) -> Vec<u8> {
    let mut buf = frame(TYPE_DISCONNECT, CONN_FRAME_LEN);
    buf.put_u32_le(ident);
    buf.to_vec()
}

/// Encodes a SEND frame carrying `payload` from `src` to `dst`.
pub fn encode_send(src: u32, dst: u32, format: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = frame(TYPE_SEND, SEND_HEADER_LEN + payload.len());
    buf.put_u32_le(src);
    buf.put_u32_le(dst);
    buf.put_u32_le(format);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Encodes a JOIN frame adding `src` to `room`.
pub fn encode_join(src: u32, room: u32) -> Vec<u8> {
    let mut buf = frame(TYPE_JOIN, ROOM_FRAME_LEN);
    buf.put_u32_le(src);
    buf.put_u32_le(room);
    buf.to_vec()
}

/// Encodes a LEAVE frame removing `src` from `room`.
pub fn encode_leave(src: u32, room: u32) -> Vec<u8> {
    let mut buf = frame(TYPE_LEAVE, ROOM_FRAME_LEN);
    buf.put_u32_le(src);
    buf.put_u32_le(room);
    buf.to_vec()
}

/// Encodes a REPLY frame carrying `code`.
pub fn encode_reply(code: ReplyCode) -> Vec<u8> {
    let mut buf = frame(TYPE_REPLY, REPLY_FRAME_LEN);
    buf.put_u32_le(code.as_u32());
    buf.to_vec()
}

/// Encodes any message to its frame bytes.
///
/// [`Message::Unknown`] re-encodes as a bare header of its recorded type,
/// since the original body is not retained.
pub fn encode(message: &Message) -> Vec<u8> {
    match message {
        Message::None => encode_none(),
        Message::Connect { ident } => encode_connect(*ident),
        Message::Disconnect { ident } => encode_disconnect(*ident),
        Message::Send {
            src,
            dst,
            format,
            payload,
        } => encode_send(*src, *dst, *format, payload),
        Message::Join { src, room } => encode_join(*src, *room),
        Message::Leave { src, room } => encode_leave(*src, *room),
        Message::Reply { code } => encode_reply(*code),
        Message::Unknown { msg_type, .. } => frame(*msg_type, HEADER_LEN).to_vec(),
    }
}
