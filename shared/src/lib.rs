//! Protocol definitions shared between the arena server and its clients.
//!
//! This crate holds everything both ends must agree on: the frame codec, the
//! message-id table with its request/response pairing, and the typed payload
//! records that travel inside frames.

pub mod frame;
pub mod messages;

pub use frame::{encode_frame, Frame, FrameDecoder, FrameError, MAX_FRAME_LEN, MIN_FRAME_LEN};
pub use messages::{decode_payload, encode_payload, Message, PayloadError};

use thiserror::Error;

pub type Uid = u32;
pub type RoomId = u32;

pub const DEFAULT_PORT: u16 = 8989;

/// Every message id understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgId {
    Chat = 1,
    ChatAck = 2,
    Register = 3,
    RegisterAck = 4,
    Login = 5,
    LoginAck = 6,
    ViewBackpack = 7,
    ViewBackpackAck = 8,
    AddExp = 9,
    AddExpAck = 10,
    EnterRoom = 11,
    EnterRoomAck = 12,
    Ready = 13,
    ReadyAck = 14,
    BattleAction = 15,
    BattleSync = 16,
    BattleStart = 17,
    BattleEnd = 18,
}

impl MsgId {
    pub const ALL: [MsgId; 18] = [
        MsgId::Chat,
        MsgId::ChatAck,
        MsgId::Register,
        MsgId::RegisterAck,
        MsgId::Login,
        MsgId::LoginAck,
        MsgId::ViewBackpack,
        MsgId::ViewBackpackAck,
        MsgId::AddExp,
        MsgId::AddExpAck,
        MsgId::EnterRoom,
        MsgId::EnterRoomAck,
        MsgId::Ready,
        MsgId::ReadyAck,
        MsgId::BattleAction,
        MsgId::BattleSync,
        MsgId::BattleStart,
        MsgId::BattleEnd,
    ];

    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<MsgId> {
        Self::ALL.iter().copied().find(|msg| msg.id() == id)
    }

    /// Response id a client should wait for after sending `self`.
    ///
    /// Battle actions are answered indirectly through battle-sync pushes, so
    /// they have no paired response.
    pub fn expected_response(self) -> Option<MsgId> {
        match self {
            MsgId::Chat => Some(MsgId::ChatAck),
            MsgId::Register => Some(MsgId::RegisterAck),
            MsgId::Login => Some(MsgId::LoginAck),
            MsgId::ViewBackpack => Some(MsgId::ViewBackpackAck),
            MsgId::AddExp => Some(MsgId::AddExpAck),
            MsgId::EnterRoom => Some(MsgId::EnterRoomAck),
            MsgId::Ready => Some(MsgId::ReadyAck),
            _ => None,
        }
    }

    /// Ids the server may send without a preceding request
    pub fn is_server_push(self) -> bool {
        matches!(
            self,
            MsgId::Chat | MsgId::BattleSync | MsgId::BattleStart | MsgId::BattleEnd
        )
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Serializes a typed record and wraps it in a frame under its own id.
pub fn encode_message<M: Message>(message: &M) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(message)?;
    Ok(encode_frame(M::MSG_ID.id(), &payload)?)
}

/// Decodes the payload of `frame` as `M`, checking the id matches.
pub fn decode_message<M: Message>(frame: &Frame) -> Option<Result<M, PayloadError>> {
    if frame.msg_id != M::MSG_ID.id() {
        return None;
    }
    Some(decode_payload(&frame.payload))
}
