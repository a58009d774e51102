//! Typed payload records carried inside frames.
//!
//! Every record is encoded with bincode and tied to the message id it travels
//! under through the [`Message`] trait, so both ends agree on which struct a
//! given frame holds.

use crate::{MsgId, RoomId, Uid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("payload codec error: {0}")]
pub struct PayloadError(#[from] bincode::Error);

/// A payload record bound to the message id it is sent under.
pub trait Message: Serialize + DeserializeOwned {
    const MSG_ID: MsgId;
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    Ok(bincode::deserialize(bytes)?)
}

macro_rules! bind_msg_id {
    ($($ty:ty => $id:expr),+ $(,)?) => {
        $(impl Message for $ty {
            const MSG_ID: MsgId = $id;
        })+
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatChannel {
    World,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub channel: ChatChannel,
    /// Recipient uid, only read on the private channel
    pub to: Uid,
    pub text: String,
}

/// Chat line pushed to recipients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatNotice {
    pub from: Uid,
    pub channel: ChatChannel,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatAck {
    pub ok: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub name: String,
    pub passwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterAck {
    pub ok: bool,
    pub uid: Option<Uid>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub uid: Uid,
    pub passwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginAck {
    pub ok: bool,
    pub reason: String,
}

/// Persistent attributes of a player
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerAttr {
    pub uid: Uid,
    pub level: u32,
    pub exp: u32,
    pub hp: u32,
    pub mp: u32,
    pub coin: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl PlayerAttr {
    /// Attributes handed to a player on first login
    pub fn new_player(uid: Uid) -> Self {
        Self {
            uid,
            level: 1,
            exp: 0,
            hp: 100,
            mp: 50,
            coin: 1000,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewPlayerRequest {
    pub uid: Uid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewPlayerAck {
    pub ok: bool,
    pub attr: Option<PlayerAttr>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddExpRequest {
    pub uid: Uid,
    pub exp_add: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddExpAck {
    pub uid: Uid,
    pub new_level: u32,
    pub new_exp: u32,
    pub level_up: bool,
    pub success: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnterRoomRequest {
    pub roomid: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnterRoomAck {
    pub ok: bool,
    pub reason: String,
    pub roomid: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyRequest {
    pub roomid: RoomId,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyAck {
    pub roomid: RoomId,
    pub uid: Uid,
    pub ready: bool,
    pub ok: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleAction {
    pub roomid: RoomId,
    pub skill: u32,
    pub target: Uid,
}

/// Live hp/mp of one battle participant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CombatState {
    pub uid: Uid,
    pub hp: u32,
    pub mp: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleSync {
    pub roomid: RoomId,
    pub states: Vec<CombatState>,
    /// Milliseconds since the unix epoch when the snapshot was taken
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleStart {
    pub roomid: RoomId,
    pub players: Vec<Uid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleEnd {
    pub roomid: RoomId,
    /// Sole survivor, or `None` when nobody was left standing
    pub winner: Option<Uid>,
}

bind_msg_id! {
    ChatRequest => MsgId::Chat,
    ChatNotice => MsgId::Chat,
    ChatAck => MsgId::ChatAck,
    RegisterRequest => MsgId::Register,
    RegisterAck => MsgId::RegisterAck,
    LoginRequest => MsgId::Login,
    LoginAck => MsgId::LoginAck,
    ViewPlayerRequest => MsgId::ViewBackpack,
    ViewPlayerAck => MsgId::ViewBackpackAck,
    AddExpRequest => MsgId::AddExp,
    AddExpAck => MsgId::AddExpAck,
    EnterRoomRequest => MsgId::EnterRoom,
    EnterRoomAck => MsgId::EnterRoomAck,
    ReadyRequest => MsgId::Ready,
    ReadyAck => MsgId::ReadyAck,
    BattleAction => MsgId::BattleAction,
    BattleSync => MsgId::BattleSync,
    BattleStart => MsgId::BattleStart,
    BattleEnd => MsgId::BattleEnd,
}
