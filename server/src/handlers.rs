//! Business handlers for every client request.
//!
//! Each handler decodes its typed request, does its work against the
//! registries and stores, and answers through the connection registry. A
//! request that cannot be served gets an explicit failure response carrying a
//! reason; the returned error only feeds the dispatcher's log.

use crate::battle::skill;
use crate::connection::ConnectionId;
use crate::connection_registry::ConnectionRegistry;
use crate::dispatcher::Dispatcher;
use crate::error::HandlerError;
use crate::room::Player;
use crate::room_registry::RoomRegistry;
use crate::store::{AttributeStore, AuthStore};
use crate::utils::timestamp_ms;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use shared::messages::*;
use shared::{Message, MsgId, Uid};
use std::sync::Arc;

const NOT_LOGGED_IN: &str = "not logged in";

type Route = fn(&GameHandlers, ConnectionId, &[u8]) -> Result<(), HandlerError>;

pub struct GameHandlers {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomRegistry>,
    attrs: Arc<dyn AttributeStore>,
    auth: Arc<dyn AuthStore>,
}

impl GameHandlers {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomRegistry>,
        attrs: Arc<dyn AttributeStore>,
        auth: Arc<dyn AuthStore>,
    ) -> Self {
        Self {
            registry,
            rooms,
            attrs,
            auth,
        }
    }

    /// Installs every request handler on the dispatcher.
    pub fn register_all(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let routes: [(MsgId, Route); 8] = [
            (MsgId::Chat, GameHandlers::chat),
            (MsgId::Register, GameHandlers::register),
            (MsgId::Login, GameHandlers::login),
            (MsgId::ViewBackpack, GameHandlers::view_backpack),
            (MsgId::AddExp, GameHandlers::add_exp),
            (MsgId::EnterRoom, GameHandlers::enter_room),
            (MsgId::Ready, GameHandlers::ready),
            (MsgId::BattleAction, GameHandlers::battle_action),
        ];

        for (msg_id, route) in routes {
            let handlers = Arc::clone(self);
            dispatcher.register(msg_id, move |conn_id, payload| {
                route(&handlers, conn_id, &payload)
            });
        }
        info!("Registered {} message handlers", dispatcher.handler_count());
    }

    fn reply<M: Message>(&self, conn_id: ConnectionId, message: &M) {
        if !self.registry.send_message_to(conn_id, message) {
            debug!("Connection {} gone before {:?} reply", conn_id, M::MSG_ID);
        }
    }

    /// Decodes a request, answering with `on_error` if it is malformed
    fn parse<T, A, F>(
        &self,
        conn_id: ConnectionId,
        payload: &[u8],
        on_error: F,
    ) -> Result<T, HandlerError>
    where
        T: DeserializeOwned,
        A: Message,
        F: FnOnce(String) -> A,
    {
        decode_payload(payload).map_err(|e| {
            self.reply(conn_id, &on_error(format!("malformed request: {}", e)));
            HandlerError::from(e)
        })
    }

    fn session_user(&self, conn_id: ConnectionId) -> Option<Uid> {
        self.registry.get(conn_id).and_then(|conn| conn.user())
    }

    pub fn chat(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let nack = |reason: String| ChatAck { ok: false, reason };
        let request: ChatRequest = self.parse(conn_id, payload, nack)?;

        let Some(from) = self.session_user(conn_id) else {
            self.reply(conn_id, &nack(NOT_LOGGED_IN.to_string()));
            return Err(HandlerError::NotLoggedIn(conn_id));
        };

        let notice = ChatNotice {
            from,
            channel: request.channel,
            text: request.text,
        };
        let ack = match request.channel {
            ChatChannel::World => {
                let reached = self.registry.broadcast_message(&notice);
                debug!("World chat from {} reached {} players", from, reached);
                ChatAck {
                    ok: true,
                    reason: String::new(),
                }
            }
            ChatChannel::Private => match self.registry.get_user(request.to) {
                Some(target) => {
                    target.send_message(&notice)?;
                    ChatAck {
                        ok: true,
                        reason: String::new(),
                    }
                }
                None => nack(format!("user {} is offline", request.to)),
            },
        };
        self.reply(conn_id, &ack);
        Ok(())
    }

    pub fn register(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let nack = |reason: String| RegisterAck {
            ok: false,
            uid: None,
            reason,
        };
        let request: RegisterRequest = self.parse(conn_id, payload, nack)?;

        if request.name.is_empty() || request.passwd.is_empty() {
            self.reply(conn_id, &nack("name and password are required".to_string()));
            return Ok(());
        }

        let uid = match self.auth.register(&request.name, &request.passwd) {
            Ok(uid) => uid,
            Err(e) => {
                self.reply(conn_id, &nack(e.to_string()));
                return Err(e.into());
            }
        };
        if let Err(e) = self.attrs.load_or_create(uid) {
            warn!("Could not create attributes for new player {}: {}", uid, e);
        }

        self.reply(
            conn_id,
            &RegisterAck {
                ok: true,
                uid: Some(uid),
                reason: String::new(),
            },
        );
        Ok(())
    }

    pub fn login(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let nack = |reason: String| LoginAck { ok: false, reason };
        let request: LoginRequest = self.parse(conn_id, payload, nack)?;

        if let Err(failure) = self.auth.login(request.uid, &request.passwd) {
            info!("Login for {} rejected: {}", request.uid, failure.reason());
            self.reply(conn_id, &nack(failure.reason()));
            return Ok(());
        }

        let bound = self
            .registry
            .get(conn_id)
            .map_or(false, |conn| self.registry.bind_user(request.uid, &conn));
        if !bound {
            debug!("Connection {} closed during login", conn_id);
            return Ok(());
        }
        if let Err(e) = self.attrs.load_or_create(request.uid) {
            warn!("No attributes for player {}: {}", request.uid, e);
        }

        info!("User {} logged in on connection {}", request.uid, conn_id);
        self.reply(
            conn_id,
            &LoginAck {
                ok: true,
                reason: String::new(),
            },
        );
        Ok(())
    }

    pub fn view_backpack(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let nack = |reason: String| ViewPlayerAck {
            ok: false,
            attr: None,
            reason,
        };
        let request: ViewPlayerRequest = self.parse(conn_id, payload, nack)?;

        let ack = match self.attrs.get(request.uid) {
            Ok(Some(attr)) => ViewPlayerAck {
                ok: true,
                attr: Some(attr),
                reason: String::new(),
            },
            Ok(None) => nack(format!("player {} not found", request.uid)),
            Err(e) => {
                self.reply(conn_id, &nack(e.to_string()));
                return Err(e.into());
            }
        };
        self.reply(conn_id, &ack);
        Ok(())
    }

    pub fn add_exp(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let nack = |uid: Uid, reason: String| AddExpAck {
            uid,
            new_level: 0,
            new_exp: 0,
            level_up: false,
            success: false,
            reason,
        };
        let request: AddExpRequest = self.parse(conn_id, payload, |reason| nack(0, reason))?;

        match self.attrs.apply_exp_gain(request.uid, request.exp_add) {
            Ok(gain) => {
                if gain.leveled_up {
                    info!("Player {} reached level {}", request.uid, gain.new_level);
                }
                self.reply(
                    conn_id,
                    &AddExpAck {
                        uid: request.uid,
                        new_level: gain.new_level,
                        new_exp: gain.new_exp,
                        level_up: gain.leveled_up,
                        success: true,
                        reason: String::new(),
                    },
                );
                Ok(())
            }
            Err(e) => {
                self.reply(conn_id, &nack(request.uid, e.to_string()));
                Err(e.into())
            }
        }
    }

    pub fn enter_room(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let request: EnterRoomRequest = self.parse(conn_id, payload, |reason| EnterRoomAck {
            ok: false,
            reason,
            roomid: 0,
        })?;
        let nack = |reason: String| EnterRoomAck {
            ok: false,
            reason,
            roomid: request.roomid,
        };

        let Some(uid) = self.session_user(conn_id) else {
            self.reply(conn_id, &nack(NOT_LOGGED_IN.to_string()));
            return Err(HandlerError::NotLoggedIn(conn_id));
        };

        let room = match self.rooms.join(request.roomid, Player::new(uid, conn_id)) {
            Ok(room) => room,
            Err(rejection) => {
                self.reply(conn_id, &nack(rejection.reason().to_string()));
                return Ok(());
            }
        };

        self.reply(
            conn_id,
            &EnterRoomAck {
                ok: true,
                reason: String::new(),
                roomid: request.roomid,
            },
        );
        if room.is_all_ready() {
            self.rooms.start_battle(request.roomid);
        }
        Ok(())
    }

    pub fn ready(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let request: ReadyRequest = self.parse(conn_id, payload, |reason| ReadyAck {
            roomid: 0,
            uid: 0,
            ready: false,
            ok: false,
            reason,
        })?;

        let Some(uid) = self.session_user(conn_id) else {
            self.reply(
                conn_id,
                &ReadyAck {
                    roomid: request.roomid,
                    uid: 0,
                    ready: request.ready,
                    ok: false,
                    reason: NOT_LOGGED_IN.to_string(),
                },
            );
            return Err(HandlerError::NotLoggedIn(conn_id));
        };
        let nack = |reason: &str| ReadyAck {
            roomid: request.roomid,
            uid,
            ready: request.ready,
            ok: false,
            reason: reason.to_string(),
        };

        let Some(room) = self.rooms.get_room(request.roomid) else {
            self.reply(conn_id, &nack("room not found"));
            return Err(HandlerError::RoomNotFound(request.roomid));
        };
        if !room.set_ready(uid, request.ready) {
            self.reply(conn_id, &nack("not a member of this room"));
            return Ok(());
        }

        self.reply(
            conn_id,
            &ReadyAck {
                roomid: request.roomid,
                uid,
                ready: request.ready,
                ok: true,
                reason: String::new(),
            },
        );
        if room.is_all_ready() {
            self.rooms.start_battle(request.roomid);
        }
        Ok(())
    }

    pub fn battle_action(&self, conn_id: ConnectionId, payload: &[u8]) -> Result<(), HandlerError> {
        let action: BattleAction = decode_payload(payload)?;

        let uid = self
            .session_user(conn_id)
            .ok_or(HandlerError::NotLoggedIn(conn_id))?;
        let battle = self
            .rooms
            .get_battle(action.roomid)
            .ok_or(HandlerError::BattleNotFound(action.roomid))?;
        if !battle.is_member(uid) {
            return Err(HandlerError::NotInBattle {
                uid,
                room: action.roomid,
            });
        }
        let skill = skill(action.skill).ok_or(HandlerError::UnknownSkill(action.skill))?;

        battle.cast(uid, action.target, skill)?;

        let sync = BattleSync {
            roomid: action.roomid,
            states: battle.states(),
            timestamp: timestamp_ms(),
        };
        let payload = encode_payload(&sync)?;
        self.rooms
            .broadcast_room(action.roomid, MsgId::BattleSync, &payload);
        Ok(())
    }
}
