//! Error types surfaced by the server components.

use shared::{PayloadError, ProtocolError, RoomId, Uid};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is stopped")]
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no handler registered for message id {0}")]
    UnknownMessage(u16),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Failure of one handler invocation. Only that dispatch is aborted.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("failed to encode reply: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection {0} is not logged in")]
    NotLoggedIn(u64),

    #[error("room {0} does not exist")]
    RoomNotFound(RoomId),

    #[error("no running battle in room {0}")]
    BattleNotFound(RoomId),

    #[error("player {uid} is not part of the battle in room {room}")]
    NotInBattle { uid: Uid, room: RoomId },

    #[error("player {0} is not in the battle")]
    UnknownTarget(Uid),

    #[error("player {0} has no hp left")]
    Defeated(Uid),

    #[error("unknown skill {0}")]
    UnknownSkill(u32),

    #[error("skill needs {need} mp, caster has {have}")]
    InsufficientMana { need: u32, have: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no record for player {0}")]
    NotFound(Uid),

    #[error("unknown attribute field `{0}`")]
    UnknownField(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            DispatchError::UnknownMessage(9999).to_string(),
            "no handler registered for message id 9999"
        );
        assert_eq!(
            HandlerError::InsufficientMana { need: 20, have: 5 }.to_string(),
            "skill needs 20 mp, caster has 5"
        );
        assert_eq!(SchedulerError::Stopped.to_string(), "scheduler is stopped");
    }

    #[test]
    fn test_scheduler_error_converts_into_dispatch_error() {
        let err: DispatchError = SchedulerError::Stopped.into();
        assert_eq!(err, DispatchError::Scheduler(SchedulerError::Stopped));
    }
}
