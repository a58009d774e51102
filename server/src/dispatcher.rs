//! Routes decoded frames to message handlers.
//!
//! Handlers run on the scheduler keyed by connection id, so one client's
//! requests are handled strictly in arrival order while different clients are
//! served in parallel.

use crate::connection::ConnectionId;
use crate::connection_registry::ConnectionRegistry;
use crate::error::{DispatchError, HandlerError};
use crate::scheduler::Scheduler;
use log::{debug, warn};
use parking_lot::RwLock;
use shared::MsgId;
use std::collections::HashMap;
use std::sync::Arc;

pub type Handler =
    Arc<dyn Fn(ConnectionId, Vec<u8>) -> Result<(), HandlerError> + Send + Sync + 'static>;

pub struct Dispatcher {
    handlers: RwLock<HashMap<u16, Handler>>,
    scheduler: Arc<Scheduler>,
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<Scheduler>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            scheduler,
            registry,
        }
    }

    /// Installs the handler for `msg_id`, replacing any previous one.
    pub fn register<F>(&self, msg_id: MsgId, handler: F)
    where
        F: Fn(ConnectionId, Vec<u8>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.write().insert(msg_id.id(), Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Schedules the handler for one inbound frame.
    ///
    /// The connection's heartbeat is reset even when no handler matches.
    /// Handler failures are logged on the worker and never reach the caller.
    pub fn dispatch(
        &self,
        conn_id: ConnectionId,
        msg_id: u16,
        payload: Vec<u8>,
    ) -> Result<(), DispatchError> {
        self.registry.reset_heartbeat(conn_id);

        let handler = self
            .handlers
            .read()
            .get(&msg_id)
            .cloned()
            .ok_or(DispatchError::UnknownMessage(msg_id))?;

        debug!("Dispatching message {} from connection {}", msg_id, conn_id);
        self.scheduler.submit(conn_id, move || {
            if let Err(e) = handler(conn_id, payload) {
                warn!(
                    "Handler for message {} failed on connection {}: {}",
                    msg_id, conn_id, e
                );
            }
        })?;
        Ok(())
    }
}
