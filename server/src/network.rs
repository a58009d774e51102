//! Server network layer: TCP accept loop and service wiring

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionContext};
use crate::connection_registry::ConnectionRegistry;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::handlers::GameHandlers;
use crate::room_registry::RoomRegistry;
use crate::scheduler::Scheduler;
use crate::store::{AttributeStore, AuthStore, MemoryAttributeStore, MemoryAuthStore};
use log::{debug, error, info};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;

/// Main server owning the listener and every shared service
pub struct Server {
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    rooms: Arc<RoomRegistry>,
    ctx: ConnectionContext,
}

impl Server {
    /// Binds with in-memory stores
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with_stores(
            config,
            Arc::new(MemoryAttributeStore::new()),
            Arc::new(MemoryAuthStore::new()),
        )
        .await
    }

    pub async fn bind_with_stores(
        config: ServerConfig,
        attrs: Arc<dyn AttributeStore>,
        auth: Arc<dyn AuthStore>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let runtime = Handle::current();
        let scheduler = Arc::new(Scheduler::new(config.workers)?);
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&scheduler),
            Arc::clone(&registry),
        ));
        let rooms = Arc::new(RoomRegistry::new(
            Arc::clone(&registry),
            Arc::clone(&attrs),
            runtime.clone(),
            &config,
        ));
        rooms.watch_releases();

        let handlers = Arc::new(GameHandlers::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            attrs,
            auth,
        ));
        handlers.register_all(&dispatcher);

        let ctx = ConnectionContext {
            registry: Arc::clone(&registry),
            scheduler: Arc::clone(&scheduler),
            dispatcher: Arc::clone(&dispatcher),
            runtime,
            heartbeat_period: config.heartbeat_period,
            max_missed_heartbeats: config.max_missed_heartbeats,
        };

        Ok(Server {
            listener,
            scheduler,
            registry,
            dispatcher,
            rooms,
            ctx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Accepts connections until the task is dropped
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("Server started successfully");

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle for {}: {}", addr, e);
                    }
                    Connection::spawn(stream, addr.to_string(), &self.ctx);
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Runs the accept loop until `signal` completes, then shuts down.
    pub async fn run_until<F: Future<Output = ()>>(&self, signal: F) -> Result<(), ServerError> {
        tokio::select! {
            result = self.run() => result?,
            _ = signal => info!("Server shutting down"),
        }
        self.shutdown();
        Ok(())
    }

    /// Stops battles, closes every connection and drains the scheduler.
    pub fn shutdown(&self) {
        self.rooms.stop_all();
        self.registry.close_all();
        self.scheduler.shutdown();
    }
}
