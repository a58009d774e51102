//! One live client connection
//!
//! A connection owns its transport and runs three cooperating pieces:
//! - a read loop on the runtime that frames inbound bytes and hands every
//!   complete frame to the dispatcher
//! - an outbound FIFO with at most one write cycle in flight, so frames reach
//!   the socket whole and in the order they were queued
//! - a heartbeat timer that closes the connection after too many silent periods
//!
//! Closing is idempotent. The registry removal it triggers is queued on the
//! scheduler under the connection's own key, behind any of its requests still
//! waiting to be handled.

use crate::connection_registry::ConnectionRegistry;
use crate::dispatcher::Dispatcher;
use crate::scheduler::Scheduler;
use crate::timer::{RepeatingTimer, TimerControl};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{encode_message, FrameDecoder, Message, ProtocolError, Uid};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::runtime::Handle;
use tokio::sync::Notify;

pub type ConnectionId = u64;

const READ_CHUNK: usize = 8 * 1024;

/// Shared services every connection needs
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: Arc<Dispatcher>,
    pub runtime: Handle,
    pub heartbeat_period: Duration,
    pub max_missed_heartbeats: u32,
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Vec<u8>>,
    writing: bool,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Connection {
    id: ConnectionId,
    peer: String,
    user: Mutex<Option<Uid>>,
    missed_heartbeats: AtomicU32,
    closed: AtomicBool,
    outbound: Mutex<Outbound>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    shutdown: Notify,
    heartbeat: Mutex<Option<RepeatingTimer>>,
    runtime: Handle,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<Scheduler>,
}

impl Connection {
    /// Registers a freshly accepted transport and starts its read loop and heartbeat.
    pub fn spawn<T>(stream: T, peer: String, ctx: &ConnectionContext) -> Arc<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let id = ctx.registry.allocate_id();

        let conn = Arc::new(Connection {
            id,
            peer,
            user: Mutex::new(None),
            missed_heartbeats: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            outbound: Mutex::new(Outbound::default()),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            shutdown: Notify::new(),
            heartbeat: Mutex::new(None),
            runtime: ctx.runtime.clone(),
            registry: Arc::clone(&ctx.registry),
            scheduler: Arc::clone(&ctx.scheduler),
        });

        ctx.registry.add(Arc::clone(&conn));
        conn.arm_heartbeat(ctx.heartbeat_period, ctx.max_missed_heartbeats);

        let dispatcher = Arc::clone(&ctx.dispatcher);
        ctx.runtime.spawn(Arc::clone(&conn).read_loop(reader, dispatcher));

        info!("Connection {} accepted from {}", conn.id, conn.peer);
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Logged-in user, if any
    pub fn user(&self) -> Option<Uid> {
        *self.user.lock()
    }

    /// Records the logged-in user and returns the previous one.
    ///
    /// Callers normally go through [`ConnectionRegistry::bind_user`] so the
    /// user map stays in step.
    pub fn bind_user(&self, uid: Uid) -> Option<Uid> {
        self.user.lock().replace(uid)
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::SeqCst)
    }

    pub fn reset_heartbeat(&self) {
        self.missed_heartbeats.store(0, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames queued but not yet handed to the transport
    pub fn pending_frames(&self) -> usize {
        self.outbound.lock().queue.len()
    }

    /// Queues an encoded frame. A no-op once the connection is closed.
    pub fn send(self: &Arc<Self>, frame: Vec<u8>) {
        let start_cycle = {
            let mut outbound = self.outbound.lock();
            if self.is_closed() {
                return;
            }
            outbound.queue.push_back(frame);
            !std::mem::replace(&mut outbound.writing, true)
        };

        if start_cycle {
            self.runtime.spawn(Arc::clone(self).write_cycle());
        }
    }

    /// Encodes a typed record under its message id and queues it.
    pub fn send_message<M: Message>(self: &Arc<Self>, message: &M) -> Result<(), ProtocolError> {
        let frame = encode_message(message)?;
        self.send(frame);
        Ok(())
    }

    /// Tears the connection down. Later calls do nothing.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing connection {} ({})", self.id, self.peer);

        if let Some(timer) = self.heartbeat.lock().take() {
            timer.cancel();
        }
        self.outbound.lock().queue.clear();
        self.shutdown.notify_one();

        let conn = Arc::clone(self);
        self.runtime.spawn(async move {
            let mut writer = conn.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Transport shutdown for connection {} failed: {}", conn.id, e);
            }
        });

        // Keyed like the connection's handlers so it runs after any of them
        // still queued, and reads the user only once they are done
        let conn = Arc::clone(self);
        if let Err(e) = self.scheduler.submit(self.id, move || conn.release()) {
            warn!("Releasing connection {} inline: {}", self.id, e);
            self.release();
        }
    }

    fn release(&self) {
        self.registry.release(self.id, self.user());
    }

    fn arm_heartbeat(self: &Arc<Self>, period: Duration, max_missed: u32) {
        let weak: Weak<Connection> = Arc::downgrade(self);
        let timer = RepeatingTimer::start(&self.runtime, period, move || {
            let Some(conn) = weak.upgrade() else {
                return TimerControl::Stop;
            };
            let missed = conn.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
            if missed > max_missed {
                warn!(
                    "Connection {} missed {} heartbeats, closing",
                    conn.id, missed
                );
                conn.close();
                TimerControl::Stop
            } else {
                TimerControl::Continue
            }
        });
        *self.heartbeat.lock() = Some(timer);
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: ReadHalf<R>, dispatcher: Arc<Dispatcher>)
    where
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];

        'read: loop {
            let read = tokio::select! {
                _ = self.shutdown.notified() => break 'read,
                result = reader.read(&mut buf) => result,
            };

            match read {
                Ok(0) => {
                    debug!("Connection {} closed by peer", self.id);
                    break;
                }
                Ok(n) => {
                    decoder.extend(&buf[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => {
                                self.reset_heartbeat();
                                if let Err(e) =
                                    dispatcher.dispatch(self.id, frame.msg_id, frame.payload)
                                {
                                    warn!("Connection {}: {}", self.id, e);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Protocol violation on connection {}: {}", self.id, e);
                                break 'read;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Read error on connection {}: {}", self.id, e);
                    break;
                }
            }
        }

        self.close();
    }

    async fn write_cycle(self: Arc<Self>) {
        let mut writer = self.writer.lock().await;

        loop {
            let next = {
                let mut outbound = self.outbound.lock();
                match outbound.queue.pop_front() {
                    Some(frame) => frame,
                    None => {
                        outbound.writing = false;
                        break;
                    }
                }
            };

            if let Err(e) = writer.write_all(&next).await {
                warn!("Write to connection {} failed: {}", self.id, e);
                drop(writer);
                self.close();
                return;
            }
        }

        if let Err(e) = writer.flush().await {
            debug!("Flush on connection {} failed: {}", self.id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use shared::Frame;
    use tokio::io::DuplexStream;

    pub struct Harness {
        pub registry: Arc<ConnectionRegistry>,
        pub scheduler: Arc<Scheduler>,
        pub dispatcher: Arc<Dispatcher>,
        pub ctx: ConnectionContext,
    }

    impl Harness {
        /// Spawns a server-side connection over an in-memory pipe
        pub fn connect(&self) -> (Arc<Connection>, DuplexStream) {
            let (server_side, client_side) = tokio::io::duplex(64 * 1024);
            let conn = Connection::spawn(server_side, "duplex".to_string(), &self.ctx);
            (conn, client_side)
        }
    }

    pub fn harness(heartbeat_period: Duration, max_missed: u32) -> Harness {
        let scheduler = Arc::new(Scheduler::new(2).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&scheduler),
            Arc::clone(&registry),
        ));
        let ctx = ConnectionContext {
            registry: Arc::clone(&registry),
            scheduler: Arc::clone(&scheduler),
            dispatcher: Arc::clone(&dispatcher),
            runtime: Handle::current(),
            heartbeat_period,
            max_missed_heartbeats: max_missed,
        };
        Harness {
            registry,
            scheduler,
            dispatcher,
            ctx,
        }
    }

    /// Reads one frame from the client side of a pipe, failing after two seconds
    pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Frame {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(frame) = decoder.next_frame().unwrap() {
                    return frame;
                }
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "stream closed before a full frame arrived");
                decoder.extend(&buf[..n]);
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Polls `condition` until it holds or two seconds pass
    pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }
}
