//! # Arena Server Library
//!
//! This library provides the session server for the multiplayer arena. It
//! accepts many concurrent TCP clients, frames the length-prefixed binary
//! protocol from the `shared` crate, routes requests to business handlers, and
//! runs the lobby-to-battle lifecycle that keeps every fighter in a room in
//! sync.
//!
//! ## Core Responsibilities
//!
//! ### Connection Handling
//! Every socket gets its own read loop, an ordered outbound queue with a
//! single write in flight, and a heartbeat that drops clients after repeated
//! silence. Protocol violations close the offending connection only.
//!
//! ### Ordered Request Processing
//! Decoded frames are handed to a pool of scheduler threads. Requests from one
//! connection always land on the same worker, so each client observes its own
//! requests being handled in the order it sent them, while different clients
//! are served in parallel.
//!
//! ### Rooms and Battles
//! Players gather in rooms; once a room is full and everyone is ready a
//! battle starts. The battle pushes a state snapshot to its members at a fixed
//! tick and ends as soon as at most one fighter is left standing.
//!
//! ## Architecture Design
//!
//! ### Runtime Split
//! Socket I/O and timers run on the tokio runtime. Handlers run on plain OS
//! threads owned by the [`scheduler::Scheduler`]. Writes and timers started
//! from handler threads are spawned onto the runtime through a stored
//! [`tokio::runtime::Handle`].
//!
//! ### Explicit Wiring
//! There are no global singletons. [`network::Server`] builds the scheduler,
//! registries, dispatcher and stores and hands them around as `Arc`s.
//!
//! ## Module Organization
//!
//! ### Scheduler (`scheduler`) and Timer (`timer`)
//! Affinity-keyed worker pool and the cancellable repeating timer used by
//! heartbeats and battle ticks.
//!
//! ### Connection (`connection`, `connection_registry`)
//! Per-socket framing, ordered writes and heartbeats, plus the lookup tables
//! from connection id and from user id to live connections.
//!
//! ### Dispatch (`dispatcher`, `handlers`)
//! Message-id routing onto the scheduler and the request handlers themselves.
//!
//! ### Game State (`room`, `battle`, `room_registry`)
//! Lobby aggregate, live combat state and their owner.
//!
//! ### Storage (`store`)
//! Attribute and account storage traits with in-memory implementations.

pub mod battle;
pub mod config;
pub mod connection;
pub mod connection_registry;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod network;
pub mod room;
pub mod room_registry;
pub mod scheduler;
pub mod store;
pub mod timer;
pub mod utils;

pub use config::ServerConfig;
pub use network::Server;
