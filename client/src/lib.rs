//! # Arena Client Library
//!
//! A small framed TCP client for the arena server, used by the integration
//! tests and benchmarks to drive a real server end to end.
//!
//! ## Request/Response Pairing
//! Every request id maps to exactly one response id through
//! [`shared::MsgId::expected_response`]. [`network::Client::request`] sends a
//! typed request and waits for that paired response, refusing to decode
//! anything else.
//!
//! ## Server Pushes
//! Chat notices and battle start/sync/end updates arrive unsolicited. They are
//! queued separately and read with [`network::Client::next_push`] or
//! [`network::Client::next_push_of`], so they never get confused with the
//! answer to an outstanding request.

pub mod network;

pub use network::{Client, ClientError};
