//! Server-Sent Events broadcast with bounded replay and liveness-driven
//! cleanup.
//!
//! This crate provides the one-to-many broadcast primitive behind a live SSE
//! endpoint: per-client connections with heartbeat and idle-timeout
//! management, topic channels that fan events out to every member, and a
//! bounded in-memory history that replays missed events to reconnecting
//! clients.
//!
//! # Architecture
//!
//! - **Connection per transport**: each accepted request gets one
//!   [`Connection`] plus a [`ConnectionBody`] handed to the HTTP layer as the
//!   streaming response. Dropping the body (the client went away) fires the
//!   connection's terminal signal exactly once.
//! - **Channel per topic**: a [`Channel`] owns the member set and a bounded,
//!   ordered history of identified events. Members remove themselves on
//!   their terminal signal; a reconnecting client supplying `last-event-id`
//!   has everything strictly newer replayed before it rejoins the live set.
//! - **Liveness-keyed storage**: [`LivenessCollection`] maps keys to any
//!   [`Closable`] entity (connections, channels) and drops an entry when its
//!   entity terminates, without leaking observers across overwrites.
//! - **Ephemeral history**: replay is bounded and process-memory-resident; a
//!   restart loses all retained events by design.
//!
//! # Message flow
//!
//! 1. A handler accepts the request and builds a `Connection` from the
//!    request headers
//! 2. `Channel::add` replays missed history, then registers the member
//! 3. Publishers call `Channel::send`; every member receives every event in
//!    send order
//! 4. The client disconnects; the body drops, the terminal signal fires, and
//!    the channel removes the member
//! 5. The last departure arms the channel's idle timer; its owner observes
//!    the idle signal and decides whether to drop the channel
//!
//! # Example: an Axum handler
//!
//! ```rust,ignore
//! use sse_broadcast::{Channel, Connection, ConnectionOptions, Event};
//!
//! async fn events(
//!     State(channel): State<Arc<Channel>>,
//!     headers: HeaderMap,
//! ) -> impl IntoResponse {
//!     let (connection, body) = Connection::new(
//!         &headers,
//!         ConnectionOptions { ping: true, ..Default::default() },
//!     )?;
//!     channel.add(&connection);
//!     body
//! }
//!
//! // Elsewhere, after a resource changes
//! channel.send(&Event::new().event("update").id(seq).json_data(&change)?);
//! ```
//!
//! # Modules
//!
//! - `message`: event values and their wire encoding
//! - `connection`: per-client stream, heartbeat/idle timers, terminal signal
//! - `channel`: broadcast fan-out and bounded replay history
//! - `collection`: keyed storage with automatic removal on termination
//! - `closable`: the shared terminal-signal trait

pub mod channel;
pub mod closable;
pub mod collection;
pub mod connection;
pub mod error;
pub mod message;

pub use channel::{Channel, ChannelOptions, DEFAULT_HISTORY_SIZE};
pub use closable::Closable;
pub use collection::LivenessCollection;
pub use connection::{
    Connection, ConnectionBody, ConnectionId, ConnectionOptions, DEFAULT_PING_INTERVAL,
};
pub use error::Error;
pub use message::Event;
