//! One client's outbound event stream and its liveness management.
//!
//! A [`Connection`] wraps the server half of a single SSE response: it owns
//! the outbound write channel, the heartbeat and idle-timeout timers, and the
//! terminal close signal. The paired [`ConnectionBody`] is handed to the HTTP
//! layer as the response body; dropping it (the transport closed) tears the
//! connection down and fires the close signal exactly once.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use async_stream::stream;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::closable::{Closable, CloseSignal};
use crate::error::Error;
use crate::message::Event;

/// Heartbeat interval used when `ping` is requested without an explicit value.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(50);

const LAST_EVENT_ID: &str = "last-event-id";

/// Construction-time connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Arm the heartbeat timer at construction.
    pub ping: bool,
    /// Heartbeat interval, used only when `ping` is set.
    pub ping_interval: Duration,
    /// Idle-close timeout; `None` leaves the timer disarmed.
    pub timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            ping: false,
            ping_interval: DEFAULT_PING_INTERVAL,
            timeout: None,
        }
    }
}

/// Unique identifier for a connection (server-generated).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

struct Timers {
    ping: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
}

type TimeoutHandler = Arc<dyn Fn() + Send + Sync>;

/// The server side of one client's SSE stream.
///
/// Created together with its [`ConnectionBody`]; membership in channels is by
/// shared reference (`Arc`), the transport itself is exclusively owned here.
pub struct Connection {
    id: ConnectionId,
    last_event_id: Option<String>,
    created_at: SystemTime,
    sender: UnboundedSender<String>,
    timers: Mutex<Timers>,
    timeout_handler: Mutex<Option<TimeoutHandler>>,
    close: CloseSignal,
}

impl Connection {
    /// Accept a client handshake.
    ///
    /// Extracts the `last-event-id` reconnection header (only when it occurs
    /// exactly once), arms timers per `options`, and returns the connection
    /// together with the response body to hand to the HTTP layer. Response
    /// status and SSE headers are fixed by [`ConnectionBody::into_response`].
    ///
    /// Fails with [`Error::InvalidArgument`] when `ping` is requested with an
    /// interval shorter than one millisecond.
    pub fn new(
        headers: &HeaderMap,
        options: ConnectionOptions,
    ) -> Result<(Arc<Self>, ConnectionBody), Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            id: ConnectionId::new(),
            last_event_id: single_header_value(headers, LAST_EVENT_ID),
            created_at: SystemTime::now(),
            sender: tx,
            timers: Mutex::new(Timers {
                ping: None,
                idle: None,
            }),
            timeout_handler: Mutex::new(None),
            close: CloseSignal::new(),
        });
        debug!(
            "sse connection {} established (last_event_id: {:?})",
            connection.id.as_str(),
            connection.last_event_id
        );

        if options.ping {
            connection.set_ping(options.ping_interval)?;
        }
        if let Some(timeout) = options.timeout {
            connection.set_timeout(timeout);
        }

        let body = ConnectionBody::new(&connection, rx);
        Ok((connection, body))
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The client's last-seen event identifier, when supplied at connect time.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Write raw, pre-formatted protocol text to the transport.
    ///
    /// No-op once the connection is terminated. The outbound channel is
    /// unbounded: slow consumers buffer in memory rather than exerting
    /// backpressure or being dropped. A failed write means the transport is
    /// gone and is handled through the close path, never surfaced to the
    /// caller.
    pub fn write(&self, raw: impl Into<String>) {
        if self.close.is_fired() {
            return;
        }
        if self.sender.send(raw.into()).is_err() {
            warn!(
                "sse connection {} write failed, treating transport as closed",
                self.id.as_str()
            );
            self.shutdown();
        }
    }

    /// Serialize `event` into the event-stream wire format and write it.
    pub fn send(&self, event: &Event) {
        self.write(event.to_string());
    }

    /// Rearm the heartbeat timer.
    ///
    /// Writes a zero-length comment frame every `interval` to keep
    /// intermediaries from closing an idle connection. Any previous heartbeat
    /// timer is cancelled, so exactly one is active afterwards. Fails with
    /// [`Error::InvalidArgument`] for intervals shorter than one millisecond,
    /// in which case the previous timer is left untouched.
    pub fn set_ping(self: &Arc<Self>, interval: Duration) -> Result<(), Error> {
        if interval < Duration::from_millis(1) {
            return Err(Error::InvalidArgument(format!(
                "ping interval must be at least 1ms, got {:?}",
                interval
            )));
        }
        let mut timers = self.timers.lock().unwrap();
        if let Some(handle) = timers.ping.take() {
            handle.abort();
        }
        if self.close.is_fired() {
            return Ok(());
        }
        let sender = self.sender.clone();
        let heartbeat = Event::new().comment("").to_string();
        timers.ping = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.send(heartbeat.clone()).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Rearm the idle-close timer; `Duration::ZERO` disarms it.
    ///
    /// When the timer fires, a handler registered via
    /// [`on_timeout`](Self::on_timeout) is invoked and solely decides
    /// whether to end the connection; with no handler the connection is
    /// ended automatically. The out-of-range inputs of loosely typed
    /// runtimes (negative, non-finite) are unrepresentable in `Duration`,
    /// so rearming cannot fail.
    pub fn set_timeout(self: &Arc<Self>, timeout: Duration) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(handle) = timers.idle.take() {
            handle.abort();
        }
        if timeout.is_zero() || self.close.is_fired() {
            return;
        }
        let connection = Arc::downgrade(self);
        timers.idle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = connection.upgrade() else {
                return;
            };
            // Clone the handler out so it runs without the lock held; a
            // handler is free to call `on_timeout` or `set_timeout` itself.
            let handler = connection.timeout_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler();
            } else {
                debug!(
                    "sse connection {} idle timeout, closing",
                    connection.id.as_str()
                );
                connection.shutdown();
            }
        }));
    }

    /// Register the idle-timeout handler.
    ///
    /// Once registered, a firing idle timer invokes the handler instead of
    /// closing the connection; ending it (typically via [`end`](Self::end))
    /// becomes the handler's responsibility.
    pub fn on_timeout(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.timeout_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// End the connection: disarm all timers, fire the terminal signal, and
    /// let the response body run to completion. Idempotent.
    pub async fn end(&self) {
        self.shutdown();
    }

    /// Terminal path shared by `end`, the idle timer, failed writes, and the
    /// body-drop guard. Timers are always disarmed; the close signal fires
    /// exactly once no matter how many of those race.
    fn shutdown(&self) {
        {
            let mut timers = self.timers.lock().unwrap();
            if let Some(handle) = timers.ping.take() {
                handle.abort();
            }
            if let Some(handle) = timers.idle.take() {
                handle.abort();
            }
        }
        if self.close.fire() {
            debug!("sse connection {} closed", self.id.as_str());
        }
    }
}

#[async_trait]
impl Closable for Connection {
    fn is_closed(&self) -> bool {
        self.close.is_fired()
    }

    async fn closed(&self) {
        self.close.fired().await;
    }
}

/// `last-event-id` must be single-valued; a repeated header disables replay.
fn single_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let mut values = headers.get_all(name).iter();
    let first = values.next()?;
    if values.next().is_some() {
        return None;
    }
    first.to_str().ok().map(str::to_owned)
}

/// Tears the connection down when the HTTP layer drops the response body.
struct CloseOnDrop(Arc<Connection>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// The streaming response body paired with a [`Connection`].
///
/// Yields the raw frames written to the connection. Converting it into a
/// response commits status 200 and the SSE headers immediately, before any
/// event is produced.
pub struct ConnectionBody {
    stream: Pin<Box<dyn Stream<Item = Result<String, Infallible>> + Send>>,
}

impl ConnectionBody {
    fn new(connection: &Arc<Connection>, mut rx: UnboundedReceiver<String>) -> Self {
        let guard = CloseOnDrop(connection.clone());
        let mut closed = connection.close.subscribe();
        let stream = stream! {
            let _guard = guard;
            loop {
                let chunk = tokio::select! {
                    chunk = rx.recv() => chunk,
                    _ = closed.wait_for(|fired| *fired) => None,
                };
                match chunk {
                    Some(chunk) => yield Ok(chunk),
                    None => break,
                }
            }
        };
        Self {
            stream: Box::pin(stream),
        }
    }
}

impl Stream for ConnectionBody {
    type Item = Result<String, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl IntoResponse for ConnectionBody {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [
                ("content-type", "text/event-stream; charset=utf-8"),
                ("cache-control", "no-store,no-transform"),
                ("x-accel-buffering", "no"),
                ("connection", "keep-alive"),
            ],
            Body::from_stream(self),
        )
            .into_response()
    }
}
