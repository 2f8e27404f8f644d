//! Broadcast fan-out with bounded replay history.
//!
//! A [`Channel`] owns the member set for one logical topic plus a bounded,
//! ordered history of recently sent identified events. A (re)joining
//! connection that carries a `last-event-id` gets everything strictly newer
//! than that identifier replayed before it joins the live set, so no event
//! sent after `add` begins can arrive out of order relative to replay.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::task::JoinHandle;

use crate::closable::{Closable, CloseSignal};
use crate::connection::{Connection, ConnectionId};
use crate::message::{self, Event};

/// Retained identified events when no explicit size is configured.
pub const DEFAULT_HISTORY_SIZE: usize = 500;

/// Construction-time channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Maximum number of retained identified events; `0` disables history.
    pub history_size: usize,
    /// Delay before the idle signal fires after the last member departs;
    /// `Duration::ZERO` disables it.
    pub empty_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
            empty_timeout: Duration::ZERO,
        }
    }
}

struct ChannelInner {
    members: HashMap<ConnectionId, Arc<Connection>>,
    /// Per-member observer task on the connection's terminal signal,
    /// detached (aborted) when the member is removed explicitly.
    watchers: HashMap<ConnectionId, JoinHandle<()>>,
    /// Retained event identifiers, oldest first. Always consistent with
    /// `store` in membership and count.
    order: VecDeque<String>,
    store: HashMap<String, String>,
    idle_timer: Option<JoinHandle<()>>,
}

/// A broadcast topic: member connections plus bounded replay history.
///
/// The channel holds members by shared reference only; connection lifetime
/// belongs to the transport. Members remove themselves when their terminal
/// signal fires. The channel itself is never force-destroyed here: when the
/// last member departs and `empty_timeout` is set, the idle signal
/// ([`Closable`]) fires and the owner decides whether to drop the channel.
pub struct Channel {
    history_size: usize,
    empty_timeout: Duration,
    inner: Mutex<ChannelInner>,
    idle: CloseSignal,
}

impl Channel {
    pub fn new(options: ChannelOptions) -> Arc<Self> {
        Arc::new(Self {
            history_size: options.history_size,
            empty_timeout: options.empty_timeout,
            inner: Mutex::new(ChannelInner {
                members: HashMap::new(),
                watchers: HashMap::new(),
                order: VecDeque::new(),
                store: HashMap::new(),
                idle_timer: None,
            }),
            idle: CloseSignal::new(),
        })
    }

    /// Add a member, replaying missed history first.
    ///
    /// Cancels any pending idle timer. When the connection carries a
    /// `last-event-id`, the retained sequence is searched from the most
    /// recent end and every payload strictly after the match is written to
    /// the connection, in order, before it becomes a live member. An unknown
    /// identifier replays nothing: the client may be asking for an event
    /// older than the retained window.
    pub fn add(self: &Arc<Self>, connection: &Arc<Connection>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        self.idle.reset();

        if let Some(last_event_id) = connection.last_event_id() {
            if let Some(position) = inner.order.iter().rposition(|id| id == last_event_id) {
                let replayed = inner.order.len() - position - 1;
                for id in inner.order.iter().skip(position + 1) {
                    if let Some(payload) = inner.store.get(id) {
                        connection.write(payload.clone());
                    }
                }
                debug!(
                    "replayed {} retained events to connection {}",
                    replayed,
                    connection.id().as_str()
                );
            }
        }

        inner
            .members
            .insert(connection.id().clone(), connection.clone());

        let channel = Arc::downgrade(self);
        let member = connection.clone();
        let watcher = tokio::spawn(async move {
            member.closed().await;
            if let Some(channel) = channel.upgrade() {
                channel.remove(&member);
            }
        });
        if let Some(stale) = inner.watchers.insert(connection.id().clone(), watcher) {
            stale.abort();
        }
    }

    /// Remove a member, reporting whether it was present.
    ///
    /// When the removal empties the channel and `empty_timeout` is set, a
    /// one-shot timer is armed that fires the idle signal; any `add` before
    /// it fires cancels it.
    pub fn remove(self: &Arc<Self>, connection: &Connection) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(watcher) = inner.watchers.remove(connection.id()) {
            watcher.abort();
        }
        let removed = inner.members.remove(connection.id()).is_some();
        if removed && inner.members.is_empty() && !self.empty_timeout.is_zero() {
            let channel = Arc::downgrade(self);
            let empty_timeout = self.empty_timeout;
            inner.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(empty_timeout).await;
                if let Some(channel) = channel.upgrade() {
                    debug!("channel idle for {:?} with no members", empty_timeout);
                    channel.idle.fire();
                }
            }));
        }
        removed
    }

    /// Current member count.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().members.len()
    }

    /// Serialize `event` and fan it out to every member.
    ///
    /// Identified events are retained when history is enabled. Delivery is
    /// per-member FIFO in send-call order; there is no batching and no
    /// cancellation of an in-flight fan-out.
    pub fn send(&self, event: &Event) {
        let payload = event.to_string();
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = event.event_id() {
            if self.history_enabled() {
                self.retain(&mut inner, id, payload.clone());
            }
        }
        for member in inner.members.values() {
            member.write(payload.clone());
        }
    }

    /// Fan out a pre-formatted raw frame.
    ///
    /// When history is enabled, the identifier is extracted by scanning the
    /// text for a well-formed `id:` line; a frame that does not match is
    /// forwarded without retention.
    pub fn write(&self, raw: &str) {
        let mut inner = self.inner.lock().unwrap();
        if self.history_enabled() {
            if let Some(id) = message::extract_id(raw) {
                let id = id.to_string();
                self.retain(&mut inner, &id, raw.to_string());
            }
        }
        for member in inner.members.values() {
            member.write(raw);
        }
    }

    fn history_enabled(&self) -> bool {
        self.history_size > 0
    }

    /// Retain a payload under its identifier, deduplicating on insert: a
    /// re-sent identifier gives up its stale sequence slot before the new
    /// one is appended, so an identifier occupies at most one slot and
    /// `order` and `store` stay equal in count. Eviction is strict FIFO.
    fn retain(&self, inner: &mut ChannelInner, id: &str, payload: String) {
        if inner.store.insert(id.to_string(), payload).is_some() {
            if let Some(position) = inner.order.iter().position(|retained| retained == id) {
                inner.order.remove(position);
            }
        }
        inner.order.push_back(id.to_string());
        if inner.order.len() > self.history_size {
            if let Some(evicted) = inner.order.pop_front() {
                inner.store.remove(&evicted);
            }
        }
    }
}

#[async_trait]
impl Closable for Channel {
    fn is_closed(&self) -> bool {
        self.idle.is_fired()
    }

    async fn closed(&self) {
        self.idle.fired().await;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for (_, watcher) in inner.watchers.drain() {
            watcher.abort();
        }
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
    }
}
