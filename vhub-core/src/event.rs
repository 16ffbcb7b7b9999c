//! Typed publish/subscribe used to decouple the transport from the
//! protocol layer built on top of it.
//!
//! Handlers run synchronously on the posting task, in registration
//! order. [`EventDispatcher::post`] iterates a snapshot of the handler
//! list taken when it starts, and never holds its lock while a handler
//! runs, so handlers may post further events or (un)subscribe freely:
//!
//! - a handler removed during a pass is still called for that pass;
//! - a handler added during a pass is first called on the next post.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::block::Block;
use crate::sync::lock;

// ── HubEvent ─────────────────────────────────────────────────────

/// Everything the connection and protocol layers announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// `connect()` started.
    BeforeConnect,
    /// A connect attempt failed; `attempt` is 0-based.
    BeforeConnectRetry { attempt: u32 },
    /// The transport is up.
    AfterConnect,
    /// Every connect attempt failed.
    ConnectFail,
    BeforeDisconnect,
    AfterDisconnect,
    /// Raw bytes read from the device.
    NewData(Bytes),
    /// A liveness probe is about to run.
    BeforeAck,
    /// The liveness probe succeeded.
    AfterAck,
    /// The liveness probe failed; the connection is being dropped.
    TimeoutAck,
    /// A decoded state report.
    NewBlock(Block),
    /// `ACK` (`success`) or `NAK` for the in-flight command.
    CommandAck { success: bool },
    /// `ACK`/`NAK` arrived with nothing in flight.
    UnexpectedAck { success: bool },
    /// A frame could not be decoded and was dropped.
    DecodeFailed { reason: String },
}

/// Discriminant of a [`HubEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeConnect,
    BeforeConnectRetry,
    AfterConnect,
    ConnectFail,
    BeforeDisconnect,
    AfterDisconnect,
    NewData,
    BeforeAck,
    AfterAck,
    TimeoutAck,
    NewBlock,
    CommandAck,
    UnexpectedAck,
    DecodeFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::BeforeConnect,
        EventKind::BeforeConnectRetry,
        EventKind::AfterConnect,
        EventKind::ConnectFail,
        EventKind::BeforeDisconnect,
        EventKind::AfterDisconnect,
        EventKind::NewData,
        EventKind::BeforeAck,
        EventKind::AfterAck,
        EventKind::TimeoutAck,
        EventKind::NewBlock,
        EventKind::CommandAck,
        EventKind::UnexpectedAck,
        EventKind::DecodeFailed,
    ];
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::BeforeConnect => EventKind::BeforeConnect,
            HubEvent::BeforeConnectRetry { .. } => EventKind::BeforeConnectRetry,
            HubEvent::AfterConnect => EventKind::AfterConnect,
            HubEvent::ConnectFail => EventKind::ConnectFail,
            HubEvent::BeforeDisconnect => EventKind::BeforeDisconnect,
            HubEvent::AfterDisconnect => EventKind::AfterDisconnect,
            HubEvent::NewData(_) => EventKind::NewData,
            HubEvent::BeforeAck => EventKind::BeforeAck,
            HubEvent::AfterAck => EventKind::AfterAck,
            HubEvent::TimeoutAck => EventKind::TimeoutAck,
            HubEvent::NewBlock(_) => EventKind::NewBlock,
            HubEvent::CommandAck { .. } => EventKind::CommandAck,
            HubEvent::UnexpectedAck { .. } => EventKind::UnexpectedAck,
            HubEvent::DecodeFailed { .. } => EventKind::DecodeFailed,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── EventDispatcher ──────────────────────────────────────────────

type Handler = Arc<dyn Fn(&HubEvent) + Send + Sync + 'static>;

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for each of `kinds`.
    pub fn subscribe<F>(&self, kinds: &[EventKind], handler: F) -> SubscriptionId
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        let mut handlers = lock(&self.handlers);
        for kind in kinds {
            handlers
                .entry(*kind)
                .or_default()
                .push((id, Arc::clone(&handler)));
        }
        id
    }

    /// Remove a subscription from `kinds`, or from every kind when
    /// `kinds` is empty.
    pub fn unsubscribe(&self, id: SubscriptionId, kinds: &[EventKind]) {
        let mut handlers = lock(&self.handlers);
        for (kind, list) in handlers.iter_mut() {
            if kinds.is_empty() || kinds.contains(kind) {
                list.retain(|(sub, _)| *sub != id);
            }
        }
    }

    /// Deliver `event` to every handler registered for its kind.
    pub fn post(&self, event: HubEvent) {
        let kind = event.kind();
        let snapshot: Vec<Handler> = lock(&self.handlers)
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        tracing::trace!(event = %kind, handlers = snapshot.len(), "post");
        for handler in snapshot {
            handler(&event);
        }
    }

    /// Forward events of `kinds` into an unbounded channel, for async
    /// consumers. The subscription ends when the receiver is dropped
    /// and the next matching event is posted.
    pub fn channel(
        self: &Arc<Self>,
        kinds: &[EventKind],
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<HubEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::default();
        let slot = Arc::clone(&id_slot);
        let id = self.subscribe(kinds, move |event| {
            if tx.send(event.clone()).is_err() {
                if let (Some(dispatcher), Some(id)) = (weak.upgrade(), *lock(&slot)) {
                    dispatcher.unsubscribe(id, &[]);
                }
            }
        });
        *lock(&id_slot) = Some(id);
        (id, rx)
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.handlers).get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = lock(&self.handlers);
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventDispatcher")
            .field("handlers", &counts)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
