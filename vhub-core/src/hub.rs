//! The device facade.
//!
//! [`VideoHub`] glues the layers together through the event dispatcher:
//!
//! ```text
//! NewData ──► frame decoder ──► NewBlock ──► DeviceState
//!                          └──► CommandAck ──► CommandQueue
//! AfterConnect ──► queue.pump()
//! AfterDisconnect ──► in-flight command fails, decoder reset
//! ```
//!
//! Handlers hold only weak references to the dispatcher and queue; the
//! hub unsubscribes them when dropped.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::watch;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::block::Frame;
use crate::codec::BlockCodec;
use crate::command::{Command, CommandTicket};
use crate::error::HubError;
use crate::event::{EventDispatcher, EventKind, HubEvent, SubscriptionId};
use crate::message::BlockTitle;
use crate::network::{
    ConnectOptions, Connection, ConnectionInfo, Dialer, LivenessProbe, LoopExit, PingProbe,
    TcpDialer,
};
use crate::queue::CommandQueue;
use crate::state::{DeviceState, DeviceUpdate, RouteRequest, StatusSnapshot};
use crate::sync::{lock, read, write};

/// Accumulates `NewData` chunks until whole frames can be cut.
#[derive(Default)]
struct FrameBuffer {
    codec: BlockCodec,
    buf: BytesMut,
}

impl FrameBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<Result<Frame, HubError>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                // The codec already dropped the bad bytes.
                Err(e) => frames.push(Err(e)),
            }
        }
        frames
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

pub struct VideoHub {
    events: Arc<EventDispatcher>,
    conn: Arc<Connection>,
    queue: Arc<CommandQueue>,
    state: Arc<RwLock<DeviceState>>,
    prelude: Arc<watch::Sender<bool>>,
    subscriptions: Vec<SubscriptionId>,
}

impl VideoHub {
    /// Hub talking plain TCP with the ping liveness probe.
    pub fn new(info: ConnectionInfo, options: ConnectOptions) -> Self {
        Self::with_transport(info, options, Arc::new(TcpDialer), Arc::new(PingProbe))
    }

    pub fn with_transport(
        info: ConnectionInfo,
        options: ConnectOptions,
        dialer: Arc<dyn Dialer>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let events = Arc::new(EventDispatcher::new());
        let conn = Arc::new(
            Connection::new(info, options, Arc::clone(&events), probe).with_dialer(dialer),
        );
        let queue = Arc::new(CommandQueue::new(conn.clone()));
        let state = Arc::new(RwLock::new(DeviceState::new()));
        let (prelude, _) = watch::channel(false);

        let mut hub = Self {
            events,
            conn,
            queue,
            state,
            prelude: Arc::new(prelude),
            subscriptions: Vec::new(),
        };
        hub.install_handlers();
        hub
    }

    fn install_handlers(&mut self) {
        let frames = Arc::new(Mutex::new(FrameBuffer::default()));

        // Raw bytes -> frames.
        let weak_events: Weak<EventDispatcher> = Arc::downgrade(&self.events);
        let buffer = Arc::clone(&frames);
        let id = self.events.subscribe(&[EventKind::NewData], move |event| {
            let HubEvent::NewData(data) = event else {
                return;
            };
            let Some(events) = weak_events.upgrade() else {
                return;
            };
            let decoded = lock(&buffer).push(data);
            for frame in decoded {
                match frame {
                    Ok(Frame::Ack) => events.post(HubEvent::CommandAck { success: true }),
                    Ok(Frame::Nak) => events.post(HubEvent::CommandAck { success: false }),
                    Ok(Frame::Block(block)) => {
                        debug!(title = block.title(), fields = block.len(), "block");
                        events.post(HubEvent::NewBlock(block));
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                        events.post(HubEvent::DecodeFailed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        });
        self.subscriptions.push(id);

        // Blocks -> mirror.
        let state = Arc::clone(&self.state);
        let prelude = Arc::clone(&self.prelude);
        let id = self.events.subscribe(&[EventKind::NewBlock], move |event| {
            let HubEvent::NewBlock(block) = event else {
                return;
            };
            write(&state).apply(block);
            if block.known_title() == Some(BlockTitle::EndPrelude) {
                info!("initial state received");
                prelude.send_replace(true);
            }
        });
        self.subscriptions.push(id);

        // ACK/NAK -> queue.
        let weak_queue: Weak<CommandQueue> = Arc::downgrade(&self.queue);
        let weak_events = Arc::downgrade(&self.events);
        let id = self.events.subscribe(&[EventKind::CommandAck], move |event| {
            let HubEvent::CommandAck { success } = *event else {
                return;
            };
            let Some(queue) = weak_queue.upgrade() else {
                return;
            };
            if let Err(e) = queue.on_acknowledge(success) {
                warn!(error = %e, "acknowledgement with nothing in flight");
                if let Some(events) = weak_events.upgrade() {
                    events.post(HubEvent::UnexpectedAck { success });
                }
            }
        });
        self.subscriptions.push(id);

        let weak_queue = Arc::downgrade(&self.queue);
        let id = self.events.subscribe(&[EventKind::AfterConnect], move |_| {
            if let Some(queue) = weak_queue.upgrade() {
                queue.pump();
            }
        });
        self.subscriptions.push(id);

        let weak_queue = Arc::downgrade(&self.queue);
        let state = Arc::clone(&self.state);
        let prelude = Arc::clone(&self.prelude);
        let id = self.events.subscribe(&[EventKind::AfterDisconnect], move |_| {
            if let Some(queue) = weak_queue.upgrade() {
                queue.abandon_in_flight();
            }
            lock(&frames).reset();
            write(&state).prelude_complete = false;
            prelude.send_replace(false);
        });
        self.subscriptions.push(id);
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// A copy of the mirrored device state.
    pub fn state(&self) -> DeviceState {
        read(&self.state).clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        read(&self.state).snapshot()
    }

    pub fn is_prelude_complete(&self) -> bool {
        *self.prelude.borrow()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), HubError> {
        self.conn.connect().await
    }

    pub fn disconnect(&self) -> bool {
        self.conn.disconnect()
    }

    /// Run the receive loop for the current session.
    pub async fn run(&self) -> Result<LoopExit, HubError> {
        self.conn.run_loop_forever().await
    }

    pub fn poll_once(&self) -> Result<usize, HubError> {
        self.conn.poll_once()
    }

    /// Wait until the device has sent `END PRELUDE` on this session.
    pub async fn wait_for_prelude(&self, timeout: Duration) -> Result<(), HubError> {
        let mut rx = self.prelude.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .map_err(|_| HubError::Timeout(timeout))?
            .map_err(|_| HubError::ChannelClosed)?;
        Ok(())
    }

    // ── Mutations ────────────────────────────────────────────────
    //
    // None of these touch the mirror: it changes only when the device
    // reports the new state.

    /// Enqueue a caller-built command.
    pub fn submit(&self, command: Command) -> CommandTicket {
        self.queue.enqueue(command)
    }

    pub fn route(&self, mapping: impl IntoIterator<Item = (u32, u32)>) -> CommandTicket {
        self.submit(Command::route(mapping))
    }

    pub fn route_one(&self, destination: u32, source: u32) -> CommandTicket {
        self.route([(destination, source)])
    }

    pub fn apply_route(&self, request: RouteRequest) -> CommandTicket {
        self.route_one(request.destination, request.source)
    }

    pub fn set_input_labels<L: Into<String>>(
        &self,
        labels: impl IntoIterator<Item = (u32, L)>,
    ) -> CommandTicket {
        self.submit(Command::input_labels(labels))
    }

    pub fn set_output_labels<L: Into<String>>(
        &self,
        labels: impl IntoIterator<Item = (u32, L)>,
    ) -> CommandTicket {
        self.submit(Command::output_labels(labels))
    }

    pub fn set_locks(&self, locks: impl IntoIterator<Item = (u32, bool)>) -> CommandTicket {
        self.submit(Command::locks(locks))
    }

    pub fn enable_locks(&self, ports: impl IntoIterator<Item = u32>) -> CommandTicket {
        self.set_locks(ports.into_iter().map(|port| (port, true)))
    }

    pub fn disable_locks(&self, ports: impl IntoIterator<Item = u32>) -> CommandTicket {
        self.set_locks(ports.into_iter().map(|port| (port, false)))
    }

    /// One command per non-empty section, in label, label, lock order.
    pub fn apply_update(&self, update: DeviceUpdate) -> Vec<CommandTicket> {
        let DeviceUpdate {
            input_labels,
            output_labels,
            locks,
        } = update;
        let mut tickets = Vec::new();
        if !input_labels.is_empty() {
            tickets.push(self.set_input_labels(input_labels));
        }
        if !output_labels.is_empty() {
            tickets.push(self.set_output_labels(output_labels));
        }
        if !locks.is_empty() {
            tickets.push(self.set_locks(locks));
        }
        tickets
    }
}

impl Drop for VideoHub {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.events.unsubscribe(id, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;

    use super::*;

    fn hub() -> VideoHub {
        VideoHub::new(
            ConnectionInfo::new("127.0.0.1", 1),
            ConnectOptions::default(),
        )
    }

    fn feed(hub: &VideoHub, data: &'static [u8]) {
        hub.events().post(HubEvent::NewData(Bytes::from_static(data)));
    }

    #[test]
    fn new_data_is_decoded_across_chunks() {
        let hub = hub();
        feed(&hub, b"INPUT LABELS:\n0 Cam");
        assert!(hub.state().input_labels.is_empty());
        feed(&hub, b"era 1\n1 Camera 2\n\nVIDEO OUTPUT ROUTING:\n3 1\n\n");
        let state = hub.state();
        assert_eq!(state.input_labels.get(&0).unwrap(), "Camera 1");
        assert_eq!(state.input_labels.get(&1).unwrap(), "Camera 2");
        assert_eq!(state.routes.get(&3), Some(&1));
    }

    #[test]
    fn stray_ack_is_reported() {
        let hub = hub();
        let (_, mut rx) = hub.events().channel(&[EventKind::UnexpectedAck]);
        feed(&hub, b"NAK\n\n");
        assert_eq!(rx.try_recv().unwrap(), HubEvent::UnexpectedAck { success: false });
        assert!(!hub.queue().is_in_flight());
    }

    #[test]
    fn bad_frames_post_decode_failures_and_decoding_continues() {
        let hub = hub();
        let (_, mut rx) = hub.events().channel(&[EventKind::DecodeFailed]);
        hub.events().post(HubEvent::NewData(Bytes::from(
            "OUTPUT LABELS:\n0 Écran\n\nOUTPUT LABELS:\n1 Monitor\n\n".as_bytes(),
        )));
        assert!(matches!(rx.try_recv(), Ok(HubEvent::DecodeFailed { .. })));
        assert_eq!(hub.state().output_labels.get(&1).unwrap(), "Monitor");
        assert!(!hub.state().output_labels.contains_key(&0));
    }

    #[tokio::test]
    async fn prelude_tracking() {
        let hub = hub();
        assert!(!hub.is_prelude_complete());
        let err = hub.wait_for_prelude(Duration::from_millis(10)).await;
        assert!(matches!(err, Err(HubError::Timeout(_))));

        feed(&hub, b"END PRELUDE:\n\n");
        tokio_test::assert_ok!(hub.wait_for_prelude(Duration::from_millis(10)).await);
        assert!(hub.state().prelude_complete);

        hub.events().post(HubEvent::AfterDisconnect);
        assert!(!hub.is_prelude_complete());
    }

    #[test]
    fn mutations_leave_the_mirror_alone() {
        let hub = hub();
        let _ = hub.route_one(0, 4);
        let _ = hub.enable_locks([1, 2]);
        let tickets = hub.apply_update(DeviceUpdate {
            input_labels: BTreeMap::from([(0, "VT".to_string())]),
            ..DeviceUpdate::default()
        });
        assert_eq!(tickets.len(), 1);
        assert_eq!(hub.state(), DeviceState::new());
        // Not connected: everything waits in the backlog.
        assert_eq!(hub.queue().backlog_len(), 3);
    }

    #[test]
    fn drop_removes_handlers() {
        let hub = hub();
        let events = Arc::clone(hub.events());
        assert_eq!(events.handler_count(EventKind::NewData), 1);
        drop(hub);
        for kind in EventKind::ALL {
            assert_eq!(events.handler_count(kind), 0, "{kind}");
        }
    }
}
