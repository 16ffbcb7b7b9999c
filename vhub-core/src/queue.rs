//! Backlog + single in-flight slot.
//!
//! The protocol has no request ids: an `ACK`/`NAK` always answers the
//! most recently transmitted command. The queue therefore keeps at most
//! one command on the wire and releases the next one only when the
//! current one is acknowledged. The backlog is drained in FIFO order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::command::{Command, CommandOutcome, CommandTicket};
use crate::error::HubError;
use crate::sync::lock;

/// Sink for serialized command frames.
///
/// Implementations must not block: they are called with the queue lock
/// held.
pub trait Transmit: Send + Sync {
    fn transmit(&self, frame: Bytes) -> Result<(), HubError>;
}

struct Pending {
    command: Command,
    frame: Bytes,
}

#[derive(Default)]
struct QueueInner {
    backlog: VecDeque<Pending>,
    in_flight: Option<Pending>,
}

pub struct CommandQueue {
    transport: Arc<dyn Transmit>,
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new(transport: Arc<dyn Transmit>) -> Self {
        Self {
            transport,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Append `command` to the backlog and try to send it.
    ///
    /// A command that cannot be rendered is failed immediately and never
    /// reaches the backlog.
    pub fn enqueue(&self, mut command: Command) -> CommandTicket {
        let ticket = command.ticket();
        match command.serialize() {
            Ok(frame) => {
                debug!(title = command.title(), "enqueue");
                lock(&self.inner).backlog.push_back(Pending { command, frame });
                self.pump();
            }
            Err(e) => {
                warn!(title = command.title(), error = %e, "dropping invalid command");
                command.resolve(CommandOutcome::Invalid(e.to_string()));
            }
        }
        ticket
    }

    /// Transmit the next backlog entry if nothing is in flight.
    pub fn pump(&self) {
        let mut inner = lock(&self.inner);
        if inner.in_flight.is_some() {
            return;
        }
        let Some(next) = inner.backlog.pop_front() else {
            return;
        };
        match self.transport.transmit(next.frame.clone()) {
            Ok(()) => {
                debug!(title = next.command.title(), backlog = inner.backlog.len(), "transmitted");
                inner.in_flight = Some(next);
            }
            Err(e) => {
                debug!(title = next.command.title(), error = %e, "transmit deferred");
                inner.backlog.push_front(next);
            }
        }
    }

    /// Resolve the in-flight command with the device's answer.
    ///
    /// Fails with [`HubError::UnexpectedAck`], leaving the queue
    /// untouched, when nothing is in flight.
    pub fn on_acknowledge(&self, success: bool) -> Result<(), HubError> {
        let pending = lock(&self.inner).in_flight.take();
        let Some(pending) = pending else {
            return Err(HubError::UnexpectedAck { success });
        };
        debug!(title = pending.command.title(), success, "acknowledged");
        let outcome = if success {
            CommandOutcome::Acknowledged
        } else {
            CommandOutcome::Rejected
        };
        pending.command.resolve(outcome);
        self.pump();
        Ok(())
    }

    /// Fail the in-flight command because its answer can no longer
    /// arrive. The backlog is kept for the next connection.
    pub fn abandon_in_flight(&self) {
        let pending = lock(&self.inner).in_flight.take();
        if let Some(pending) = pending {
            warn!(title = pending.command.title(), "connection lost with command in flight");
            pending.command.resolve(CommandOutcome::ConnectionLost);
        }
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.inner).in_flight.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.inner).backlog.len()
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("CommandQueue")
            .field("backlog", &inner.backlog.len())
            .field("in_flight", &inner.in_flight.as_ref().map(|p| p.command.title()))
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Records frames; can be switched offline.
    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Bytes>>,
        offline: AtomicBool,
    }

    impl Recorder {
        fn titles(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| {
                    let text = std::str::from_utf8(f).unwrap();
                    text.lines().next().unwrap().to_string()
                })
                .collect()
        }

        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl Transmit for Recorder {
        fn transmit(&self, frame: Bytes) -> Result<(), HubError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(HubError::NotConnected);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn queue() -> (Arc<Recorder>, CommandQueue) {
        let recorder = Arc::new(Recorder::default());
        let queue = CommandQueue::new(recorder.clone());
        (recorder, queue)
    }

    #[test]
    fn one_transmission_per_acknowledgement() {
        let (wire, queue) = queue();
        let _a = queue.enqueue(Command::input_labels([(0, "A")]));
        let _b = queue.enqueue(Command::output_labels([(0, "B")]));
        assert_eq!(wire.count(), 1);
        assert_eq!(queue.backlog_len(), 1);

        queue.pump();
        assert_eq!(wire.count(), 1, "pump with a command in flight is a no-op");

        queue.on_acknowledge(true).unwrap();
        assert_eq!(wire.count(), 2);
        queue.on_acknowledge(true).unwrap();
        assert_eq!(wire.count(), 2);
        assert!(!queue.is_in_flight());
        assert_eq!(wire.titles(), vec!["INPUT LABELS:", "OUTPUT LABELS:"]);
    }

    #[test]
    fn backlog_is_fifo() {
        let (wire, queue) = queue();
        wire.offline.store(true, Ordering::SeqCst);
        for port in 0..3 {
            let _ = queue.enqueue(Command::route([(port, port)]));
        }
        assert_eq!(queue.backlog_len(), 3);
        assert_eq!(wire.count(), 0);

        wire.offline.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            queue.pump();
            queue.on_acknowledge(true).unwrap();
        }
        let frames = wire.frames.lock().unwrap();
        let bodies: Vec<&[u8]> = frames.iter().map(|f| &f[..]).collect();
        assert_eq!(
            bodies,
            vec![
                &b"VIDEO OUTPUT ROUTING:\n0 0\n\n"[..],
                &b"VIDEO OUTPUT ROUTING:\n1 1\n\n"[..],
                &b"VIDEO OUTPUT ROUTING:\n2 2\n\n"[..],
            ]
        );
    }

    #[test]
    fn ack_without_in_flight_is_reported() {
        let (wire, queue) = queue();
        let err = queue.on_acknowledge(true).unwrap_err();
        assert!(matches!(err, HubError::UnexpectedAck { success: true }));
        assert!(!queue.is_in_flight());
        assert_eq!(queue.backlog_len(), 0);
        assert_eq!(wire.count(), 0);
    }

    #[test]
    fn callbacks_fire_once_per_command() {
        let (_wire, queue) = queue();
        let ok = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let ok = ok.clone();
            let failed = failed.clone();
            let _ = queue.enqueue(
                Command::locks([(1, true)])
                    .on_success(move || {
                        ok.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_failure(move || {
                        failed.fetch_add(1, Ordering::SeqCst);
                    }),
            );
        }
        queue.on_acknowledge(true).unwrap();
        queue.on_acknowledge(false).unwrap();
        assert!(queue.on_acknowledge(true).is_err());
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_enqueue_follow_up() {
        let (wire, queue) = queue();
        let queue = Arc::new(queue);
        let q = Arc::downgrade(&queue);
        let _ = queue.enqueue(Command::route([(0, 1)]).on_success(move || {
            if let Some(q) = q.upgrade() {
                let _ = q.enqueue(Command::route([(0, 2)]));
            }
        }));
        queue.on_acknowledge(true).unwrap();
        assert_eq!(wire.count(), 2);
        assert!(queue.is_in_flight());
    }

    #[tokio::test]
    async fn invalid_command_fails_without_transmitting() {
        let (wire, queue) = queue();
        let ticket = queue.enqueue(Command::input_labels([(0, "two\nlines")]));
        assert!(matches!(ticket.wait().await, Err(HubError::InvalidCommand(_))));
        assert_eq!(wire.count(), 0);
        assert_eq!(queue.backlog_len(), 0);
    }

    #[tokio::test]
    async fn abandoned_command_reports_connection_lost() {
        let (wire, queue) = queue();
        let first = queue.enqueue(Command::route([(0, 1)]));
        let _second = queue.enqueue(Command::route([(1, 1)]));
        queue.abandon_in_flight();
        assert!(matches!(first.wait().await, Err(HubError::ConnectionLost)));
        assert_eq!(queue.backlog_len(), 1);
        assert_eq!(wire.count(), 1);
    }
}
