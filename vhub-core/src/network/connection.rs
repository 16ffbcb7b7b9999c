//! Managed TCP connection to the device.
//!
//! A [`Connection`] owns the socket for one session at a time:
//!
//! - writes go through a background writer task fed by a channel, so
//!   frames never interleave and callers never block;
//! - the read half is owned by exactly one reader, either the receive
//!   loop ([`Connection::run_loop_forever`]) or a single-shot
//!   [`Connection::poll_once`];
//! - every session carries a cancellation token, so `disconnect()` from
//!   any task unblocks a pending read.
//!
//! Everything observable is announced through the [`EventDispatcher`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::event::{EventDispatcher, HubEvent};
use crate::message::DEFAULT_PORT;
use crate::network::probe::{LivenessProbe, ProbeLink};
use crate::queue::Transmit;
use crate::state::ConnectionPhase;
use crate::sync::lock;

const READ_CHUNK: usize = 4096;

// ── ConnectionInfo ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Target on the default control port.
    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_PORT)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── ConnectOptions ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Dial attempts before `connect()` gives up.
    pub connect_attempts: u32,
    /// Bound on a single dial attempt.
    pub connect_timeout: Duration,
    /// Pause between failed attempts.
    pub retry_delay: Duration,
    /// Silence on the line after which the peer is probed.
    pub liveness_interval: Duration,
    /// How long a probe waits for its reply.
    pub probe_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(500),
            liveness_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

// ── Dialer ───────────────────────────────────────────────────────

/// Opens the byte stream for one connect attempt.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, info: &ConnectionInfo) -> io::Result<TcpStream>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, info: &ConnectionInfo) -> io::Result<TcpStream> {
        TcpStream::connect((info.host(), info.port())).await
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

// ── Connection ───────────────────────────────────────────────────

/// Why [`Connection::run_loop_forever`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// `disconnect()` was called.
    Disconnected,
    /// The liveness probe failed and the connection was dropped.
    LivenessFailed,
}

struct Session {
    id: u64,
    writer: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

pub struct Connection {
    info: ConnectionInfo,
    options: ConnectOptions,
    events: Arc<EventDispatcher>,
    dialer: Arc<dyn Dialer>,
    probe: Arc<dyn LivenessProbe>,
    phase: Mutex<ConnectionPhase>,
    session: Mutex<Option<Session>>,
    /// Read half of the current session, tagged with its session id.
    reader: Mutex<Option<(u64, OwnedReadHalf)>>,
    next_session: AtomicU64,
}

impl Connection {
    pub fn new(
        info: ConnectionInfo,
        options: ConnectOptions,
        events: Arc<EventDispatcher>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            info,
            options,
            events,
            dialer: Arc::new(TcpDialer),
            probe,
            phase: Mutex::new(ConnectionPhase::default()),
            session: Mutex::new(None),
            reader: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    /// Replace the transport used by `connect()`.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn phase(&self) -> ConnectionPhase {
        lock(&self.phase).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.phase).is_connected()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Dial the device, retrying transient failures.
    pub async fn connect(&self) -> Result<(), HubError> {
        lock(&self.phase).begin_connect()?;
        info!(peer = %self.info, "connecting");
        self.events.post(HubEvent::BeforeConnect);

        let attempts = self.options.connect_attempts.max(1);
        for attempt in 0..attempts {
            let dial = self.dialer.dial(&self.info);
            match tokio::time::timeout(self.options.connect_timeout, dial).await {
                Ok(Ok(stream)) => return self.establish(stream),
                Ok(Err(e)) if is_transient(&e) => {
                    debug!(attempt, attempts, error = %e, "connect attempt failed");
                }
                Ok(Err(e)) => {
                    warn!(peer = %self.info, error = %e, "connect failed");
                    self.fail_connect();
                    return Err(e.into());
                }
                Err(_) => {
                    debug!(attempt, attempts, "connect attempt timed out");
                }
            }
            self.events.post(HubEvent::BeforeConnectRetry { attempt });
            if attempt + 1 < attempts && !self.options.retry_delay.is_zero() {
                tokio::time::sleep(self.options.retry_delay).await;
            }
        }

        warn!(peer = %self.info, attempts, "giving up on connect");
        self.fail_connect();
        Err(HubError::ConnectFailed { attempts })
    }

    fn fail_connect(&self) {
        let _ = lock(&self.phase).abort_connect();
        self.events.post(HubEvent::ConnectFail);
    }

    fn establish(&self, stream: TcpStream) -> Result<(), HubError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle");
        }
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);

        // Writer task: queue -> network. Ends once every sender is gone.
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    warn!(error = %e, "network write error");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        *lock(&self.session) = Some(Session {
            id,
            writer: tx,
            cancel: CancellationToken::new(),
        });
        *lock(&self.reader) = Some((id, read_half));
        lock(&self.phase).complete_connect()?;

        info!(peer = %self.info, session = id, "connected");
        self.events.post(HubEvent::AfterConnect);
        Ok(())
    }

    /// Close the current session. Returns `false` if there was none.
    pub fn disconnect(&self) -> bool {
        let session = lock(&self.session).take();
        match session {
            Some(session) => {
                self.close(session);
                true
            }
            None => false,
        }
    }

    /// Close session `id` only if it is still the current one.
    fn disconnect_session(&self, id: u64) -> bool {
        let session = {
            let mut current = lock(&self.session);
            if current.as_ref().is_some_and(|s| s.id == id) {
                current.take()
            } else {
                None
            }
        };
        match session {
            Some(session) => {
                self.close(session);
                true
            }
            None => false,
        }
    }

    fn close(&self, session: Session) {
        self.events.post(HubEvent::BeforeDisconnect);
        session.cancel.cancel();
        drop(session.writer);
        {
            let mut reader = lock(&self.reader);
            if reader.as_ref().is_some_and(|(rid, _)| *rid == session.id) {
                reader.take();
            }
        }
        lock(&self.phase).force_disconnect();
        info!(peer = %self.info, session = session.id, "disconnected");
        self.events.post(HubEvent::AfterDisconnect);
    }

    // ── I/O ──────────────────────────────────────────────────────

    /// Queue a raw frame for the writer task.
    pub fn send(&self, frame: Bytes) -> Result<(), HubError> {
        let session = lock(&self.session);
        let session = session.as_ref().ok_or(HubError::NotConnected)?;
        session.writer.send(frame)?;
        Ok(())
    }

    fn session_writer(&self, id: u64) -> Option<mpsc::UnboundedSender<Bytes>> {
        lock(&self.session)
            .as_ref()
            .filter(|s| s.id == id)
            .map(|s| s.writer.clone())
    }

    /// Drain whatever is readable right now without waiting.
    ///
    /// Posts a single `NewData` with everything read and returns its
    /// length.
    pub fn poll_once(&self) -> Result<usize, HubError> {
        if lock(&self.session).is_none() {
            return Err(HubError::NotConnected);
        }
        let (id, reader) = lock(&self.reader).take().ok_or(HubError::ReaderBusy)?;

        let mut buf = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];
        let mut failure = None;
        loop {
            match reader.try_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let still_current = lock(&self.session).as_ref().is_some_and(|s| s.id == id);
        if still_current {
            *lock(&self.reader) = Some((id, reader));
        }

        let read = buf.len();
        if read > 0 {
            self.events.post(HubEvent::NewData(buf.freeze()));
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(read),
        }
    }

    /// Read until the session ends.
    ///
    /// Every chunk read is posted as `NewData`. After a quiet
    /// `liveness_interval`, end of stream or a read error, the injected
    /// probe decides whether the peer is alive; if not, `TimeoutAck` is
    /// posted, the connection is closed and the loop returns. Resuming
    /// takes a new `connect()` and a new call to this method.
    pub async fn run_loop_forever(&self) -> Result<LoopExit, HubError> {
        let (id, cancel) = {
            let session = lock(&self.session);
            let session = session.as_ref().ok_or(HubError::NotConnected)?;
            (session.id, session.cancel.clone())
        };
        let mut reader = {
            let mut slot = lock(&self.reader);
            match slot.take() {
                Some((rid, reader)) if rid == id => reader,
                other => {
                    *slot = other;
                    return Err(HubError::ReaderBusy);
                }
            }
        };

        debug!(peer = %self.info, session = id, "receive loop started");
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(LoopExit::Disconnected),
                read = tokio::time::timeout(
                    self.options.liveness_interval,
                    reader.read_buf(&mut buf),
                ) => read,
            };

            match read {
                Ok(Ok(n)) if n > 0 => {
                    self.events.post(HubEvent::NewData(buf.split().freeze()));
                    continue;
                }
                Ok(Ok(_)) => debug!(session = id, "peer closed the stream"),
                Ok(Err(e)) => debug!(session = id, error = %e, "read failed"),
                Err(_) => debug!(session = id, "line idle"),
            }

            let alive = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(LoopExit::Disconnected),
                alive = self.check_liveness(id, &mut reader) => alive,
            };
            if !alive {
                warn!(peer = %self.info, session = id, "liveness probe failed");
                self.events.post(HubEvent::TimeoutAck);
                self.disconnect_session(id);
                return Ok(LoopExit::LivenessFailed);
            }
        }
    }

    async fn check_liveness(&self, id: u64, reader: &mut OwnedReadHalf) -> bool {
        self.events.post(HubEvent::BeforeAck);
        let Some(writer) = self.session_writer(id) else {
            return false;
        };
        let mut link = ProbeLink::new(reader, writer, self.options.probe_timeout);
        let alive = self.probe.probe(&mut link).await;
        let forwarded = link.into_forwarded();
        if !alive {
            return false;
        }
        if !forwarded.is_empty() {
            self.events.post(HubEvent::NewData(forwarded));
        }
        self.events.post(HubEvent::AfterAck);
        true
    }
}

impl Transmit for Connection {
    fn transmit(&self, frame: Bytes) -> Result<(), HubError> {
        self.send(frame)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::probe::PingProbe;

    fn connection(port: u16) -> Connection {
        Connection::new(
            ConnectionInfo::new("127.0.0.1", port),
            ConnectOptions {
                connect_attempts: 2,
                connect_timeout: Duration::from_millis(200),
                retry_delay: Duration::ZERO,
                ..ConnectOptions::default()
            },
            Arc::new(EventDispatcher::new()),
            Arc::new(PingProbe),
        )
    }

    #[test]
    fn info_display_and_defaults() {
        let info = ConnectionInfo::with_default_port("10.1.1.20");
        assert_eq!(info.to_string(), "10.1.1.20:9990");
        let options = ConnectOptions::default();
        assert_eq!(options.connect_attempts, 5);
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.liveness_interval, Duration::from_secs(15));
    }

    #[test]
    fn transient_kinds() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn idle_connection_rejects_io() {
        let conn = connection(1);
        assert!(!conn.disconnect());
        assert!(matches!(conn.send(Bytes::from_static(b"x")), Err(HubError::NotConnected)));
        assert!(matches!(conn.poll_once(), Err(HubError::NotConnected)));
        assert!(matches!(
            conn.run_loop_forever().await,
            Err(HubError::NotConnected)
        ));
        assert!(conn.phase().is_disconnected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = connection(listener.local_addr().unwrap().port());
        tokio_test::assert_ok!(conn.connect().await);
        assert!(conn.is_connected());
        assert!(matches!(
            conn.connect().await,
            Err(HubError::InvalidTransition(_))
        ));

        assert!(conn.disconnect());
        assert!(!conn.disconnect());
        assert!(conn.phase().is_disconnected());
    }
}
