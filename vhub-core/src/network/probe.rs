//! Liveness probing.
//!
//! The receive loop knows only that the line has been quiet; deciding
//! whether the peer is still there is a protocol question, answered by
//! an injected [`LivenessProbe`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::block::Frame;
use crate::codec::BlockCodec;
use crate::error::HubError;
use crate::message::PING_FRAME;

/// Protocol-specific round trip run after a read timeout.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns `true` if the peer answered.
    async fn probe(&self, link: &mut ProbeLink<'_>) -> bool;
}

/// The socket as seen by a probe.
///
/// Bytes a probe receives but does not consume must be handed back with
/// [`forward`](Self::forward); the receive loop then delivers them as
/// ordinary data.
pub struct ProbeLink<'a> {
    reader: &'a mut OwnedReadHalf,
    writer: mpsc::UnboundedSender<Bytes>,
    deadline: Instant,
    forwarded: BytesMut,
}

impl<'a> ProbeLink<'a> {
    /// Every `recv` on the link shares one `timeout` budget.
    pub(crate) fn new(
        reader: &'a mut OwnedReadHalf,
        writer: mpsc::UnboundedSender<Bytes>,
        timeout: Duration,
    ) -> Self {
        Self {
            reader,
            writer,
            deadline: Instant::now() + timeout,
            forwarded: BytesMut::new(),
        }
    }

    pub fn send(&self, frame: Bytes) -> Result<(), HubError> {
        self.writer.send(frame)?;
        Ok(())
    }

    /// Read whatever arrives before the probe deadline.
    ///
    /// `Ok(None)` means nothing arrived: deadline passed or end of stream.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, HubError> {
        let mut buf = BytesMut::with_capacity(4096);
        match tokio::time::timeout_at(self.deadline, self.reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => Ok(None),
            Ok(Ok(_)) => Ok(Some(buf.freeze())),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Return unconsumed bytes to the receive loop.
    pub fn forward(&mut self, data: &[u8]) {
        self.forwarded.extend_from_slice(data);
    }

    pub(crate) fn into_forwarded(self) -> Bytes {
        self.forwarded.freeze()
    }
}

/// Sends `PING:` and waits for the device's `ACK`.
///
/// The ping's `ACK` may follow unsolicited blocks or arrive in pieces, so
/// the reply is cut into frames and the first `ACK` frame is swallowed
/// wherever it sits. Every other byte is forwarded untouched. That `ACK`
/// must never reach the command queue, where it would answer the
/// in-flight command.
///
/// A reply without an `ACK` before the deadline still counts as alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProbe;

#[async_trait]
impl LivenessProbe for PingProbe {
    async fn probe(&self, link: &mut ProbeLink<'_>) -> bool {
        if let Err(e) = link.send(Bytes::from_static(PING_FRAME)) {
            debug!(error = %e, "ping not sent");
            return false;
        }

        let mut codec = BlockCodec::new();
        let mut pending = BytesMut::new();
        let mut replied = false;
        loop {
            match link.recv().await {
                Ok(Some(chunk)) => {
                    replied = true;
                    pending.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "ping reply failed");
                    return false;
                }
            }
            if take_ack(&mut codec, &mut pending, link) {
                link.forward(&pending);
                return true;
            }
        }

        if replied {
            debug!("ping answered without ACK");
        }
        link.forward(&pending);
        replied
    }
}

/// Forward complete frames from `pending` until an `ACK` is found and
/// dropped. Returns `false`, leaving any partial frame in `pending`, if
/// there is none yet.
fn take_ack(codec: &mut BlockCodec, pending: &mut BytesMut, link: &mut ProbeLink<'_>) -> bool {
    loop {
        let before = pending.clone();
        let decoded = codec.decode(pending);
        let consumed = before.len() - pending.len();
        match decoded {
            Ok(Some(Frame::Ack)) => return true,
            Ok(None) => {
                // Only stray separators were consumed; the partial frame
                // stays in `pending`.
                return false;
            }
            // Blocks, NAKs and undecodable bytes go back as they came.
            Ok(Some(_)) | Err(_) => link.forward(&before[..consumed]),
        }
    }
}
