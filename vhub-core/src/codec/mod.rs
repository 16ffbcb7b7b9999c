//! Blank-line framing for the VideoHub text protocol.
//!
//! [`BlockCodec`] implements the `tokio_util` codec traits so it can be
//! driven by hand over an accumulating buffer (as the hub does) or
//! wrapped in `Framed` for stream-based peers.
//!
//! A decode error is recoverable: the offending bytes have already been
//! consumed from the buffer when the error is returned, so the caller
//! may keep calling `decode` on the remainder.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::block::Frame;
use crate::command::Command;
use crate::error::HubError;
use crate::message::FRAME_DELIMITER;

/// Largest undelimited frame the decoder buffers before giving up.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BlockCodec {
    max_frame_size: usize,
}

impl BlockCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delimiter(src: &[u8]) -> Option<usize> {
    src.windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

impl Decoder for BlockCodec {
    type Item = Frame;
    type Error = HubError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Stray newlines between frames carry nothing.
            let leading = src.iter().take_while(|b| **b == b'\n').count();
            src.advance(leading);

            let Some(end) = find_delimiter(src) else {
                if src.len() > self.max_frame_size {
                    let size = src.len();
                    src.clear();
                    return Err(HubError::FrameTooLarge {
                        size,
                        max: self.max_frame_size,
                    });
                }
                return Ok(None);
            };

            let frame = src.split_to(end);
            src.advance(FRAME_DELIMITER.len());
            if frame.is_empty() {
                continue;
            }
            return Frame::parse(&frame).map(Some);
        }
    }
}

impl Encoder<&Command> for BlockCodec {
    type Error = HubError;

    fn encode(&mut self, item: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.serialize()?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
