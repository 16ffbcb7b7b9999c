//! Wire vocabulary of the VideoHub control protocol.
//!
//! Block titles are matched exactly; unknown titles are not an error,
//! they are simply not mirrored.

use std::fmt;

/// Default TCP port of the control protocol.
pub const DEFAULT_PORT: u16 = 9990;

/// Separator between frames on the wire.
pub const FRAME_DELIMITER: &[u8] = b"\n\n";

/// Single-word acknowledgement frames.
pub const ACK: &[u8] = b"ACK";
pub const NAK: &[u8] = b"NAK";

/// Keep-alive request sent by the liveness probe.
pub const PING_FRAME: &[u8] = b"PING:\n\n";

/// Reply the device sends to [`PING_FRAME`].
pub const ACK_FRAME: &[u8] = b"ACK\n\n";

/// Lock field values understood by the device.
pub const LOCKED: &str = "L";
pub const UNLOCKED: &str = "U";

// ── BlockTitle ───────────────────────────────────────────────────

/// Block titles this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTitle {
    /// Protocol version announcement, first block after connect.
    ProtocolPreamble,
    /// Model name, port counts, unique id.
    VideohubDevice,
    /// Input port labels.
    InputLabels,
    /// Output port labels.
    OutputLabels,
    /// Destination → source routing table.
    VideoOutputRouting,
    /// Output lock states.
    VideoOutputLocks,
    /// Marks the end of the initial state dump.
    EndPrelude,
    /// Keep-alive request.
    Ping,
}

impl BlockTitle {
    pub const ALL: [BlockTitle; 8] = [
        BlockTitle::ProtocolPreamble,
        BlockTitle::VideohubDevice,
        BlockTitle::InputLabels,
        BlockTitle::OutputLabels,
        BlockTitle::VideoOutputRouting,
        BlockTitle::VideoOutputLocks,
        BlockTitle::EndPrelude,
        BlockTitle::Ping,
    ];

    /// The title as it appears on the wire, without the trailing colon.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockTitle::ProtocolPreamble => "PROTOCOL PREAMBLE",
            BlockTitle::VideohubDevice => "VIDEOHUB DEVICE",
            BlockTitle::InputLabels => "INPUT LABELS",
            BlockTitle::OutputLabels => "OUTPUT LABELS",
            BlockTitle::VideoOutputRouting => "VIDEO OUTPUT ROUTING",
            BlockTitle::VideoOutputLocks => "VIDEO OUTPUT LOCKS",
            BlockTitle::EndPrelude => "END PRELUDE",
            BlockTitle::Ping => "PING",
        }
    }

    /// Look up a wire title.
    pub fn parse(title: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == title)
    }

    /// Blocks whose `key: value` lines describe the device itself.
    pub fn is_info(self) -> bool {
        matches!(
            self,
            BlockTitle::ProtocolPreamble | BlockTitle::VideohubDevice
        )
    }

    /// Blocks whose lines are always `index value` pairs.
    pub fn is_indexed(self) -> bool {
        matches!(
            self,
            BlockTitle::InputLabels
                | BlockTitle::OutputLabels
                | BlockTitle::VideoOutputRouting
                | BlockTitle::VideoOutputLocks
        )
    }
}

impl fmt::Display for BlockTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
