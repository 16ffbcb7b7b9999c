//! Decoded protocol frames.
//!
//! A frame is either a bare `ACK`/`NAK` or a titled [`Block`]. Block
//! lines come in two conventions:
//!
//! ```text
//! VIDEOHUB DEVICE:            INPUT LABELS:
//! Model name: Smart 40x40     0 Camera 1
//! Video inputs: 40            1 Camera 2
//! ```
//!
//! so field keys are a tagged [`FieldKey`] rather than a single type.

use std::fmt;

use crate::error::HubError;
use crate::message::{ACK, BlockTitle, NAK};

// ── FieldKey ─────────────────────────────────────────────────────

/// Key of a block field: a header name or a port index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKey {
    /// `key: value` header lines.
    Name(String),
    /// `index value` lines of labels, routes and locks.
    Index(u32),
}

impl FieldKey {
    /// Parse the key segment of an `index value` line.
    fn from_segment(segment: &str) -> Self {
        match segment.parse::<u32>() {
            Ok(index) => FieldKey::Index(index),
            Err(_) => FieldKey::Name(segment.to_string()),
        }
    }

    pub fn as_index(&self) -> Option<u32> {
        match self {
            FieldKey::Index(i) => Some(*i),
            FieldKey::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            FieldKey::Name(n) => Some(n),
            FieldKey::Index(_) => None,
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKey::Name(n) => f.write_str(n),
            FieldKey::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<u32> for FieldKey {
    fn from(index: u32) -> Self {
        FieldKey::Index(index)
    }
}

impl From<&str> for FieldKey {
    fn from(name: &str) -> Self {
        FieldKey::Name(name.to_string())
    }
}

impl From<String> for FieldKey {
    fn from(name: String) -> Self {
        FieldKey::Name(name)
    }
}

// ── Block ────────────────────────────────────────────────────────

/// A titled block of fields reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    title: String,
    fields: Vec<(FieldKey, String)>,
}

impl Block {
    /// Decode the content of one frame (delimiter already removed).
    pub fn parse(frame: &[u8]) -> Result<Self, HubError> {
        if !frame.is_ascii() {
            return Err(HubError::NonAscii);
        }
        let text = std::str::from_utf8(frame).map_err(|_| HubError::NonAscii)?;
        let mut lines = text.split('\n');

        let header = lines.next().unwrap_or_default();
        let title = header.strip_suffix(':').unwrap_or(header).to_string();
        let indexed = BlockTitle::parse(&title).is_some_and(BlockTitle::is_indexed);

        let mut block = Block {
            title,
            fields: Vec::new(),
        };
        for line in lines.filter(|l| !l.is_empty()) {
            let (key, value) = if indexed {
                parse_indexed_line(line)
            } else {
                match line.split_once(':') {
                    Some((key, value)) => (
                        FieldKey::Name(key.to_string()),
                        value.strip_prefix(' ').unwrap_or(value).to_string(),
                    ),
                    None => parse_indexed_line(line),
                }
            };
            block.insert(key, value);
        }
        Ok(block)
    }

    fn insert(&mut self, key: FieldKey, value: String) {
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// The title if it is one this client understands.
    pub fn known_title(&self) -> Option<BlockTitle> {
        BlockTitle::parse(&self.title)
    }

    /// Fields in wire order.
    pub fn fields(&self) -> &[(FieldKey, String)] {
        &self.fields
    }

    pub fn get(&self, key: &FieldKey) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} fields)", self.title, self.fields.len())
    }
}

fn parse_indexed_line(line: &str) -> (FieldKey, String) {
    let (key, value) = line.split_once(' ').unwrap_or((line, ""));
    (FieldKey::from_segment(key), value.to_string())
}

// ── Frame ────────────────────────────────────────────────────────

/// One decoded unit of the incoming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The in-flight command was accepted.
    Ack,
    /// The in-flight command was rejected.
    Nak,
    /// A state report.
    Block(Block),
}

impl Frame {
    pub fn parse(frame: &[u8]) -> Result<Self, HubError> {
        match frame {
            ACK => Ok(Frame::Ack),
            NAK => Ok(Frame::Nak),
            _ => Block::parse(frame).map(Frame::Block),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_has_named_keys() {
        let block = Block::parse(
            b"VIDEOHUB DEVICE:\nModel name: Smart Videohub 40x40\nVideo inputs: 40\n",
        )
        .unwrap();
        assert_eq!(block.title(), "VIDEOHUB DEVICE");
        assert_eq!(
            block.fields(),
            &[
                (FieldKey::from("Model name"), "Smart Videohub 40x40".to_string()),
                (FieldKey::from("Video inputs"), "40".to_string()),
            ]
        );
    }

    #[test]
    fn indexed_block_has_integer_keys() {
        let block = Block::parse(b"INPUT LABELS:\n0 Camera 1\n1 Camera 2\n").unwrap();
        assert_eq!(block.title(), "INPUT LABELS");
        assert_eq!(block.known_title(), Some(BlockTitle::InputLabels));
        assert_eq!(block.get(&FieldKey::Index(0)), Some("Camera 1"));
        assert_eq!(block.get(&FieldKey::Index(1)), Some("Camera 2"));
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn label_with_colon_stays_indexed() {
        let block = Block::parse(b"OUTPUT LABELS:\n4 Mon: Left\n").unwrap();
        assert_eq!(block.get(&FieldKey::Index(4)), Some("Mon: Left"));
    }

    #[test]
    fn value_after_first_colon_is_kept_whole() {
        let block = Block::parse(b"NETWORK:\nAddress: 10.0.0.1:9990\n").unwrap();
        assert_eq!(block.get(&"Address".into()), Some("10.0.0.1:9990"));
    }

    #[test]
    fn only_one_leading_space_is_stripped() {
        let block = Block::parse(b"VIDEOHUB DEVICE:\nFriendly name:  Rack A\nEmpty:\n").unwrap();
        assert_eq!(block.get(&"Friendly name".into()), Some(" Rack A"));
        assert_eq!(block.get(&"Empty".into()), Some(""));
    }

    #[test]
    fn non_numeric_index_is_a_name() {
        let block = Block::parse(b"CUSTOM:\nfoo bar baz\n7\n").unwrap();
        assert_eq!(block.get(&"foo".into()), Some("bar baz"));
        assert_eq!(block.get(&FieldKey::Index(7)), Some(""));
    }

    #[test]
    fn title_without_colon_is_untouched() {
        let block = Block::parse(b"END PRELUDE").unwrap();
        assert_eq!(block.title(), "END PRELUDE");
        assert!(block.is_empty());
        assert_eq!(Block::parse(b"END PRELUDE:").unwrap().title(), "END PRELUDE");
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let block = Block::parse(b"VIDEO OUTPUT ROUTING:\n0 1\n0 5\n").unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(block.get(&FieldKey::Index(0)), Some("5"));
    }

    #[test]
    fn non_ascii_is_rejected() {
        let err = Block::parse("INPUT LABELS:\n0 Caméra\n".as_bytes()).unwrap_err();
        assert!(matches!(err, HubError::NonAscii));
    }

    #[test]
    fn ack_and_nak_frames() {
        assert_eq!(Frame::parse(b"ACK").unwrap(), Frame::Ack);
        assert_eq!(Frame::parse(b"NAK").unwrap(), Frame::Nak);
        assert!(matches!(
            Frame::parse(b"ACKNOWLEDGED:\n").unwrap(),
            Frame::Block(_)
        ));
    }
}
